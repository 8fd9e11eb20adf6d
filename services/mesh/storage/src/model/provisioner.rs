//! Provisioner records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::range::{AllocatedRange, RangeKind};

/// Name given to a provisioner when none is supplied
pub const DEFAULT_PROVISIONER_NAME: &str = "Mesh Provisioner";

/// A provisioner sharing the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provisioner {
    /// Stable identifier
    pub uuid: Uuid,
    /// Friendly name
    pub name: String,
    /// Owning network id
    pub mesh_uuid: Uuid,
    /// Address of the provisioner's own node, if it has one
    pub unicast_address: Option<u16>,
    /// Allocated unicast ranges, sorted by low bound
    pub unicast_ranges: Vec<AllocatedRange>,
    /// Allocated group ranges, sorted by low bound
    pub group_ranges: Vec<AllocatedRange>,
    /// Allocated scene ranges, sorted by low bound
    pub scene_ranges: Vec<AllocatedRange>,
}

impl Provisioner {
    /// Create a provisioner with no ranges
    pub fn new(name: Option<&str>, mesh_uuid: Uuid) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.unwrap_or(DEFAULT_PROVISIONER_NAME).to_string(),
            mesh_uuid,
            unicast_address: None,
            unicast_ranges: Vec::new(),
            group_ranges: Vec::new(),
            scene_ranges: Vec::new(),
        }
    }

    /// Ranges of one kind
    pub fn ranges(&self, kind: RangeKind) -> &[AllocatedRange] {
        match kind {
            RangeKind::Unicast => &self.unicast_ranges,
            RangeKind::Group => &self.group_ranges,
            RangeKind::Scene => &self.scene_ranges,
        }
    }

    pub(crate) fn ranges_mut(&mut self, kind: RangeKind) -> &mut Vec<AllocatedRange> {
        match kind {
            RangeKind::Unicast => &mut self.unicast_ranges,
            RangeKind::Group => &mut self.group_ranges,
            RangeKind::Scene => &mut self.scene_ranges,
        }
    }

    /// Whether `value` falls in one of this provisioner's ranges of `kind`
    pub fn owns(&self, kind: RangeKind, value: u16) -> bool {
        self.ranges(kind).iter().any(|r| r.contains(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_name() {
        let mesh = Uuid::new_v4();
        let provisioner = Provisioner::new(None, mesh);
        assert_eq!(provisioner.name, DEFAULT_PROVISIONER_NAME);
        assert_eq!(provisioner.mesh_uuid, mesh);
        assert!(provisioner.ranges(RangeKind::Group).is_empty());

        let named = Provisioner::new(Some("Phone"), mesh);
        assert_eq!(named.name, "Phone");
        assert_ne!(named.uuid, provisioner.uuid);
    }
}
