//! The mesh network aggregate.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};
use uuid::Uuid;

use mesh_wire::address::{GROUP_MAX, GROUP_MIN, UNICAST_MAX, UNICAST_MIN};
use mesh_wire::MAX_SEQ;

use super::key::MeshKey;
use super::provisioner::Provisioner;
use super::range::{AllocatedRange, RangeKind};
use crate::StorageError;

/// Largest 12-bit key index
pub const MAX_KEY_INDEX: u16 = 0x0FFF;

/// Default unicast range handed to a new provisioner
pub const DEFAULT_UNICAST_RANGE: AllocatedRange = AllocatedRange {
    low: 0x0001,
    high: 0x199A,
};

/// Default group range handed to a new provisioner
pub const DEFAULT_GROUP_RANGE: AllocatedRange = AllocatedRange {
    low: 0xC000,
    high: 0xCC9A,
};

/// Default scene range handed to a new provisioner
pub const DEFAULT_SCENE_RANGE: AllocatedRange = AllocatedRange {
    low: 0x0001,
    high: 0x3333,
};

/// Key refresh procedure phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRefreshPhase {
    /// No refresh in progress
    #[default]
    Normal,
    /// Phase 1: new key distributed, old key still transmitted, both accepted
    Distributing,
    /// Phase 2: new key transmitted, both keys still accepted
    Finalizing,
}

/// A network key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkKey {
    /// 12-bit key index
    pub index: u16,
    /// Friendly name
    pub name: String,
    /// Current key
    pub key: MeshKey,
    /// Previous key while a refresh is in progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_key: Option<MeshKey>,
    /// Key refresh phase
    #[serde(default)]
    pub phase: KeyRefreshPhase,
}

impl NetworkKey {
    /// Create a key in the normal phase
    pub fn new(index: u16, name: impl Into<String>, key: MeshKey) -> Self {
        Self {
            index,
            name: name.into(),
            key,
            old_key: None,
            phase: KeyRefreshPhase::Normal,
        }
    }

    /// Key used for outbound traffic; the old key until the refresh reaches
    /// [`KeyRefreshPhase::Finalizing`]
    pub fn transmit_key(&self) -> &MeshKey {
        match (&self.phase, &self.old_key) {
            (KeyRefreshPhase::Distributing, Some(old)) => old,
            _ => &self.key,
        }
    }

    /// Keys accepted on inbound traffic
    pub fn receive_keys(&self) -> Vec<&MeshKey> {
        let mut keys = vec![&self.key];
        if self.phase != KeyRefreshPhase::Normal {
            if let Some(old) = &self.old_key {
                keys.push(old);
            }
        }
        keys
    }

    /// Start a key refresh with a new key
    pub fn begin_key_refresh(&mut self, new_key: MeshKey) -> Result<(), StorageError> {
        if self.phase != KeyRefreshPhase::Normal {
            return Err(StorageError::Invalid(format!(
                "key refresh already in progress for net key {}",
                self.index
            )));
        }
        let old = std::mem::replace(&mut self.key, new_key);
        self.old_key = Some(old);
        self.phase = KeyRefreshPhase::Distributing;
        Ok(())
    }

    /// Advance the key refresh phase; the old key is dropped when returning to normal
    pub fn advance_key_refresh(&mut self) -> KeyRefreshPhase {
        self.phase = match self.phase {
            KeyRefreshPhase::Normal => KeyRefreshPhase::Normal,
            KeyRefreshPhase::Distributing => KeyRefreshPhase::Finalizing,
            KeyRefreshPhase::Finalizing => {
                self.old_key = None;
                KeyRefreshPhase::Normal
            }
        };
        self.phase
    }
}

/// An application key bound to one network key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationKey {
    /// 12-bit key index
    pub index: u16,
    /// Friendly name
    pub name: String,
    /// Index of the bound network key
    pub bound_net_key: u16,
    /// Key bytes
    pub key: MeshKey,
}

/// A provisioned node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Device UUID
    pub uuid: Uuid,
    /// Friendly name
    pub name: String,
    /// Address of the primary element
    pub unicast_address: u16,
    /// Number of elements, each with its own consecutive address
    pub element_count: u8,
    /// Device key
    pub device_key: MeshKey,
    /// Next 24-bit sequence number to use
    pub sequence_number: u32,
    /// Known network key indexes
    pub net_keys: Vec<u16>,
    /// Known application key indexes
    pub app_keys: Vec<u16>,
    /// Supported model identifiers
    #[serde(default)]
    pub models: Vec<u32>,
}

impl Node {
    /// Create a node with sequence number 0 bound to the primary network key
    pub fn new(
        uuid: Uuid,
        name: impl Into<String>,
        unicast_address: u16,
        element_count: u8,
        device_key: MeshKey,
    ) -> Self {
        Self {
            uuid,
            name: name.into(),
            unicast_address,
            element_count,
            device_key,
            sequence_number: 0,
            net_keys: vec![0],
            app_keys: Vec::new(),
            models: Vec::new(),
        }
    }

    /// Addresses occupied by the node's elements
    pub fn address_range(&self) -> AllocatedRange {
        let high = self
            .unicast_address
            .saturating_add(self.element_count.max(1) as u16 - 1);
        AllocatedRange {
            low: self.unicast_address,
            high,
        }
    }

    /// Whether `address` belongs to one of this node's elements
    pub fn has_address(&self, address: u16) -> bool {
        self.address_range().contains(address)
    }
}

/// A named group address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group address (0xC000..=0xFEFF)
    pub address: u16,
    /// Friendly name
    pub name: String,
}

/// IV index and update state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IvIndex {
    /// Current IV index
    pub index: u32,
    /// IV update procedure in progress
    pub update_active: bool,
}

impl IvIndex {
    /// IV index used for transmission
    pub fn transmit_index(&self) -> u32 {
        if self.update_active {
            self.index.saturating_sub(1)
        } else {
            self.index
        }
    }

    /// IV index a received PDU was sent with, from its IVI bit
    pub fn receive_index(&self, ivi: u8) -> Option<u32> {
        if (self.index & 1) as u8 == (ivi & 1) {
            Some(self.index)
        } else {
            self.index.checked_sub(1)
        }
    }
}

/// Aggregate root of the mesh data model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshNetwork {
    /// Network identifier
    pub id: Uuid,
    /// Friendly name
    pub name: String,
    /// Network keys
    pub net_keys: Vec<NetworkKey>,
    /// Application keys
    pub app_keys: Vec<ApplicationKey>,
    /// Provisioners sharing the network
    pub provisioners: Vec<Provisioner>,
    /// Provisioned nodes
    pub nodes: Vec<Node>,
    /// Groups
    pub groups: Vec<Group>,
    /// IV index state
    pub iv_index: IvIndex,
}

impl MeshNetwork {
    /// Create an empty network
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            net_keys: Vec::new(),
            app_keys: Vec::new(),
            provisioners: Vec::new(),
            nodes: Vec::new(),
            groups: Vec::new(),
            iv_index: IvIndex::default(),
        }
    }

    /// Create a network with a random primary network key, one application
    /// key and a provisioner owning the default ranges with its own node.
    pub fn generate(name: impl Into<String>, provisioner_name: Option<&str>) -> Self {
        let mut network = Self::new(name);
        network
            .net_keys
            .push(NetworkKey::new(0, "Primary Network Key", MeshKey::random()));
        network.app_keys.push(ApplicationKey {
            index: 0,
            name: "Application Key 1".to_string(),
            bound_net_key: 0,
            key: MeshKey::random(),
        });

        let mut provisioner = Provisioner::new(provisioner_name, network.id);
        provisioner.unicast_ranges.push(DEFAULT_UNICAST_RANGE);
        provisioner.group_ranges.push(DEFAULT_GROUP_RANGE);
        provisioner.scene_ranges.push(DEFAULT_SCENE_RANGE);
        provisioner.unicast_address = Some(DEFAULT_UNICAST_RANGE.low);

        let mut node = Node::new(
            provisioner.uuid,
            provisioner.name.clone(),
            DEFAULT_UNICAST_RANGE.low,
            1,
            MeshKey::random(),
        );
        node.app_keys.push(0);

        network.provisioners.push(provisioner);
        network.nodes.push(node);

        info!("Generated mesh network {} ({})", network.name, network.id);
        network
    }

    /// The primary (index 0) network key
    pub fn primary_net_key(&self) -> Option<&NetworkKey> {
        self.net_key(0)
    }

    /// Network key by index
    pub fn net_key(&self, index: u16) -> Option<&NetworkKey> {
        self.net_keys.iter().find(|k| k.index == index)
    }

    /// Mutable network key by index
    pub fn net_key_mut(&mut self, index: u16) -> Option<&mut NetworkKey> {
        self.net_keys.iter_mut().find(|k| k.index == index)
    }

    /// Application key by index
    pub fn app_key(&self, index: u16) -> Option<&ApplicationKey> {
        self.app_keys.iter().find(|k| k.index == index)
    }

    /// Add a network key
    pub fn add_net_key(&mut self, key: NetworkKey) -> Result<(), StorageError> {
        if key.index > MAX_KEY_INDEX {
            return Err(StorageError::Invalid(format!("net key index {}", key.index)));
        }
        if self.net_key(key.index).is_some() {
            return Err(StorageError::Invalid(format!(
                "net key {} already exists",
                key.index
            )));
        }
        self.net_keys.push(key);
        Ok(())
    }

    /// Add an application key bound to an existing network key
    pub fn add_app_key(&mut self, key: ApplicationKey) -> Result<(), StorageError> {
        if key.index > MAX_KEY_INDEX {
            return Err(StorageError::Invalid(format!("app key index {}", key.index)));
        }
        if self.app_key(key.index).is_some() {
            return Err(StorageError::Invalid(format!(
                "app key {} already exists",
                key.index
            )));
        }
        if self.net_key(key.bound_net_key).is_none() {
            return Err(StorageError::Invalid(format!(
                "app key {} bound to unknown net key {}",
                key.index, key.bound_net_key
            )));
        }
        self.app_keys.push(key);
        Ok(())
    }

    /// Provisioner by id
    pub fn provisioner(&self, uuid: Uuid) -> Option<&Provisioner> {
        self.provisioners.iter().find(|p| p.uuid == uuid)
    }

    pub(crate) fn provisioner_index(&self, uuid: Uuid) -> Option<usize> {
        self.provisioners.iter().position(|p| p.uuid == uuid)
    }

    /// Add a provisioner; its ranges must not overlap other provisioners'
    pub fn add_provisioner(&mut self, provisioner: Provisioner) -> Result<(), StorageError> {
        if provisioner.mesh_uuid != self.id {
            return Err(StorageError::Invalid(format!(
                "provisioner {} belongs to network {}",
                provisioner.uuid, provisioner.mesh_uuid
            )));
        }
        if self.provisioner(provisioner.uuid).is_some() {
            return Err(StorageError::Invalid(format!(
                "provisioner {} already exists",
                provisioner.uuid
            )));
        }
        for kind in [RangeKind::Unicast, RangeKind::Group, RangeKind::Scene] {
            for range in provisioner.ranges(kind) {
                range.check_bounds(kind)?;
                if let Some(other) = self.range_owner(kind, range, None) {
                    return Err(crate::AllocationError::Overlap { kind, other }.into());
                }
            }
        }
        self.provisioners.push(provisioner);
        Ok(())
    }

    /// Remove a provisioner together with all of its ranges
    pub fn remove_provisioner(&mut self, uuid: Uuid) -> Option<Provisioner> {
        let idx = self.provisioner_index(uuid)?;
        let removed = self.provisioners.remove(idx);
        debug!("Removed provisioner {} and its ranges", removed.uuid);
        Some(removed)
    }

    /// First provisioner other than `except` whose `kind` ranges intersect `range`
    pub(crate) fn range_owner(
        &self,
        kind: RangeKind,
        range: &AllocatedRange,
        except: Option<Uuid>,
    ) -> Option<Uuid> {
        self.provisioners
            .iter()
            .filter(|p| Some(p.uuid) != except)
            .find(|p| p.ranges(kind).iter().any(|r| r.overlaps(range)))
            .map(|p| p.uuid)
    }

    /// Node by device UUID
    pub fn node(&self, uuid: Uuid) -> Option<&Node> {
        self.nodes.iter().find(|n| n.uuid == uuid)
    }

    /// Mutable node by device UUID
    pub fn node_mut(&mut self, uuid: Uuid) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.uuid == uuid)
    }

    /// Node owning an element address
    pub fn node_by_address(&self, address: u16) -> Option<&Node> {
        self.nodes.iter().find(|n| n.has_address(address))
    }

    /// Mutable node owning an element address
    pub fn node_by_address_mut(&mut self, address: u16) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.has_address(address))
    }

    /// Add a node; its element addresses must be free
    pub fn add_node(&mut self, node: Node) -> Result<(), StorageError> {
        let range = node.address_range();
        range.check_bounds(RangeKind::Unicast)?;
        if let Some(existing) = self.nodes.iter().find(|n| n.address_range().overlaps(&range)) {
            return Err(StorageError::Invalid(format!(
                "address range {} already used by node {}",
                range, existing.uuid
            )));
        }
        if self.node(node.uuid).is_some() {
            return Err(StorageError::Invalid(format!(
                "node {} already exists",
                node.uuid
            )));
        }
        info!(
            "Added node {} at {:#06x} ({} elements)",
            node.uuid, node.unicast_address, node.element_count
        );
        self.nodes.push(node);
        Ok(())
    }

    /// Remove a node
    pub fn remove_node(&mut self, uuid: Uuid) -> Option<Node> {
        let idx = self.nodes.iter().position(|n| n.uuid == uuid)?;
        Some(self.nodes.remove(idx))
    }

    /// Group by address
    pub fn group(&self, address: u16) -> Option<&Group> {
        self.groups.iter().find(|g| g.address == address)
    }

    /// Add a group with a unique address in 0xC000..=0xFEFF
    pub fn add_group(&mut self, group: Group) -> Result<(), StorageError> {
        if !(GROUP_MIN..=GROUP_MAX).contains(&group.address) {
            return Err(StorageError::Invalid(format!(
                "group address {:#06x} out of range",
                group.address
            )));
        }
        if self.group(group.address).is_some() {
            return Err(StorageError::Invalid(format!(
                "group {:#06x} already exists",
                group.address
            )));
        }
        self.groups.push(group);
        Ok(())
    }

    /// Remove a group. Nodes are never touched.
    pub fn remove_group(&mut self, address: u16) -> Option<Group> {
        let idx = self.groups.iter().position(|g| g.address == address)?;
        Some(self.groups.remove(idx))
    }

    /// Enter the IV update in progress state with `index + 1`
    pub fn begin_iv_update(&mut self) -> Result<u32, StorageError> {
        if self.iv_index.update_active {
            return Err(StorageError::Invalid("iv update already active".to_string()));
        }
        self.iv_index.index = self
            .iv_index
            .index
            .checked_add(1)
            .ok_or_else(|| StorageError::Invalid("iv index exhausted".to_string()))?;
        self.iv_index.update_active = true;
        info!("IV update started, new index {}", self.iv_index.index);
        Ok(self.iv_index.index)
    }

    /// Return to normal operation; transmission switches to the new index
    pub fn complete_iv_update(&mut self) {
        if self.iv_index.update_active {
            self.iv_index.update_active = false;
            info!("IV update complete at index {}", self.iv_index.index);
        }
    }

    /// Check every relational invariant of the aggregate
    pub fn validate(&self) -> Result<(), StorageError> {
        let invalid = |msg: String| Err(StorageError::Invalid(msg));

        // Keys
        if self.primary_net_key().is_none() {
            return invalid("network has no primary network key".to_string());
        }
        let mut seen = HashSet::new();
        for key in &self.net_keys {
            if key.index > MAX_KEY_INDEX || !seen.insert(key.index) {
                return invalid(format!("bad or duplicate net key index {}", key.index));
            }
            if key.phase != KeyRefreshPhase::Normal && key.old_key.is_none() {
                return invalid(format!("net key {} refreshing without old key", key.index));
            }
        }
        let mut seen = HashSet::new();
        for key in &self.app_keys {
            if key.index > MAX_KEY_INDEX || !seen.insert(key.index) {
                return invalid(format!("bad or duplicate app key index {}", key.index));
            }
            if self.net_key(key.bound_net_key).is_none() {
                return invalid(format!(
                    "app key {} bound to unknown net key {}",
                    key.index, key.bound_net_key
                ));
            }
        }

        // Provisioners and their ranges
        let mut seen = HashSet::new();
        for (i, provisioner) in self.provisioners.iter().enumerate() {
            if provisioner.mesh_uuid != self.id {
                return invalid(format!(
                    "provisioner {} owned by another network",
                    provisioner.uuid
                ));
            }
            if !seen.insert(provisioner.uuid) {
                return invalid(format!("duplicate provisioner {}", provisioner.uuid));
            }
            for kind in [RangeKind::Unicast, RangeKind::Group, RangeKind::Scene] {
                for range in provisioner.ranges(kind) {
                    if range.low > range.high {
                        return invalid(format!("inverted {} range {}", kind, range));
                    }
                    range.check_bounds(kind)?;
                    let clash = self.provisioners[i + 1..]
                        .iter()
                        .any(|other| other.ranges(kind).iter().any(|r| r.overlaps(range)));
                    if clash {
                        return invalid(format!(
                            "{} range {} of {} overlaps another provisioner",
                            kind, range, provisioner.uuid
                        ));
                    }
                }
            }
        }

        // Nodes
        let mut seen = HashSet::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if !seen.insert(node.uuid) {
                return invalid(format!("duplicate node {}", node.uuid));
            }
            if node.element_count == 0 {
                return invalid(format!("node {} has no elements", node.uuid));
            }
            let range = node.address_range();
            if range.low < UNICAST_MIN
                || range.high > UNICAST_MAX
                || range.count() != node.element_count as u32
            {
                return invalid(format!("node {} address range {} invalid", node.uuid, range));
            }
            if self.nodes[i + 1..]
                .iter()
                .any(|other| other.address_range().overlaps(&range))
            {
                return invalid(format!("node {} address range {} overlaps", node.uuid, range));
            }
            if node.sequence_number > MAX_SEQ + 1 {
                return invalid(format!("node {} sequence number overflow", node.uuid));
            }
            if let Some(idx) = node.net_keys.iter().find(|i| self.net_key(**i).is_none()) {
                return invalid(format!("node {} knows unknown net key {}", node.uuid, idx));
            }
        }

        // Groups
        let mut seen = HashSet::new();
        for group in &self.groups {
            if !(GROUP_MIN..=GROUP_MAX).contains(&group.address) || !seen.insert(group.address) {
                return invalid(format!("bad or duplicate group {:#06x}", group.address));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_valid() {
        let network = MeshNetwork::generate("Home", None);
        network.validate().unwrap();

        assert_eq!(network.net_keys.len(), 1);
        assert_eq!(network.app_keys[0].bound_net_key, 0);
        let provisioner = &network.provisioners[0];
        assert_eq!(provisioner.mesh_uuid, network.id);
        assert_eq!(provisioner.name, "Mesh Provisioner");
        assert_eq!(network.nodes[0].unicast_address, 0x0001);
    }

    #[test]
    fn test_validate_rejects_dangling_app_key() {
        let mut network = MeshNetwork::generate("Home", None);
        network.app_keys[0].bound_net_key = 7;
        assert!(network.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_foreign_provisioner() {
        let mut network = MeshNetwork::generate("Home", None);
        network.provisioners[0].mesh_uuid = Uuid::new_v4();
        assert!(network.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_overlapping_nodes() {
        let mut network = MeshNetwork::generate("Home", None);
        network
            .nodes
            .push(Node::new(Uuid::new_v4(), "Lamp", 0x0001, 2, MeshKey::random()));
        assert!(network.validate().is_err());
    }

    #[test]
    fn test_add_node_checks_addresses() {
        let mut network = MeshNetwork::generate("Home", None);
        let lamp = Node::new(Uuid::new_v4(), "Lamp", 0x0002, 3, MeshKey::random());
        network.add_node(lamp).unwrap();
        assert_eq!(network.node_by_address(0x0004).unwrap().name, "Lamp");

        let clash = Node::new(Uuid::new_v4(), "Switch", 0x0004, 1, MeshKey::random());
        assert!(network.add_node(clash).is_err());
        network.validate().unwrap();
    }

    #[test]
    fn test_groups() {
        let mut network = MeshNetwork::generate("Home", None);
        network
            .add_group(Group {
                address: 0xC001,
                name: "Kitchen".to_string(),
            })
            .unwrap();
        assert!(network
            .add_group(Group {
                address: 0xFF00,
                name: "Fixed".to_string(),
            })
            .is_err());

        let nodes_before = network.nodes.len();
        assert!(network.remove_group(0xC001).is_some());
        assert_eq!(network.nodes.len(), nodes_before);
    }

    #[test]
    fn test_remove_provisioner_cascades_ranges() {
        let mut network = MeshNetwork::generate("Home", None);
        let uuid = network.provisioners[0].uuid;
        let removed = network.remove_provisioner(uuid).unwrap();
        assert!(!removed.unicast_ranges.is_empty());
        assert!(network
            .range_owner(RangeKind::Unicast, &DEFAULT_UNICAST_RANGE, None)
            .is_none());
    }

    #[test]
    fn test_iv_index_rules() {
        let mut network = MeshNetwork::generate("Home", None);
        network.iv_index.index = 10;
        assert_eq!(network.iv_index.receive_index(0), Some(10));
        assert_eq!(network.iv_index.receive_index(1), Some(9));

        network.begin_iv_update().unwrap();
        assert_eq!(network.iv_index.index, 11);
        assert_eq!(network.iv_index.transmit_index(), 10);
        assert!(network.begin_iv_update().is_err());

        network.complete_iv_update();
        assert_eq!(network.iv_index.transmit_index(), 11);

        let zero = IvIndex::default();
        assert_eq!(zero.receive_index(1), None);
    }

    #[test]
    fn test_key_refresh() {
        let mut key = NetworkKey::new(0, "Primary", MeshKey::new([1; 16]));
        assert_eq!(key.receive_keys().len(), 1);

        key.begin_key_refresh(MeshKey::new([2; 16])).unwrap();
        assert_eq!(key.phase, KeyRefreshPhase::Distributing);
        assert_eq!(key.transmit_key(), &MeshKey::new([1; 16]));
        assert_eq!(key.receive_keys().len(), 2);
        assert!(key.begin_key_refresh(MeshKey::new([3; 16])).is_err());

        assert_eq!(key.advance_key_refresh(), KeyRefreshPhase::Finalizing);
        assert_eq!(key.transmit_key(), &MeshKey::new([2; 16]));
        assert_eq!(key.receive_keys().len(), 2);

        assert_eq!(key.advance_key_refresh(), KeyRefreshPhase::Normal);
        assert_eq!(key.transmit_key(), &MeshKey::new([2; 16]));
        assert_eq!(key.receive_keys().len(), 1);
        assert!(key.old_key.is_none());
    }

    #[test]
    fn test_serde_roundtrip_preserves_keys() {
        let network = MeshNetwork::generate("Home", Some("Tablet"));
        let json = serde_json::to_string(&network).unwrap();
        let back: MeshNetwork = serde_json::from_str(&json).unwrap();
        assert_eq!(back, network);
    }
}
