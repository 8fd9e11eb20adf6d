//! Range allocation across provisioners and free address search.
//!
//! Callers run these under the network write lock; each call is a single
//! check-then-insert over the aggregate.

use tracing::{debug, info};
use uuid::Uuid;

use crate::model::network::MeshNetwork;
use crate::model::range::{coalesce, AllocatedRange, RangeKind};
use crate::AllocationError;

impl MeshNetwork {
    /// Grant `range` of `kind` to a provisioner.
    ///
    /// Fails with [`AllocationError::Overlap`] when another provisioner holds any
    /// part of it. The requester's own overlapping or adjacent ranges are merged.
    pub fn allocate_range(
        &mut self,
        provisioner: Uuid,
        kind: RangeKind,
        range: AllocatedRange,
    ) -> Result<(), AllocationError> {
        if range.low > range.high {
            return Err(AllocationError::InvalidRange {
                low: range.low,
                high: range.high,
            });
        }
        range.check_bounds(kind)?;

        let idx = self
            .provisioner_index(provisioner)
            .ok_or(AllocationError::UnknownProvisioner(provisioner))?;

        if let Some(other) = self.range_owner(kind, &range, Some(provisioner)) {
            debug!(
                "Refusing {} range {} for {}: held by {}",
                kind, range, provisioner, other
            );
            return Err(AllocationError::Overlap { kind, other });
        }

        let ranges = self.provisioners[idx].ranges_mut(kind);
        ranges.push(range);
        coalesce(ranges);

        info!("Allocated {} range {} to provisioner {}", kind, range, provisioner);
        Ok(())
    }

    /// Lowest address in the provisioner's unicast ranges with `element_count`
    /// consecutive addresses not used by a node and not in `reserved`.
    pub fn next_unicast_address(
        &self,
        provisioner: Uuid,
        element_count: u8,
        reserved: &[AllocatedRange],
    ) -> Result<u16, AllocationError> {
        if element_count == 0 {
            return Err(AllocationError::InvalidRange { low: 1, high: 0 });
        }
        let owner = self
            .provisioner(provisioner)
            .ok_or(AllocationError::UnknownProvisioner(provisioner))?;

        let mut taken: Vec<AllocatedRange> = self
            .nodes
            .iter()
            .map(|n| n.address_range())
            .chain(reserved.iter().copied())
            .collect();
        taken.sort();

        let needed = element_count as u32;
        for range in &owner.unicast_ranges {
            let mut candidate = range.low as u32;
            while candidate + needed - 1 <= range.high as u32 {
                let wanted = AllocatedRange {
                    low: candidate as u16,
                    high: (candidate + needed - 1) as u16,
                };
                match taken.iter().find(|t| t.overlaps(&wanted)) {
                    // Skip past the blocker and retry
                    Some(blocker) => candidate = blocker.high as u32 + 1,
                    None => return Ok(wanted.low),
                }
            }
        }

        Err(AllocationError::AddressSpaceExhausted { element_count })
    }

    /// Lowest group address in the provisioner's group ranges not used by a Group
    pub fn next_group_address(&self, provisioner: Uuid) -> Result<u16, AllocationError> {
        let owner = self
            .provisioner(provisioner)
            .ok_or(AllocationError::UnknownProvisioner(provisioner))?;

        owner
            .group_ranges
            .iter()
            .flat_map(|r| r.low..=r.high)
            .find(|addr| self.group(*addr).is_none())
            .ok_or(AllocationError::AddressSpaceExhausted { element_count: 1 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::key::MeshKey;
    use crate::model::network::Node;
    use crate::model::provisioner::Provisioner;

    fn two_provisioners() -> (MeshNetwork, Uuid, Uuid) {
        let mut network = MeshNetwork::generate("Home", None);
        network.provisioners.clear();
        network.nodes.clear();

        let a = Provisioner::new(Some("A"), network.id);
        let b = Provisioner::new(Some("B"), network.id);
        let (ua, ub) = (a.uuid, b.uuid);
        network.add_provisioner(a).unwrap();
        network.add_provisioner(b).unwrap();
        (network, ua, ub)
    }

    fn range(low: u16, high: u16) -> AllocatedRange {
        AllocatedRange::new(low, high).unwrap()
    }

    #[test]
    fn test_overlap_between_provisioners() {
        let (mut network, a, b) = two_provisioners();
        network
            .allocate_range(a, RangeKind::Unicast, range(0x0010, 0x001F))
            .unwrap();

        assert_eq!(
            network
                .allocate_range(b, RangeKind::Unicast, range(0x0018, 0x0020))
                .unwrap_err(),
            AllocationError::Overlap {
                kind: RangeKind::Unicast,
                other: a
            }
        );
        network
            .allocate_range(b, RangeKind::Unicast, range(0x0020, 0x0030))
            .unwrap();

        // Group and scene spaces are independent of unicast
        network
            .allocate_range(b, RangeKind::Scene, range(0x0010, 0x001F))
            .unwrap();
        network.validate().unwrap();
    }

    #[test]
    fn test_own_ranges_coalesce() {
        let (mut network, a, _) = two_provisioners();
        network
            .allocate_range(a, RangeKind::Group, range(0xC010, 0xC01F))
            .unwrap();
        network
            .allocate_range(a, RangeKind::Group, range(0xC000, 0xC00F))
            .unwrap();
        network
            .allocate_range(a, RangeKind::Group, range(0xC018, 0xC030))
            .unwrap();

        assert_eq!(
            network.provisioner(a).unwrap().group_ranges,
            vec![range(0xC000, 0xC030)]
        );
    }

    #[test]
    fn test_allocation_bounds() {
        let (mut network, a, _) = two_provisioners();
        assert!(matches!(
            network.allocate_range(a, RangeKind::Group, range(0x0001, 0x0002)),
            Err(AllocationError::OutOfBounds { .. })
        ));
        assert_eq!(
            network
                .allocate_range(
                    a,
                    RangeKind::Unicast,
                    AllocatedRange {
                        low: 0x20,
                        high: 0x10
                    }
                )
                .unwrap_err(),
            AllocationError::InvalidRange {
                low: 0x20,
                high: 0x10
            }
        );
        let stranger = Uuid::new_v4();
        assert_eq!(
            network
                .allocate_range(stranger, RangeKind::Unicast, range(1, 2))
                .unwrap_err(),
            AllocationError::UnknownProvisioner(stranger)
        );
    }

    #[test]
    fn test_next_unicast_address_skips_nodes_and_reservations() {
        let (mut network, a, _) = two_provisioners();
        network
            .allocate_range(a, RangeKind::Unicast, range(0x0010, 0x001F))
            .unwrap();
        network
            .add_node(Node::new(Uuid::new_v4(), "Lamp", 0x0010, 2, MeshKey::random()))
            .unwrap();

        assert_eq!(network.next_unicast_address(a, 1, &[]).unwrap(), 0x0012);
        assert_eq!(
            network
                .next_unicast_address(a, 3, &[range(0x0012, 0x0013)])
                .unwrap(),
            0x0014
        );
    }

    #[test]
    fn test_next_unicast_address_needs_contiguous_block() {
        let (mut network, a, _) = two_provisioners();
        network
            .allocate_range(a, RangeKind::Unicast, range(0x0010, 0x0013))
            .unwrap();
        network
            .allocate_range(a, RangeKind::Unicast, range(0x0020, 0x0027))
            .unwrap();
        network
            .add_node(Node::new(Uuid::new_v4(), "Lamp", 0x0011, 1, MeshKey::random()))
            .unwrap();

        // [0x0012, 0x0013] is too small for 4 elements
        assert_eq!(network.next_unicast_address(a, 4, &[]).unwrap(), 0x0020);
        assert_eq!(
            network.next_unicast_address(a, 9, &[]).unwrap_err(),
            AllocationError::AddressSpaceExhausted { element_count: 9 }
        );
    }

    #[test]
    fn test_next_group_address() {
        let mut network = MeshNetwork::generate("Home", None);
        let a = network.provisioners[0].uuid;
        assert_eq!(network.next_group_address(a).unwrap(), 0xC000);
        network
            .add_group(crate::model::network::Group {
                address: 0xC000,
                name: "Hall".to_string(),
            })
            .unwrap();
        assert_eq!(network.next_group_address(a).unwrap(), 0xC001);
    }
}
