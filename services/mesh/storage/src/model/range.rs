//! Address and scene ranges owned by provisioners.

use mesh_wire::address::{GROUP_MAX, GROUP_MIN, UNICAST_MAX, UNICAST_MIN};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::AllocationError;

/// Which space a range lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeKind {
    /// Unicast addresses 0x0001..=0x7FFF
    Unicast,
    /// Group addresses 0xC000..=0xFEFF
    Group,
    /// Scene numbers 0x0001..=0xFFFF
    Scene,
}

impl RangeKind {
    /// Inclusive bounds of the legal space
    pub fn bounds(self) -> (u16, u16) {
        match self {
            RangeKind::Unicast => (UNICAST_MIN, UNICAST_MAX),
            RangeKind::Group => (GROUP_MIN, GROUP_MAX),
            RangeKind::Scene => (0x0001, 0xFFFF),
        }
    }
}

impl fmt::Display for RangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeKind::Unicast => write!(f, "unicast"),
            RangeKind::Group => write!(f, "group"),
            RangeKind::Scene => write!(f, "scene"),
        }
    }
}

/// Inclusive `[low, high]` range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocatedRange {
    /// Lowest value in the range
    pub low: u16,
    /// Highest value in the range
    pub high: u16,
}

impl AllocatedRange {
    /// Create a range, rejecting `low > high`
    pub fn new(low: u16, high: u16) -> Result<Self, AllocationError> {
        if low > high {
            return Err(AllocationError::InvalidRange { low, high });
        }
        Ok(Self { low, high })
    }

    /// Check the range lies inside the legal space of `kind`
    pub fn check_bounds(&self, kind: RangeKind) -> Result<(), AllocationError> {
        let (min, max) = kind.bounds();
        if self.low < min || self.high > max {
            return Err(AllocationError::OutOfBounds {
                kind,
                low: self.low,
                high: self.high,
            });
        }
        Ok(())
    }

    /// Number of values covered
    pub fn count(&self) -> u32 {
        (self.high - self.low) as u32 + 1
    }

    /// Whether `value` lies in the range
    pub fn contains(&self, value: u16) -> bool {
        (self.low..=self.high).contains(&value)
    }

    /// Whether the two ranges share a value
    pub fn overlaps(&self, other: &AllocatedRange) -> bool {
        self.low <= other.high && other.low <= self.high
    }

    /// Whether the two ranges overlap or touch end to end
    pub fn touches(&self, other: &AllocatedRange) -> bool {
        self.overlaps(other)
            || self.high.checked_add(1) == Some(other.low)
            || other.high.checked_add(1) == Some(self.low)
    }
}

impl fmt::Display for AllocatedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#06x}, {:#06x}]", self.low, self.high)
    }
}

/// Sort ranges by low bound and merge overlapping or adjacent ones
pub fn coalesce(ranges: &mut Vec<AllocatedRange>) {
    ranges.sort();
    let mut merged: Vec<AllocatedRange> = Vec::with_capacity(ranges.len());
    for range in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) if last.touches(&range) => {
                last.high = last.high.max(range.high);
            }
            _ => merged.push(range),
        }
    }
    *ranges = merged;
}
