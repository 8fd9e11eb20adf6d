//! Mesh address classification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The unassigned address
pub const UNASSIGNED: u16 = 0x0000;
/// Lowest unicast address
pub const UNICAST_MIN: u16 = 0x0001;
/// Highest unicast address
pub const UNICAST_MAX: u16 = 0x7FFF;
/// Lowest group address
pub const GROUP_MIN: u16 = 0xC000;
/// Highest group address that can be assigned to a Group
pub const GROUP_MAX: u16 = 0xFEFF;
/// All-proxies fixed group
pub const ALL_PROXIES: u16 = 0xFFFC;
/// All-friends fixed group
pub const ALL_FRIENDS: u16 = 0xFFFD;
/// All-relays fixed group
pub const ALL_RELAYS: u16 = 0xFFFE;
/// All-nodes fixed group
pub const ALL_NODES: u16 = 0xFFFF;

/// Address categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressKind {
    /// 0x0000
    Unassigned,
    /// 0x0001..=0x7FFF
    Unicast,
    /// 0x8000..=0xBFFF
    Virtual,
    /// 0xC000..=0xFEFF
    Group,
    /// 0xFF00..=0xFFFF
    FixedGroup,
}

/// A 16-bit mesh address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub u16);

impl Address {
    /// Classify the address
    pub fn kind(self) -> AddressKind {
        match self.0 {
            UNASSIGNED => AddressKind::Unassigned,
            UNICAST_MIN..=UNICAST_MAX => AddressKind::Unicast,
            0x8000..=0xBFFF => AddressKind::Virtual,
            GROUP_MIN..=GROUP_MAX => AddressKind::Group,
            _ => AddressKind::FixedGroup,
        }
    }

    /// True for element addresses
    pub fn is_unicast(self) -> bool {
        self.kind() == AddressKind::Unicast
    }

    /// True for dynamic and fixed group addresses
    pub fn is_group(self) -> bool {
        matches!(self.kind(), AddressKind::Group | AddressKind::FixedGroup)
    }

    /// True when the address can be the source of a network PDU
    pub fn is_valid_source(self) -> bool {
        self.is_unicast()
    }

    /// True when the address can be the destination of a network PDU
    pub fn is_valid_destination(self) -> bool {
        self.kind() != AddressKind::Unassigned
    }
}

impl From<u16> for Address {
    fn from(value: u16) -> Self {
        Address(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}
