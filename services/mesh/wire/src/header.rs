//! Network PDU header fields.
//!
//! The first octet (`IVI | NID`) travels in the clear. The next six octets
//! (`CTL | TTL`, `SEQ`, `SRC`) are obfuscated with the privacy pad before
//! transmission.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Largest TTL value (7 bits)
pub const MAX_TTL: u8 = 0x7F;

/// Largest sequence number (24 bits)
pub const MAX_SEQ: u32 = 0x00FF_FFFF;

/// Size of the obfuscated header portion
pub const OBFUSCATED_HEADER_SIZE: usize = 6;

/// Pack `IVI | NID` into the leading octet
pub fn pack_ivi_nid(iv_index: u32, nid: u8) -> u8 {
    (((iv_index & 1) as u8) << 7) | (nid & 0x7F)
}

/// Split the leading octet into `(IVI, NID)`
pub fn unpack_ivi_nid(octet: u8) -> (u8, u8) {
    (octet >> 7, octet & 0x7F)
}

/// The obfuscated `CTL | TTL || SEQ || SRC` block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkHeader {
    /// Control message flag
    pub ctl: bool,
    /// Time to live (0..=127)
    pub ttl: u8,
    /// 24-bit sequence number
    pub seq: u32,
    /// Source element address
    pub src: u16,
}

impl NetworkHeader {
    /// Create a header, validating field widths
    pub fn new(ctl: bool, ttl: u8, seq: u32, src: u16) -> Result<Self, WireError> {
        if ttl > MAX_TTL {
            return Err(WireError::Ttl(ttl));
        }
        if seq > MAX_SEQ {
            return Err(WireError::Sequence(seq));
        }
        Ok(Self { ctl, ttl, seq, src })
    }

    /// The `CTL | TTL` octet
    pub fn ctl_ttl(&self) -> u8 {
        ((self.ctl as u8) << 7) | (self.ttl & MAX_TTL)
    }

    /// Encode to the six clear-text octets
    pub fn to_bytes(&self) -> [u8; OBFUSCATED_HEADER_SIZE] {
        let mut out = [0u8; OBFUSCATED_HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u8(self.ctl_ttl());
        buf.put_uint(self.seq as u64, 3);
        buf.put_u16(self.src);
        out
    }

    /// Decode from the six clear-text octets
    pub fn from_bytes(raw: &[u8; OBFUSCATED_HEADER_SIZE]) -> Self {
        let mut buf = &raw[..];
        let ctl_ttl = buf.get_u8();
        let seq = buf.get_uint(3) as u32;
        let src = buf.get_u16();
        Self {
            ctl: ctl_ttl & 0x80 != 0,
            ttl: ctl_ttl & MAX_TTL,
            seq,
            src,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ivi_nid_packing() {
        assert_eq!(pack_ivi_nid(0x12345678, 0x68), 0x68);
        assert_eq!(pack_ivi_nid(0x12345679, 0x68), 0xE8);
        assert_eq!(unpack_ivi_nid(0xE8), (1, 0x68));
    }

    #[test]
    fn test_header_bytes() {
        let header = NetworkHeader::new(true, 0, 1, 0x1201).unwrap();
        assert_eq!(header.to_bytes(), [0x80, 0x00, 0x00, 0x01, 0x12, 0x01]);
        assert_eq!(NetworkHeader::from_bytes(&header.to_bytes()), header);
    }

    #[test]
    fn test_header_limits() {
        assert_eq!(
            NetworkHeader::new(false, 128, 0, 1).unwrap_err(),
            WireError::Ttl(128)
        );
        assert_eq!(
            NetworkHeader::new(false, 5, 0x0100_0000, 1).unwrap_err(),
            WireError::Sequence(0x0100_0000)
        );
    }
}
