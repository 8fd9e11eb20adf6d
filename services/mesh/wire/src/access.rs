//! Access layer opcodes.
//!
//! Opcodes are one, two or three octets long. The two high bits of the first
//! octet select the form:
//!
//! ```text
//! 0xxxxxxx                       1-octet SIG opcode (0x7F reserved)
//! 10xxxxxx xxxxxxxx              2-octet SIG opcode
//! 11xxxxxx cccccccc cccccccc     3-octet vendor opcode, company id little-endian
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::WireError;

/// Largest access payload (opcode plus parameters) in one message
pub const MAX_ACCESS_PAYLOAD: usize = 380;

/// An access layer opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Opcode {
    /// 1-octet SIG opcode
    Single(u8),
    /// 2-octet SIG opcode
    Double(u16),
    /// 3-octet vendor opcode
    Vendor {
        /// Vendor-specific opcode (6 bits)
        opcode: u8,
        /// Company identifier
        company: u16,
    },
}

impl Opcode {
    /// Generic OnOff Get
    pub const GENERIC_ONOFF_GET: Opcode = Opcode::Double(0x8201);
    /// Generic OnOff Set
    pub const GENERIC_ONOFF_SET: Opcode = Opcode::Double(0x8202);
    /// Generic OnOff Set Unacknowledged
    pub const GENERIC_ONOFF_SET_UNACK: Opcode = Opcode::Double(0x8203);
    /// Generic OnOff Status
    pub const GENERIC_ONOFF_STATUS: Opcode = Opcode::Double(0x8204);
    /// Generic Level Get
    pub const GENERIC_LEVEL_GET: Opcode = Opcode::Double(0x8205);
    /// Generic Level Set
    pub const GENERIC_LEVEL_SET: Opcode = Opcode::Double(0x8206);
    /// Generic Level Set Unacknowledged
    pub const GENERIC_LEVEL_SET_UNACK: Opcode = Opcode::Double(0x8207);
    /// Generic Level Status
    pub const GENERIC_LEVEL_STATUS: Opcode = Opcode::Double(0x8208);

    /// Encoded length in octets
    pub fn encoded_len(&self) -> usize {
        match self {
            Opcode::Single(_) => 1,
            Opcode::Double(_) => 2,
            Opcode::Vendor { .. } => 3,
        }
    }

    /// Validate the opcode's form bits
    pub fn validate(&self) -> Result<(), WireError> {
        let ok = match self {
            Opcode::Single(op) => *op < 0x7F,
            Opcode::Double(op) => *op & 0xC000 == 0x8000,
            Opcode::Vendor { opcode, .. } => *opcode <= 0x3F,
        };
        if ok {
            Ok(())
        } else {
            Err(WireError::Field("opcode"))
        }
    }

    /// Append the encoded opcode
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Opcode::Single(op) => buf.put_u8(*op),
            Opcode::Double(op) => buf.put_u16(*op),
            Opcode::Vendor { opcode, company } => {
                buf.put_u8(0xC0 | (opcode & 0x3F));
                buf.put_u16_le(*company);
            }
        }
    }

    /// Split an access payload into opcode and parameters
    pub fn decode(raw: &[u8]) -> Result<(Opcode, &[u8]), WireError> {
        let first = *raw.first().ok_or(WireError::Incomplete)?;
        match first >> 6 {
            0b00 | 0b01 => {
                if first == 0x7F {
                    return Err(WireError::Field("opcode"));
                }
                Ok((Opcode::Single(first), &raw[1..]))
            }
            0b10 => {
                if raw.len() < 2 {
                    return Err(WireError::Incomplete);
                }
                Ok((Opcode::Double(u16::from_be_bytes([raw[0], raw[1]])), &raw[2..]))
            }
            _ => {
                if raw.len() < 3 {
                    return Err(WireError::Incomplete);
                }
                Ok((
                    Opcode::Vendor {
                        opcode: first & 0x3F,
                        company: u16::from_le_bytes([raw[1], raw[2]]),
                    },
                    &raw[3..],
                ))
            }
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Single(op) => write!(f, "{:#04x}", op),
            Opcode::Double(op) => write!(f, "{:#06x}", op),
            Opcode::Vendor { opcode, company } => write!(f, "{:#04x}/{:#06x}", opcode, company),
        }
    }
}

/// Build an access payload from an opcode and parameters
pub fn access_payload(opcode: Opcode, params: &[u8]) -> Result<Bytes, WireError> {
    opcode.validate()?;
    let total = opcode.encoded_len() + params.len();
    if total > MAX_ACCESS_PAYLOAD {
        return Err(WireError::Size(total));
    }
    let mut buf = BytesMut::with_capacity(total);
    opcode.encode(&mut buf);
    buf.put_slice(params);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_octet_opcode() {
        let payload = access_payload(Opcode::GENERIC_ONOFF_SET, &[0x01, 0x07]).unwrap();
        assert_eq!(payload.as_ref(), &[0x82, 0x02, 0x01, 0x07]);

        let (opcode, params) = Opcode::decode(&payload).unwrap();
        assert_eq!(opcode, Opcode::GENERIC_ONOFF_SET);
        assert_eq!(params, &[0x01, 0x07]);
    }

    #[test]
    fn test_vendor_opcode() {
        let opcode = Opcode::Vendor {
            opcode: 0x01,
            company: 0x0059,
        };
        let payload = access_payload(opcode, &[0xAA]).unwrap();
        assert_eq!(payload.as_ref(), &[0xC1, 0x59, 0x00, 0xAA]);
        assert_eq!(Opcode::decode(&payload).unwrap(), (opcode, &[0xAAu8][..]));
    }

    #[test]
    fn test_reserved_and_truncated() {
        assert_eq!(
            Opcode::decode(&[0x7F]).unwrap_err(),
            WireError::Field("opcode")
        );
        assert_eq!(Opcode::decode(&[0x82]).unwrap_err(), WireError::Incomplete);
        assert_eq!(Opcode::decode(&[]).unwrap_err(), WireError::Incomplete);
        assert!(Opcode::Double(0x4201).validate().is_err());
    }

    #[test]
    fn test_payload_limit() {
        let params = vec![0u8; MAX_ACCESS_PAYLOAD - 1];
        assert!(access_payload(Opcode::Single(0x04), &params).is_ok());
        assert_eq!(
            access_payload(Opcode::GENERIC_LEVEL_SET, &params).unwrap_err(),
            WireError::Size(MAX_ACCESS_PAYLOAD + 1)
        );
    }
}
