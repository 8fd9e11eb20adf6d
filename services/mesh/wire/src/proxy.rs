//! Proxy PDU segmentation and reassembly for the GATT bearer.
//!
//! ```text
//! +--------+----------+---------------------------+
//! | SAR(2) | Type(6)  | data (up to MTU - 1)      |
//! +--------+----------+---------------------------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::codec::MAX_NETWORK_PDU_SIZE;
use crate::error::WireError;

/// Proxy PDU message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyPduType {
    /// Network PDU
    Network = 0x00,
    /// Mesh beacon
    Beacon = 0x01,
    /// Proxy configuration message
    ProxyConfiguration = 0x02,
    /// Provisioning PDU
    Provisioning = 0x03,
}

impl TryFrom<u8> for ProxyPduType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ProxyPduType::Network),
            0x01 => Ok(ProxyPduType::Beacon),
            0x02 => Ok(ProxyPduType::ProxyConfiguration),
            0x03 => Ok(ProxyPduType::Provisioning),
            _ => Err(WireError::Type(value)),
        }
    }
}

impl ProxyPduType {
    /// Largest message of this type a proxy connection carries
    pub const fn max_message_len(self) -> usize {
        match self {
            ProxyPduType::Network | ProxyPduType::ProxyConfiguration => MAX_NETWORK_PDU_SIZE,
            ProxyPduType::Beacon => MAX_BEACON,
            ProxyPduType::Provisioning => MAX_PROVISIONING_PDU,
        }
    }
}

/// Private beacon, the longest beacon format
pub const MAX_BEACON: usize = 27;
/// Public Key PDU: type octet and two 32-octet coordinates
pub const MAX_PROVISIONING_PDU: usize = 65;

/// Segmentation and reassembly field
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sar {
    /// Complete message
    Complete = 0b00,
    /// First segment
    First = 0b01,
    /// Continuation segment
    Continuation = 0b10,
    /// Last segment
    Last = 0b11,
}

impl Sar {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Sar::Complete,
            0b01 => Sar::First,
            0b10 => Sar::Continuation,
            _ => Sar::Last,
        }
    }
}

/// Pieces of one proxy message; most messages fit in a few
pub type ProxySegments = SmallVec<[Bytes; 4]>;

fn header(sar: Sar, pdu_type: ProxyPduType) -> u8 {
    ((sar as u8) << 6) | (pdu_type as u8)
}

/// Split a message into proxy PDUs of at most `mtu` octets each
pub fn segment(
    pdu_type: ProxyPduType,
    data: &[u8],
    mtu: usize,
) -> Result<ProxySegments, WireError> {
    if mtu < 2 {
        return Err(WireError::Size(mtu));
    }
    if data.is_empty() {
        return Err(WireError::Incomplete);
    }

    let piece = mtu - 1;
    let mut out = ProxySegments::new();

    if data.len() <= piece {
        let mut buf = BytesMut::with_capacity(1 + data.len());
        buf.put_u8(header(Sar::Complete, pdu_type));
        buf.put_slice(data);
        out.push(buf.freeze());
        return Ok(out);
    }

    let chunks: Vec<&[u8]> = data.chunks(piece).collect();
    let last = chunks.len() - 1;
    for (idx, chunk) in chunks.into_iter().enumerate() {
        let sar = match idx {
            0 => Sar::First,
            i if i == last => Sar::Last,
            _ => Sar::Continuation,
        };
        let mut buf = BytesMut::with_capacity(1 + chunk.len());
        buf.put_u8(header(sar, pdu_type));
        buf.put_slice(chunk);
        out.push(buf.freeze());
    }

    trace!(pieces = out.len(), "Segmented proxy PDU");
    Ok(out)
}

/// Reassembles proxy PDUs arriving on one connection
#[derive(Debug, Default)]
pub struct ProxyReassembler {
    pending: Option<(ProxyPduType, BytesMut)>,
}

impl ProxyReassembler {
    /// Create an empty reassembler
    pub fn new() -> Self {
        Self { pending: None }
    }

    /// Whether a segmented message is in progress
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Feed one proxy PDU. Returns a complete message when one is available.
    pub fn push(&mut self, raw: &[u8]) -> Result<Option<(ProxyPduType, Bytes)>, WireError> {
        let (&first, data) = raw.split_first().ok_or(WireError::Incomplete)?;
        let sar = Sar::from_bits(first >> 6);
        let pdu_type = ProxyPduType::try_from(first & 0x3F)?;

        match sar {
            Sar::Complete => {
                if self.pending.take().is_some() {
                    debug!("Discarding incomplete proxy message");
                }
                check_len(pdu_type, data.len())?;
                Ok(Some((pdu_type, Bytes::copy_from_slice(data))))
            }
            Sar::First => {
                if self.pending.take().is_some() {
                    debug!("Discarding incomplete proxy message");
                }
                check_len(pdu_type, data.len())?;
                self.pending = Some((pdu_type, BytesMut::from(data)));
                Ok(None)
            }
            Sar::Continuation | Sar::Last => {
                let (pending_type, mut buf) = self.pending.take().ok_or(WireError::Malformed)?;
                if pending_type != pdu_type {
                    return Err(WireError::Malformed);
                }
                check_len(pdu_type, buf.len() + data.len())?;
                buf.extend_from_slice(data);
                if sar == Sar::Last {
                    Ok(Some((pdu_type, buf.freeze())))
                } else {
                    self.pending = Some((pending_type, buf));
                    Ok(None)
                }
            }
        }
    }
}

fn check_len(pdu_type: ProxyPduType, len: usize) -> Result<(), WireError> {
    if len > pdu_type.max_message_len() {
        debug!(?pdu_type, len, "Oversized proxy message dropped");
        return Err(WireError::Size(len));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_pdu() {
        let pieces = segment(ProxyPduType::Network, &[1, 2, 3], 20).unwrap();
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].as_ref(), &[0x00, 1, 2, 3]);
    }

    #[test]
    fn test_segmented_provisioning_pdu() {
        let data: Vec<u8> = (0..65).collect();
        let pieces = segment(ProxyPduType::Provisioning, &data, 20).unwrap();

        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces[0][0], 0x43);
        assert_eq!(pieces[1][0], 0x83);
        assert_eq!(pieces[2][0], 0x83);
        assert_eq!(pieces[3][0], 0xC3);
        assert!(pieces.iter().all(|p| p.len() <= 20));

        let mut reassembler = ProxyReassembler::new();
        let mut result = None;
        for piece in &pieces {
            result = reassembler.push(piece).unwrap();
        }
        let (pdu_type, message) = result.unwrap();
        assert_eq!(pdu_type, ProxyPduType::Provisioning);
        assert_eq!(message.as_ref(), data.as_slice());
        assert!(!reassembler.is_pending());
    }

    #[test]
    fn test_continuation_without_first() {
        let mut reassembler = ProxyReassembler::new();
        assert_eq!(
            reassembler.push(&[0x80, 1, 2]).unwrap_err(),
            WireError::Malformed
        );
    }

    #[test]
    fn test_type_change_mid_message() {
        let mut reassembler = ProxyReassembler::new();
        reassembler.push(&[0x43, 1, 2]).unwrap();
        assert_eq!(
            reassembler.push(&[0xC0, 3]).unwrap_err(),
            WireError::Malformed
        );
    }

    #[test]
    fn test_tiny_mtu_rejected() {
        assert_eq!(
            segment(ProxyPduType::Network, &[1], 1).unwrap_err(),
            WireError::Size(1)
        );
        assert!(ProxyReassembler::new().push(&[0x04]).is_err());
    }

    #[test]
    fn test_oversized_message_dropped() {
        let mut reassembler = ProxyReassembler::new();
        reassembler.push(&[0x40, 0xAA]).unwrap();

        let mut result = Ok(None);
        for _ in 0..10_000 {
            result = reassembler.push(&[0x80; 20]);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result.unwrap_err(), WireError::Size(39));
        assert!(!reassembler.is_pending());

        // Without a First the trailing Last has nothing to complete
        assert_eq!(
            reassembler.push(&[0xC0, 0xBB]).unwrap_err(),
            WireError::Malformed
        );

        let provisioning: Vec<u8> = (0..MAX_PROVISIONING_PDU as u8).collect();
        let pieces = segment(ProxyPduType::Provisioning, &provisioning, 23).unwrap();
        let mut result = None;
        for piece in &pieces {
            result = reassembler.push(piece).unwrap();
        }
        assert_eq!(result.unwrap().1.len(), MAX_PROVISIONING_PDU);
    }

    #[test]
    fn test_oversized_complete_pdu() {
        let mut reassembler = ProxyReassembler::new();
        let mut raw = vec![0x00];
        raw.extend_from_slice(&[0u8; MAX_NETWORK_PDU_SIZE + 1]);
        assert_eq!(
            reassembler.push(&raw).unwrap_err(),
            WireError::Size(MAX_NETWORK_PDU_SIZE + 1)
        );
        assert!(reassembler.push(&raw[..MAX_NETWORK_PDU_SIZE + 1]).unwrap().is_some());
    }
}
