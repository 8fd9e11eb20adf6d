//! Lower transport PDUs.
//!
//! ```text
//! Unsegmented access   SEG=0 | AKF | AID(6)          || UpperTransportPDU (1..15)
//! Segmented access     SEG=1 | AKF | AID(6)          || SZMIC | SeqZero(13) | SegO(5) | SegN(5) || Segment (1..12)
//! Unsegmented control  SEG=0 | Opcode(7)             || Parameters (0..11)
//! Segmented control    SEG=1 | Opcode(7)             || RFU | SeqZero(13) | SegO(5) | SegN(5) || Segment (1..8)
//! Segment ack          SEG=0 | 0x00                  || OBO | SeqZero(13) | RFU(2) || BlockAck(32)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// Largest upper transport PDU that fits an unsegmented access message
pub const MAX_UNSEGMENTED_ACCESS: usize = 15;

/// Segment payload size for access messages
pub const ACCESS_SEGMENT_SIZE: usize = 12;

/// Segment payload size for control messages
pub const CONTROL_SEGMENT_SIZE: usize = 8;

/// Largest parameters of an unsegmented control message
pub const MAX_UNSEGMENTED_CONTROL: usize = 11;

/// Maximum number of segments in one message
pub const MAX_SEGMENTS: usize = 32;

/// Control opcode of the Segment Acknowledgment message
pub const SEGMENT_ACK_OPCODE: u8 = 0x00;

const SEG_BIT: u8 = 0x80;
const AKF_BIT: u8 = 0x40;
const SEQ_ZERO_MASK: u16 = 0x1FFF;

/// Segmentation fields shared by segmented access and control PDUs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Size of TransMIC flag (access only; RFU for control)
    pub szmic: bool,
    /// Low 13 bits of the first segment's sequence number
    pub seq_zero: u16,
    /// Offset of this segment
    pub seg_o: u8,
    /// Index of the last segment
    pub seg_n: u8,
}

impl SegmentInfo {
    fn pack(&self) -> u32 {
        ((self.szmic as u32) << 23)
            | (((self.seq_zero & SEQ_ZERO_MASK) as u32) << 10)
            | (((self.seg_o & 0x1F) as u32) << 5)
            | (self.seg_n & 0x1F) as u32
    }

    fn unpack(raw: u32) -> Result<Self, WireError> {
        let info = Self {
            szmic: raw & (1 << 23) != 0,
            seq_zero: ((raw >> 10) as u16) & SEQ_ZERO_MASK,
            seg_o: ((raw >> 5) & 0x1F) as u8,
            seg_n: (raw & 0x1F) as u8,
        };
        if info.seg_o > info.seg_n {
            return Err(WireError::Segment {
                seg_o: info.seg_o,
                seg_n: info.seg_n,
            });
        }
        Ok(info)
    }
}

/// Segment Acknowledgment control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAck {
    /// Acknowledged on behalf of a Low Power node
    pub obo: bool,
    /// SeqZero of the acknowledged message
    pub seq_zero: u16,
    /// Bit n set when segment n was received
    pub block_ack: u32,
}

/// A lower transport PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerTransportPdu {
    /// Single-PDU access message
    UnsegmentedAccess {
        /// Application key flag
        akf: bool,
        /// Application key identifier
        aid: u8,
        /// Encrypted access payload with 32-bit TransMIC
        upper_pdu: Bytes,
    },
    /// One segment of an access message
    SegmentedAccess {
        /// Application key flag
        akf: bool,
        /// Application key identifier
        aid: u8,
        /// Segmentation fields
        info: SegmentInfo,
        /// Segment payload
        segment: Bytes,
    },
    /// Single-PDU control message
    UnsegmentedControl {
        /// 7-bit control opcode
        opcode: u8,
        /// Parameters
        params: Bytes,
    },
    /// One segment of a control message
    SegmentedControl {
        /// 7-bit control opcode
        opcode: u8,
        /// Segmentation fields
        info: SegmentInfo,
        /// Segment payload
        segment: Bytes,
    },
    /// Segment Acknowledgment
    SegmentAck(SegmentAck),
}

impl LowerTransportPdu {
    /// Whether this PDU travels with CTL=1
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            LowerTransportPdu::UnsegmentedControl { .. }
                | LowerTransportPdu::SegmentedControl { .. }
                | LowerTransportPdu::SegmentAck(_)
        )
    }

    /// Encode to the bytes carried inside a network PDU
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            LowerTransportPdu::UnsegmentedAccess {
                akf,
                aid,
                upper_pdu,
            } => {
                if upper_pdu.is_empty() || upper_pdu.len() > MAX_UNSEGMENTED_ACCESS {
                    return Err(WireError::Size(upper_pdu.len()));
                }
                buf.put_u8(akf_aid(*akf, *aid));
                buf.put_slice(upper_pdu);
            }
            LowerTransportPdu::SegmentedAccess {
                akf,
                aid,
                info,
                segment,
            } => {
                check_segment(info, segment, ACCESS_SEGMENT_SIZE)?;
                buf.put_u8(SEG_BIT | akf_aid(*akf, *aid));
                buf.put_uint(info.pack() as u64, 3);
                buf.put_slice(segment);
            }
            LowerTransportPdu::UnsegmentedControl { opcode, params } => {
                if *opcode == SEGMENT_ACK_OPCODE || *opcode > 0x7F {
                    return Err(WireError::Field("control opcode"));
                }
                if params.len() > MAX_UNSEGMENTED_CONTROL {
                    return Err(WireError::Size(params.len()));
                }
                buf.put_u8(*opcode);
                buf.put_slice(params);
            }
            LowerTransportPdu::SegmentedControl {
                opcode,
                info,
                segment,
            } => {
                if *opcode == SEGMENT_ACK_OPCODE || *opcode > 0x7F {
                    return Err(WireError::Field("control opcode"));
                }
                check_segment(info, segment, CONTROL_SEGMENT_SIZE)?;
                let mut info = *info;
                info.szmic = false;
                buf.put_u8(SEG_BIT | opcode);
                buf.put_uint(info.pack() as u64, 3);
                buf.put_slice(segment);
            }
            LowerTransportPdu::SegmentAck(ack) => {
                buf.put_u8(SEGMENT_ACK_OPCODE);
                buf.put_u16(((ack.obo as u16) << 15) | ((ack.seq_zero & SEQ_ZERO_MASK) << 2));
                buf.put_u32(ack.block_ack);
            }
        }
        Ok(buf.freeze())
    }

    /// Decode the transport PDU of a network PDU with the given CTL bit
    pub fn decode(ctl: bool, raw: &[u8]) -> Result<Self, WireError> {
        if raw.is_empty() {
            return Err(WireError::Incomplete);
        }

        let mut buf = raw;
        let first = buf.get_u8();
        let segmented = first & SEG_BIT != 0;

        match (ctl, segmented) {
            (false, false) => {
                if buf.is_empty() {
                    return Err(WireError::Incomplete);
                }
                Ok(LowerTransportPdu::UnsegmentedAccess {
                    akf: first & AKF_BIT != 0,
                    aid: first & 0x3F,
                    upper_pdu: Bytes::copy_from_slice(buf),
                })
            }
            (false, true) => {
                if buf.len() < 4 {
                    return Err(WireError::Incomplete);
                }
                let info = SegmentInfo::unpack(buf.get_uint(3) as u32)?;
                if buf.len() > ACCESS_SEGMENT_SIZE {
                    return Err(WireError::Size(buf.len()));
                }
                Ok(LowerTransportPdu::SegmentedAccess {
                    akf: first & AKF_BIT != 0,
                    aid: first & 0x3F,
                    info,
                    segment: Bytes::copy_from_slice(buf),
                })
            }
            (true, false) => {
                let opcode = first & 0x7F;
                if opcode == SEGMENT_ACK_OPCODE {
                    if buf.len() != 6 {
                        return Err(WireError::Length {
                            pdu: "segment ack",
                            expected: 6,
                            actual: buf.len(),
                        });
                    }
                    let field = buf.get_u16();
                    if field & 0x0003 != 0 {
                        return Err(WireError::Reserved);
                    }
                    return Ok(LowerTransportPdu::SegmentAck(SegmentAck {
                        obo: field & 0x8000 != 0,
                        seq_zero: (field >> 2) & SEQ_ZERO_MASK,
                        block_ack: buf.get_u32(),
                    }));
                }
                if buf.len() > MAX_UNSEGMENTED_CONTROL {
                    return Err(WireError::Size(buf.len()));
                }
                Ok(LowerTransportPdu::UnsegmentedControl {
                    opcode,
                    params: Bytes::copy_from_slice(buf),
                })
            }
            (true, true) => {
                if buf.len() < 4 {
                    return Err(WireError::Incomplete);
                }
                let info = SegmentInfo::unpack(buf.get_uint(3) as u32)?;
                if buf.len() > CONTROL_SEGMENT_SIZE {
                    return Err(WireError::Size(buf.len()));
                }
                Ok(LowerTransportPdu::SegmentedControl {
                    opcode: first & 0x7F,
                    info,
                    segment: Bytes::copy_from_slice(buf),
                })
            }
        }
    }
}

fn akf_aid(akf: bool, aid: u8) -> u8 {
    if akf {
        AKF_BIT | (aid & 0x3F)
    } else {
        0
    }
}

fn check_segment(info: &SegmentInfo, segment: &[u8], max: usize) -> Result<(), WireError> {
    if info.seg_o > info.seg_n || info.seg_n as usize >= MAX_SEGMENTS {
        return Err(WireError::Segment {
            seg_o: info.seg_o,
            seg_n: info.seg_n,
        });
    }
    if segment.is_empty() || segment.len() > max {
        return Err(WireError::Size(segment.len()));
    }
    Ok(())
}

/// Reconstruct the full SeqAuth (`IVIndex || SeqOrigin`) from a segment's
/// sequence number and its 13-bit SeqZero.
///
/// The origin is the highest sequence number not above `seq` whose low 13
/// bits equal `seq_zero`.
pub fn seq_auth(iv_index: u32, seq: u32, seq_zero: u16) -> u64 {
    let delta = seq.wrapping_sub(seq_zero as u32) & SEQ_ZERO_MASK as u32;
    let origin = seq.wrapping_sub(delta) & 0x00FF_FFFF;
    ((iv_index as u64) << 24) | origin as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsegmented_access_layout() {
        let pdu = LowerTransportPdu::UnsegmentedAccess {
            akf: true,
            aid: 0x26,
            upper_pdu: Bytes::from_static(&[1, 2, 3, 4, 5]),
        };
        let encoded = pdu.encode().unwrap();
        assert_eq!(encoded[0], 0x66);
        assert_eq!(LowerTransportPdu::decode(false, &encoded).unwrap(), pdu);
    }

    #[test]
    fn test_device_key_clears_aid() {
        let pdu = LowerTransportPdu::UnsegmentedAccess {
            akf: false,
            aid: 0x3F,
            upper_pdu: Bytes::from_static(&[9; 8]),
        };
        assert_eq!(pdu.encode().unwrap()[0], 0x00);
    }

    #[test]
    fn test_segmented_access_header() {
        let pdu = LowerTransportPdu::SegmentedAccess {
            akf: true,
            aid: 0x26,
            info: SegmentInfo {
                szmic: false,
                seq_zero: 0x1234 & 0x1FFF,
                seg_o: 1,
                seg_n: 2,
            },
            segment: Bytes::from_static(&[0xAA; 12]),
        };
        let encoded = pdu.encode().unwrap();
        assert_eq!(encoded.len(), 16);
        assert_eq!(encoded[0], 0xE6);
        // SZMIC=0, SeqZero=0x1234, SegO=1, SegN=2
        let packed = (0x1234u32 << 10) | (1 << 5) | 2;
        assert_eq!(&encoded[1..4], &packed.to_be_bytes()[1..]);
        assert_eq!(LowerTransportPdu::decode(false, &encoded).unwrap(), pdu);
    }

    #[test]
    fn test_segment_ack_layout() {
        let ack = LowerTransportPdu::SegmentAck(SegmentAck {
            obo: false,
            seq_zero: 0x0001,
            block_ack: 0x0000_0003,
        });
        let encoded = ack.encode().unwrap();
        assert_eq!(encoded.as_ref(), &[0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x03]);
        assert_eq!(LowerTransportPdu::decode(true, &encoded).unwrap(), ack);
        assert!(ack.is_control());
    }

    #[test]
    fn test_segment_offset_beyond_count_rejected() {
        // SegO=3 > SegN=1
        let raw = [0x80u8, 0x00, 0x00, 0x61, 0x01];
        assert_eq!(
            LowerTransportPdu::decode(false, &raw).unwrap_err(),
            WireError::Segment { seg_o: 3, seg_n: 1 }
        );
    }

    #[test]
    fn test_oversized_unsegmented_rejected() {
        let pdu = LowerTransportPdu::UnsegmentedAccess {
            akf: false,
            aid: 0,
            upper_pdu: Bytes::from(vec![0u8; 16]),
        };
        assert_eq!(pdu.encode().unwrap_err(), WireError::Size(16));
    }

    #[test]
    fn test_unsegmented_control() {
        let pdu = LowerTransportPdu::UnsegmentedControl {
            opcode: 0x03,
            params: Bytes::from_static(&[0x4b, 0x50, 0x05]),
        };
        let encoded = pdu.encode().unwrap();
        assert_eq!(LowerTransportPdu::decode(true, &encoded).unwrap(), pdu);
    }

    #[test]
    fn test_seq_auth() {
        let iv = 0x12345678;
        assert_eq!(seq_auth(iv, 0x3129AB, 0x09AB), ((iv as u64) << 24) | 0x3129AB);
        // Later segment of the same message
        assert_eq!(seq_auth(iv, 0x3129AD, 0x09AB), ((iv as u64) << 24) | 0x3129AB);
        // SeqZero wrapped past the 13-bit boundary
        assert_eq!(seq_auth(iv, 0x002001, 0x1FFF), ((iv as u64) << 24) | 0x001FFF);
    }
}
