//! Segmentation of upper transport PDUs and reassembly buffers.
//!
//! Upper transport PDUs that do not fit an unsegmented access message are
//! split into 12-octet segments. The receiver collects them in any order into
//! a [`SegmentBuffer`] whose bitmap doubles as the BlockAck value.

use bytes::{Bytes, BytesMut};

use crate::error::WireError;
use crate::frame::{LowerTransportPdu, SegmentInfo, ACCESS_SEGMENT_SIZE, MAX_SEGMENTS};

/// Largest upper transport PDU (32 segments of 12 octets)
pub const MAX_UPPER_TRANSPORT_PDU: usize = ACCESS_SEGMENT_SIZE * MAX_SEGMENTS;

/// Splits upper transport access PDUs into segments
#[derive(Debug, Clone, Copy)]
pub struct Segmenter {
    segment_size: usize,
}

impl Segmenter {
    /// Create a segmenter for access messages
    pub fn new() -> Self {
        Self {
            segment_size: ACCESS_SEGMENT_SIZE,
        }
    }

    /// Number of segments `len` octets occupy
    pub fn segment_count(&self, len: usize) -> usize {
        (len + self.segment_size - 1) / self.segment_size
    }

    /// Split an upper transport PDU into segmented access PDUs
    pub fn segment_access(
        &self,
        akf: bool,
        aid: u8,
        szmic: bool,
        seq_zero: u16,
        upper_pdu: &Bytes,
    ) -> Result<Vec<LowerTransportPdu>, WireError> {
        if upper_pdu.is_empty() {
            return Err(WireError::Incomplete);
        }
        if upper_pdu.len() > MAX_UPPER_TRANSPORT_PDU {
            return Err(WireError::Size(upper_pdu.len()));
        }

        let total = self.segment_count(upper_pdu.len());
        let seg_n = (total - 1) as u8;
        let mut segments = Vec::with_capacity(total);

        for seg_o in 0..total {
            let start = seg_o * self.segment_size;
            let end = std::cmp::min(start + self.segment_size, upper_pdu.len());
            segments.push(LowerTransportPdu::SegmentedAccess {
                akf,
                aid,
                info: SegmentInfo {
                    szmic,
                    seq_zero: seq_zero & 0x1FFF,
                    seg_o: seg_o as u8,
                    seg_n,
                },
                segment: upper_pdu.slice(start..end),
            });
        }

        Ok(segments)
    }
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects the segments of one message
#[derive(Debug, Clone)]
pub struct SegmentBuffer {
    seg_n: u8,
    segment_size: usize,
    slots: Vec<Option<Bytes>>,
    received: u32,
}

impl SegmentBuffer {
    /// Create a buffer for `seg_n + 1` access segments
    pub fn new(seg_n: u8) -> Result<Self, WireError> {
        Self::with_segment_size(seg_n, ACCESS_SEGMENT_SIZE)
    }

    /// Create a buffer with an explicit segment size
    pub fn with_segment_size(seg_n: u8, segment_size: usize) -> Result<Self, WireError> {
        if seg_n as usize >= MAX_SEGMENTS {
            return Err(WireError::Segment { seg_o: 0, seg_n });
        }
        Ok(Self {
            seg_n,
            segment_size,
            slots: vec![None; seg_n as usize + 1],
            received: 0,
        })
    }

    /// Index of the last segment
    pub fn seg_n(&self) -> u8 {
        self.seg_n
    }

    /// Store a segment. Returns `false` for a duplicate.
    pub fn insert(&mut self, seg_o: u8, data: Bytes) -> Result<bool, WireError> {
        if seg_o > self.seg_n {
            return Err(WireError::Segment {
                seg_o,
                seg_n: self.seg_n,
            });
        }
        // Only the last segment may be short
        if data.is_empty()
            || data.len() > self.segment_size
            || (seg_o < self.seg_n && data.len() != self.segment_size)
        {
            return Err(WireError::Size(data.len()));
        }

        let bit = 1u32 << seg_o;
        if self.received & bit != 0 {
            return Ok(false);
        }
        self.slots[seg_o as usize] = Some(data);
        self.received |= bit;
        Ok(true)
    }

    /// BlockAck bitmap of received segments
    pub fn block_ack(&self) -> u32 {
        self.received
    }

    /// Bitmap with every segment set
    pub fn full_mask(&self) -> u32 {
        full_mask(self.seg_n)
    }

    /// All segments present
    pub fn is_complete(&self) -> bool {
        self.received == self.full_mask()
    }

    /// Concatenate the segments; `None` until complete
    pub fn assemble(&self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        let mut out = BytesMut::with_capacity(self.slots.len() * self.segment_size);
        for slot in self.slots.iter().flatten() {
            out.extend_from_slice(slot);
        }
        Some(out.freeze())
    }
}

/// Bitmap with bits `0..=seg_n` set
pub fn full_mask(seg_n: u8) -> u32 {
    if seg_n as usize >= MAX_SEGMENTS - 1 {
        u32::MAX
    } else {
        (1u32 << (seg_n + 1)) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| i as u8).collect::<Vec<u8>>())
    }

    fn segment_data(pdu: &LowerTransportPdu) -> (u8, Bytes) {
        match pdu {
            LowerTransportPdu::SegmentedAccess { info, segment, .. } => {
                (info.seg_o, segment.clone())
            }
            other => panic!("unexpected pdu {:?}", other),
        }
    }

    #[test]
    fn test_segment_sizes() {
        let segments = Segmenter::new()
            .segment_access(true, 1, false, 5, &payload(30))
            .unwrap();
        assert_eq!(segments.len(), 3);
        let sizes: Vec<usize> = segments.iter().map(|s| segment_data(s).1.len()).collect();
        assert_eq!(sizes, vec![12, 12, 6]);
    }

    #[test]
    fn test_out_of_order_reassembly_matches_in_order() {
        let data = payload(40);
        let segments = Segmenter::new()
            .segment_access(true, 1, false, 5, &data)
            .unwrap();

        let mut in_order = SegmentBuffer::new(3).unwrap();
        for s in &segments {
            let (o, d) = segment_data(s);
            in_order.insert(o, d).unwrap();
        }

        let mut shuffled = SegmentBuffer::new(3).unwrap();
        for idx in [2usize, 0, 3, 1] {
            let (o, d) = segment_data(&segments[idx]);
            assert!(shuffled.assemble().is_none());
            shuffled.insert(o, d).unwrap();
        }

        assert_eq!(in_order.assemble().unwrap(), data);
        assert_eq!(shuffled.assemble().unwrap(), data);
    }

    #[test]
    fn test_duplicate_and_block_ack() {
        let mut buffer = SegmentBuffer::new(2).unwrap();
        assert!(buffer.insert(1, Bytes::from(vec![0u8; 12])).unwrap());
        assert!(!buffer.insert(1, Bytes::from(vec![0u8; 12])).unwrap());
        assert_eq!(buffer.block_ack(), 0b010);
        assert!(!buffer.is_complete());
    }

    #[test]
    fn test_short_middle_segment_rejected() {
        let mut buffer = SegmentBuffer::new(2).unwrap();
        assert_eq!(
            buffer.insert(0, Bytes::from(vec![0u8; 5])).unwrap_err(),
            WireError::Size(5)
        );
        assert!(buffer.insert(3, Bytes::from(vec![0u8; 1])).is_err());
    }

    #[test]
    fn test_limits() {
        assert!(Segmenter::new()
            .segment_access(false, 0, false, 0, &payload(MAX_UPPER_TRANSPORT_PDU + 1))
            .is_err());
        assert_eq!(full_mask(31), u32::MAX);
        assert_eq!(full_mask(0), 1);
        assert!(SegmentBuffer::new(32).is_err());
    }
}
