//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete PDU (need more data)
    #[error("incomplete pdu")]
    Incomplete,

    /// TTL outside 0..=127
    #[error("invalid ttl {0}")]
    Ttl(u8),

    /// Sequence number does not fit in 24 bits
    #[error("invalid sequence number {0:#x}")]
    Sequence(u32),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Exact length check failed
    #[error("bad length for {pdu}: expected {expected}, got {actual}")]
    Length {
        /// PDU being parsed
        pdu: &'static str,
        /// Required length
        expected: usize,
        /// Observed length
        actual: usize,
    },

    /// Reserved bits nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// Unknown PDU type
    #[error("unknown type {0}")]
    Type(u8),

    /// Unknown status or error code
    #[error("unknown code {0}")]
    Code(u8),

    /// Address not valid in this position
    #[error("invalid address {0:#06x}")]
    Address(u16),

    /// Field holds a prohibited value
    #[error("invalid field: {0}")]
    Field(&'static str),

    /// Segment index outside the declared segment count
    #[error("segment {seg_o} out of range 0..={seg_n}")]
    Segment {
        /// Segment offset
        seg_o: u8,
        /// Last segment index
        seg_n: u8,
    },

    /// Malformed PDU structure
    #[error("malformed pdu")]
    Malformed,
}
