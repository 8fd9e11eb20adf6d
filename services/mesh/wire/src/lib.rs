//! Bit-exact PDU formats for the Bluetooth mesh engine.
//!
//! This crate provides the stateless encoders and decoders for every layer
//! below the access models: network PDUs with AES-CCM and header obfuscation,
//! lower transport PDUs and segmentation buffers, access opcodes, the
//! provisioning protocol, and the proxy PDU framing used on the GATT bearer.
//!
//! ## Features
//!
//! - **Network codec**: Nonce construction, NetMIC sealing and privacy obfuscation
//! - **Zero-Copy I/O**: Uses `Bytes`/`BytesMut` for minimal allocations
//! - **Segmentation**: 12-octet access segments with BlockAck bitmaps
//! - **Provisioning PDUs**: Exact-length decoding mapped to failure codes
//! - **Proxy SAR**: MTU-bounded splitting and reassembly of bearer messages
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | IVI(1) | NID(7)      | clear                      |
//! +----------------------+----------------------------+
//! | CTL|TTL, SEQ, SRC    | obfuscated (6 octets)      |
//! +----------------------+----------------------------+
//! | DST || TransportPDU  | encrypted (3..18 octets)   |
//! +----------------------+----------------------------+
//! | NetMIC               | 4 (access) or 8 (control)  |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod address;
pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod provisioning;
pub mod proxy;
pub mod segment;

// Re-export main types
pub use access::{access_payload, Opcode, MAX_ACCESS_PAYLOAD};
pub use address::{Address, AddressKind};
pub use codec::{
    application_nonce, decode_network_pdu, device_nonce, encode_network_pdu, network_nonce,
    peek_ivi_nid, CodecError, NetworkPdu, MAX_NETWORK_PDU_SIZE, MIN_NETWORK_PDU_SIZE,
};
pub use error::WireError;
pub use frame::{
    seq_auth, LowerTransportPdu, SegmentAck, SegmentInfo, ACCESS_SEGMENT_SIZE, MAX_SEGMENTS,
    MAX_UNSEGMENTED_ACCESS,
};
pub use header::{NetworkHeader, MAX_SEQ, MAX_TTL};
pub use provisioning::{
    AuthMethod, Capabilities, FailureCode, ProvisioningData, ProvisioningPdu, ProvisioningPduType,
    PublicKeyTypes, Start,
};
pub use proxy::{ProxyPduType, ProxyReassembler, ProxySegments};
pub use segment::{full_mask, SegmentBuffer, Segmenter, MAX_UPPER_TRANSPORT_PDU};
