//! Network PDU encoding and decoding.
//!
//! This module is pure: it knows nothing about sequence allocation or replay
//! protection, which live in the session layer. It builds the nonces for the
//! network, application and device layers and applies AES-CCM and header
//! obfuscation exactly as they appear on the air.

use bytes::{BufMut, Bytes, BytesMut};
use mesh_crypto::{
    aes_ccm_decrypt, aes_ccm_encrypt, e, CryptoError, MicSize, NetworkKeyMaterial,
};
use thiserror::Error;

use crate::address::Address;
use crate::error::WireError;
use crate::header::{pack_ivi_nid, unpack_ivi_nid, NetworkHeader, OBFUSCATED_HEADER_SIZE};

/// Smallest network PDU: IVI/NID, header, DST, one transport octet, 32-bit NetMIC
pub const MIN_NETWORK_PDU_SIZE: usize = 14;

/// Largest network PDU carried by an advertising packet
pub const MAX_NETWORK_PDU_SIZE: usize = 29;

/// Largest lower transport PDU for access messages
pub const MAX_ACCESS_TRANSPORT_PDU: usize = 16;

/// Largest lower transport PDU for control messages
pub const MAX_CONTROL_TRANSPORT_PDU: usize = 12;

const NONCE_NETWORK: u8 = 0x00;
const NONCE_APPLICATION: u8 = 0x01;
const NONCE_DEVICE: u8 = 0x02;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Wire protocol error
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Crypto failure (bad MIC or key)
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// PDU was produced under a different network key
    #[error("nid mismatch: expected {expected:#04x}, got {actual:#04x}")]
    NidMismatch {
        /// NID of the key in use
        expected: u8,
        /// NID found on the PDU
        actual: u8,
    },
}

/// A decoded (clear-text) network PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPdu {
    /// Control message flag; selects the 64-bit NetMIC
    pub ctl: bool,
    /// Time to live
    pub ttl: u8,
    /// 24-bit sequence number
    pub seq: u32,
    /// Source element address
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// Lower transport PDU
    pub transport_pdu: Bytes,
}

impl NetworkPdu {
    fn header(&self) -> Result<NetworkHeader, WireError> {
        NetworkHeader::new(self.ctl, self.ttl, self.seq, self.src)
    }

    fn net_mic(&self) -> MicSize {
        MicSize::from_flag(self.ctl)
    }
}

fn nonce(kind: u8, second: u8, seq: u32, src: u16, dst: u16, iv_index: u32) -> [u8; 13] {
    let mut out = [0u8; 13];
    let mut buf = &mut out[..];
    buf.put_u8(kind);
    buf.put_u8(second);
    buf.put_uint(seq as u64, 3);
    buf.put_u16(src);
    buf.put_u16(dst);
    buf.put_u32(iv_index);
    out
}

/// Network nonce: `0x00 || CTL|TTL || SEQ || SRC || 0x0000 || IVIndex`
pub fn network_nonce(ctl: bool, ttl: u8, seq: u32, src: u16, iv_index: u32) -> [u8; 13] {
    let ctl_ttl = ((ctl as u8) << 7) | (ttl & 0x7F);
    nonce(NONCE_NETWORK, ctl_ttl, seq, src, 0x0000, iv_index)
}

/// Application nonce: `0x01 || ASZMIC<<7 || SEQ || SRC || DST || IVIndex`
pub fn application_nonce(aszmic: bool, seq: u32, src: u16, dst: u16, iv_index: u32) -> [u8; 13] {
    nonce(NONCE_APPLICATION, (aszmic as u8) << 7, seq, src, dst, iv_index)
}

/// Device nonce: `0x02 || ASZMIC<<7 || SEQ || SRC || DST || IVIndex`
pub fn device_nonce(aszmic: bool, seq: u32, src: u16, dst: u16, iv_index: u32) -> [u8; 13] {
    nonce(NONCE_DEVICE, (aszmic as u8) << 7, seq, src, dst, iv_index)
}

/// Privacy random is the first seven octets of `EncDST || EncTransportPDU || NetMIC`
fn privacy_pad(privacy_key: &[u8; 16], iv_index: u32, encrypted: &[u8]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[5..9].copy_from_slice(&iv_index.to_be_bytes());
    block[9..16].copy_from_slice(&encrypted[..7]);
    e(privacy_key, &block)
}

fn xor_header(header: &mut [u8; OBFUSCATED_HEADER_SIZE], pad: &[u8; 16]) {
    for (byte, mask) in header.iter_mut().zip(pad.iter()) {
        *byte ^= mask;
    }
}

/// Encrypt and obfuscate a network PDU.
///
/// `iv_index` is the transmit IV index; its low bit becomes IVI.
pub fn encode_network_pdu(
    keys: &NetworkKeyMaterial,
    iv_index: u32,
    pdu: &NetworkPdu,
) -> Result<Bytes, CodecError> {
    let header = pdu.header()?;

    let limit = if pdu.ctl {
        MAX_CONTROL_TRANSPORT_PDU
    } else {
        MAX_ACCESS_TRANSPORT_PDU
    };
    if pdu.transport_pdu.is_empty() || pdu.transport_pdu.len() > limit {
        return Err(WireError::Size(pdu.transport_pdu.len()).into());
    }
    if !Address(pdu.src).is_valid_source() {
        return Err(WireError::Address(pdu.src).into());
    }
    if !Address(pdu.dst).is_valid_destination() {
        return Err(WireError::Address(pdu.dst).into());
    }

    let mut plaintext = BytesMut::with_capacity(2 + pdu.transport_pdu.len());
    plaintext.put_u16(pdu.dst);
    plaintext.put_slice(&pdu.transport_pdu);

    let nonce = network_nonce(pdu.ctl, pdu.ttl, pdu.seq, pdu.src, iv_index);
    let encrypted = aes_ccm_encrypt(
        &keys.encryption_key,
        &nonce,
        &plaintext,
        &[],
        pdu.net_mic(),
    )?;

    let pad = privacy_pad(&keys.privacy_key, iv_index, &encrypted);
    let mut obfuscated = header.to_bytes();
    xor_header(&mut obfuscated, &pad);

    let mut out = BytesMut::with_capacity(1 + OBFUSCATED_HEADER_SIZE + encrypted.len());
    out.put_u8(pack_ivi_nid(iv_index, keys.nid));
    out.put_slice(&obfuscated);
    out.put_slice(&encrypted);
    Ok(out.freeze())
}

/// Read the clear-text `(IVI, NID)` of a raw network PDU.
pub fn peek_ivi_nid(raw: &[u8]) -> Result<(u8, u8), CodecError> {
    if raw.len() < MIN_NETWORK_PDU_SIZE {
        return Err(WireError::Incomplete.into());
    }
    if raw.len() > MAX_NETWORK_PDU_SIZE {
        return Err(WireError::Size(raw.len()).into());
    }
    Ok(unpack_ivi_nid(raw[0]))
}

/// Deobfuscate and decrypt a network PDU with the receive IV index.
pub fn decode_network_pdu(
    keys: &NetworkKeyMaterial,
    iv_index: u32,
    raw: &[u8],
) -> Result<NetworkPdu, CodecError> {
    let (_ivi, nid) = peek_ivi_nid(raw)?;
    if nid != keys.nid {
        return Err(CodecError::NidMismatch {
            expected: keys.nid,
            actual: nid,
        });
    }

    let encrypted = &raw[1 + OBFUSCATED_HEADER_SIZE..];
    let pad = privacy_pad(&keys.privacy_key, iv_index, encrypted);

    let mut header_bytes = [0u8; OBFUSCATED_HEADER_SIZE];
    header_bytes.copy_from_slice(&raw[1..1 + OBFUSCATED_HEADER_SIZE]);
    xor_header(&mut header_bytes, &pad);
    let header = NetworkHeader::from_bytes(&header_bytes);

    let mic = MicSize::from_flag(header.ctl);
    // DST plus at least one transport octet must remain after the MIC
    if encrypted.len() < 3 + mic.size() {
        return Err(WireError::Incomplete.into());
    }

    let nonce = network_nonce(header.ctl, header.ttl, header.seq, header.src, iv_index);
    let plaintext = aes_ccm_decrypt(&keys.encryption_key, &nonce, encrypted, &[], mic)?;

    let dst = u16::from_be_bytes([plaintext[0], plaintext[1]]);
    Ok(NetworkPdu {
        ctl: header.ctl,
        ttl: header.ttl,
        seq: header.seq,
        src: header.src,
        dst,
        transport_pdu: Bytes::copy_from_slice(&plaintext[2..]),
    })
}
