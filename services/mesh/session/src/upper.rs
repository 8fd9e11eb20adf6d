//! Upper transport encryption of access payloads.

use bytes::Bytes;
use mesh_crypto::{aes_ccm_decrypt, aes_ccm_encrypt, MicSize, KEY_SIZE};
use mesh_wire::{application_nonce, device_nonce, MAX_UNSEGMENTED_ACCESS};
use serde::{Deserialize, Serialize};

use crate::error::MeshError;

/// Which key secures an access message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyRef {
    /// Application key by index (AKF = 1)
    App(u16),
    /// Device key of the remote node, or of the local node when it is the
    /// destination (AKF = 0)
    Device,
}

/// Nonce family for the upper transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceKind {
    /// Application nonce (0x01)
    Application,
    /// Device nonce (0x02)
    Device,
}

/// Addressing fields that enter the nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpperContext {
    /// Sequence number of the (first segment of the) message
    pub seq: u32,
    /// Source element
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// IV index
    pub iv_index: u32,
    /// 64-bit TransMIC (segmented messages only)
    pub szmic: bool,
}

impl UpperContext {
    fn nonce(&self, kind: NonceKind) -> [u8; 13] {
        match kind {
            NonceKind::Application => {
                application_nonce(self.szmic, self.seq, self.src, self.dst, self.iv_index)
            }
            NonceKind::Device => device_nonce(self.szmic, self.seq, self.src, self.dst, self.iv_index),
        }
    }
}

/// Whether an access payload of `len` octets needs segmentation
pub fn needs_segmentation(len: usize) -> bool {
    len + MicSize::Short.size() > MAX_UNSEGMENTED_ACCESS
}

/// Pick the 64-bit TransMIC when it costs no extra segment
pub fn choose_szmic(len: usize) -> bool {
    if !needs_segmentation(len) {
        return false;
    }
    let segments = |total: usize| (total + 11) / 12;
    segments(len + MicSize::Long.size()) == segments(len + MicSize::Short.size())
}

/// Encrypt an access payload into an upper transport PDU
pub fn seal(
    key: &[u8; KEY_SIZE],
    kind: NonceKind,
    ctx: &UpperContext,
    access_payload: &[u8],
) -> Result<Bytes, MeshError> {
    let mic = MicSize::from_flag(ctx.szmic);
    let sealed = aes_ccm_encrypt(key, &ctx.nonce(kind), access_payload, &[], mic)?;
    Ok(Bytes::from(sealed))
}

/// Decrypt an upper transport PDU. A bad TransMIC yields `AuthenticationFailure`.
pub fn open(
    key: &[u8; KEY_SIZE],
    kind: NonceKind,
    ctx: &UpperContext,
    upper_pdu: &[u8],
) -> Result<Bytes, MeshError> {
    let mic = MicSize::from_flag(ctx.szmic);
    let plain = aes_ccm_decrypt(key, &ctx.nonce(kind), upper_pdu, &[], mic)?;
    Ok(Bytes::from(plain))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(szmic: bool) -> UpperContext {
        UpperContext {
            seq: 0x000007,
            src: 0x1201,
            dst: 0xFFFF,
            iv_index: 0x12345678,
            szmic,
        }
    }

    #[test]
    fn test_seal_open_app_key() {
        let key = [0x63; 16];
        let payload = [0x82, 0x02, 0x01, 0x00];
        let sealed = seal(&key, NonceKind::Application, &ctx(false), &payload).unwrap();
        assert_eq!(sealed.len(), payload.len() + 4);

        let opened = open(&key, NonceKind::Application, &ctx(false), &sealed).unwrap();
        assert_eq!(opened.as_ref(), &payload);
    }

    #[test]
    fn test_flipped_byte_fails_authentication() {
        let key = [0x63; 16];
        let sealed = seal(&key, NonceKind::Device, &ctx(true), &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(sealed.len(), 5 + 8);

        let mut corrupted = sealed.to_vec();
        corrupted[0] ^= 0x80;
        assert!(matches!(
            open(&key, NonceKind::Device, &ctx(true), &corrupted),
            Err(MeshError::AuthenticationFailure)
        ));
    }

    #[test]
    fn test_nonce_kind_matters() {
        let key = [0x63; 16];
        let sealed = seal(&key, NonceKind::Application, &ctx(false), &[1, 2, 3]).unwrap();
        assert!(open(&key, NonceKind::Device, &ctx(false), &sealed).is_err());
    }

    #[test]
    fn test_segmentation_thresholds() {
        assert!(!needs_segmentation(11));
        assert!(needs_segmentation(12));
        // 12 + 4 = 16 and 12 + 8 = 20 both take two segments
        assert!(choose_szmic(12));
        // 33 + 4 = 37 and 33 + 8 = 41 both take four
        assert!(choose_szmic(33));
        // 20 + 4 = 24 is two segments, 20 + 8 = 28 would be three
        assert!(!choose_szmic(20));
    }
}
