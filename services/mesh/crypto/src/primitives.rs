//! AES-128 based primitives and the mesh key derivation functions.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use ccm::aead::{Aead, Payload};
use ccm::consts::{U13, U4, U8};
use ccm::Ccm;
use cmac::{Cmac, Mac};

use crate::error::CryptoError;

/// Size of every AES-128 key in the protocol
pub const KEY_SIZE: usize = 16;

/// Size of every AES-CCM nonce in the protocol
pub const NONCE_SIZE: usize = 13;

type CcmShort = Ccm<Aes128, U4, U13>;
type CcmLong = Ccm<Aes128, U8, U13>;

/// Message integrity check length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MicSize {
    /// 32-bit MIC
    Short,
    /// 64-bit MIC
    Long,
}

impl MicSize {
    /// MIC length in bytes
    pub fn size(self) -> usize {
        match self {
            MicSize::Short => 4,
            MicSize::Long => 8,
        }
    }

    /// Pick the MIC size from a SZMIC / CTL style flag
    pub fn from_flag(long: bool) -> Self {
        if long {
            MicSize::Long
        } else {
            MicSize::Short
        }
    }
}

/// Single AES-128 block encryption (security function `e`).
pub fn e(key: &[u8; KEY_SIZE], plaintext: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = GenericArray::clone_from_slice(plaintext);
    cipher.encrypt_block(&mut block);

    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    out
}

/// AES-CMAC over the concatenation of `parts`.
fn cmac_parts(key: &[u8; KEY_SIZE], parts: &[&[u8]]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key));
    for part in parts {
        mac.update(part);
    }

    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// AES-CMAC with a 128-bit key.
pub fn aes_cmac(key: &[u8; KEY_SIZE], message: &[u8]) -> [u8; 16] {
    cmac_parts(key, &[message])
}

/// Salt generation function `s1`.
pub fn s1(message: &[u8]) -> [u8; 16] {
    aes_cmac(&[0u8; KEY_SIZE], message)
}

/// Key derivation function `k1`.
pub fn k1(n: &[u8], salt: &[u8; 16], p: &[u8]) -> [u8; 16] {
    let t = aes_cmac(salt, n);
    aes_cmac(&t, p)
}

/// Network key derivation function `k2`.
///
/// Returns `(NID, EncryptionKey, PrivacyKey)`.
pub fn k2(n: &[u8; KEY_SIZE], p: &[u8]) -> (u8, [u8; 16], [u8; 16]) {
    let salt = s1(b"smk2");
    let t = aes_cmac(&salt, n);

    let t1 = cmac_parts(&t, &[p, &[0x01]]);
    let t2 = cmac_parts(&t, &[&t1, p, &[0x02]]);
    let t3 = cmac_parts(&t, &[&t2, p, &[0x03]]);

    (t1[15] & 0x7F, t2, t3)
}

/// Derivation function `k3`, producing the 64-bit network id.
pub fn k3(n: &[u8; KEY_SIZE]) -> [u8; 8] {
    let salt = s1(b"smk3");
    let t = aes_cmac(&salt, n);
    let full = aes_cmac(&t, b"id64\x01");

    let mut out = [0u8; 8];
    out.copy_from_slice(&full[8..]);
    out
}

/// Derivation function `k4`, producing the 6-bit application key id.
pub fn k4(n: &[u8; KEY_SIZE]) -> u8 {
    let salt = s1(b"smk4");
    let t = aes_cmac(&salt, n);
    aes_cmac(&t, b"id6\x01")[15] & 0x3F
}

/// AES-CCM seal. Returns `ciphertext || MIC`.
pub fn aes_ccm_encrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>, CryptoError> {
    let nonce = GenericArray::from_slice(nonce);
    let payload = Payload {
        msg: plaintext,
        aad,
    };

    let sealed = match mic {
        MicSize::Short => CcmShort::new(GenericArray::from_slice(key)).encrypt(nonce, payload),
        MicSize::Long => CcmLong::new(GenericArray::from_slice(key)).encrypt(nonce, payload),
    };

    sealed.map_err(|_| CryptoError::Encryption)
}

/// AES-CCM open of `ciphertext || MIC`.
///
/// A MIC that does not verify yields [`CryptoError::AuthenticationFailure`].
pub fn aes_ccm_decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    sealed: &[u8],
    aad: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < mic.size() {
        return Err(CryptoError::InvalidLength(sealed.len()));
    }

    let nonce = GenericArray::from_slice(nonce);
    let payload = Payload { msg: sealed, aad };

    let opened = match mic {
        MicSize::Short => CcmShort::new(GenericArray::from_slice(key)).decrypt(nonce, payload),
        MicSize::Long => CcmLong::new(GenericArray::from_slice(key)).decrypt(nonce, payload),
    };

    opened.map_err(|_| CryptoError::AuthenticationFailure)
}
