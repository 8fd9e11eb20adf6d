//! Provisioning confirmation and session key derivation.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::primitives::{
    aes_ccm_decrypt, aes_ccm_encrypt, aes_cmac, k1, s1, MicSize, KEY_SIZE, NONCE_SIZE,
};

/// NetKey(16) || KeyIndex(2) || Flags(1) || IVIndex(4) || UnicastAddress(2)
pub const PROVISIONING_DATA_SIZE: usize = 25;

/// `s1(ConfirmationInputs)`
pub fn confirmation_salt(confirmation_inputs: &[u8]) -> [u8; 16] {
    s1(confirmation_inputs)
}

/// `k1(ECDHSecret, ConfirmationSalt, "prck")`
pub fn confirmation_key(ecdh_secret: &[u8], confirmation_salt: &[u8; 16]) -> [u8; KEY_SIZE] {
    k1(ecdh_secret, confirmation_salt, b"prck")
}

/// `AES-CMAC(ConfirmationKey, Random || AuthValue)`
pub fn confirmation_value(
    confirmation_key: &[u8; KEY_SIZE],
    random: &[u8; 16],
    auth_value: &[u8; 16],
) -> [u8; 16] {
    let mut input = [0u8; 32];
    input[..16].copy_from_slice(random);
    input[16..].copy_from_slice(auth_value);
    aes_cmac(confirmation_key, &input)
}

/// `s1(ConfirmationSalt || RandomProvisioner || RandomDevice)`
pub fn provisioning_salt(
    confirmation_salt: &[u8; 16],
    random_provisioner: &[u8; 16],
    random_device: &[u8; 16],
) -> [u8; 16] {
    let mut input = [0u8; 48];
    input[..16].copy_from_slice(confirmation_salt);
    input[16..32].copy_from_slice(random_provisioner);
    input[32..].copy_from_slice(random_device);
    s1(&input)
}

/// Keys that protect the Provisioning Data PDU, plus the new node's device key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Session key ("prsk")
    pub session_key: [u8; KEY_SIZE],
    /// Session nonce, the low 13 bytes of k1(.., "prsn")
    pub session_nonce: [u8; NONCE_SIZE],
    /// Device key ("prdk")
    pub device_key: [u8; KEY_SIZE],
}

impl SessionKeys {
    /// Derive all session keys from the ECDH secret and provisioning salt.
    pub fn derive(ecdh_secret: &[u8], provisioning_salt: &[u8; 16]) -> Self {
        let session_key = k1(ecdh_secret, provisioning_salt, b"prsk");
        let nonce_full = k1(ecdh_secret, provisioning_salt, b"prsn");
        let device_key = k1(ecdh_secret, provisioning_salt, b"prdk");

        let mut session_nonce = [0u8; NONCE_SIZE];
        session_nonce.copy_from_slice(&nonce_full[16 - NONCE_SIZE..]);

        Self {
            session_key,
            session_nonce,
            device_key,
        }
    }

    /// Encrypt the 25-byte Provisioning Data with a 64-bit MIC.
    pub fn seal_data(&self, data: &[u8; PROVISIONING_DATA_SIZE]) -> Result<Vec<u8>, CryptoError> {
        aes_ccm_encrypt(
            &self.session_key,
            &self.session_nonce,
            data,
            &[],
            MicSize::Long,
        )
    }

    /// Decrypt a sealed Provisioning Data PDU.
    pub fn open_data(&self, sealed: &[u8]) -> Result<[u8; PROVISIONING_DATA_SIZE], CryptoError> {
        let plain = aes_ccm_decrypt(
            &self.session_key,
            &self.session_nonce,
            sealed,
            &[],
            MicSize::Long,
        )?;
        if plain.len() != PROVISIONING_DATA_SIZE {
            return Err(CryptoError::InvalidLength(plain.len()));
        }

        let mut out = [0u8; PROVISIONING_DATA_SIZE];
        out.copy_from_slice(&plain);
        Ok(out)
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeys(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecdh::EcdhKeyPair;

    #[test]
    fn test_confirmation_matches_on_both_sides() {
        let provisioner = EcdhKeyPair::generate();
        let device = EcdhKeyPair::generate();
        let secret_p = provisioner.shared_secret(device.public_key()).unwrap();
        let secret_d = device.shared_secret(provisioner.public_key()).unwrap();

        let salt = confirmation_salt(b"invite-caps-start-keys");
        let random = [9u8; 16];
        let auth = [0u8; 16];

        let conf_p = confirmation_value(&confirmation_key(&secret_p, &salt), &random, &auth);
        let conf_d = confirmation_value(&confirmation_key(&secret_d, &salt), &random, &auth);
        assert_eq!(conf_p, conf_d);

        let other_auth = [1u8; 16];
        let wrong = confirmation_value(&confirmation_key(&secret_d, &salt), &random, &other_auth);
        assert_ne!(conf_p, wrong);
    }

    #[test]
    fn test_session_keys_seal_and_open() {
        let secret = [0x5Au8; 32];
        let salt = provisioning_salt(&[1u8; 16], &[2u8; 16], &[3u8; 16]);
        let keys = SessionKeys::derive(&secret, &salt);

        let data = [0xA5u8; PROVISIONING_DATA_SIZE];
        let sealed = keys.seal_data(&data).unwrap();
        assert_eq!(sealed.len(), PROVISIONING_DATA_SIZE + 8);
        assert_eq!(keys.open_data(&sealed).unwrap(), data);

        let mut tampered = sealed.clone();
        tampered[3] ^= 0xFF;
        assert_eq!(
            keys.open_data(&tampered),
            Err(CryptoError::AuthenticationFailure)
        );
    }

    #[test]
    fn test_session_nonce_is_low_bytes() {
        let secret = [0x11u8; 32];
        let salt = [0x22u8; 16];
        let keys = SessionKeys::derive(&secret, &salt);
        let full = k1(&secret, &salt, b"prsn");
        assert_eq!(&keys.session_nonce[..], &full[3..]);
        assert_ne!(keys.device_key, keys.session_key);
    }
}
