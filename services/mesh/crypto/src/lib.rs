//! Cryptographic primitives for the Bluetooth mesh engine.
//!
//! Everything above the bearer is secured with AES-128: AES-CMAC drives the
//! key derivation functions (`s1`, `k1`..`k4`), AES-CCM seals network,
//! transport and provisioning payloads, and a single ECB block (`e`) produces
//! the privacy pad that obfuscates network headers.
//!
//! ## Key hierarchy
//!
//! ```text
//!   NetKey ──k2──> NID (7 bits), EncryptionKey, PrivacyKey
//!          ──k3──> Network ID (64 bits)
//!   AppKey ──k4──> AID (6 bits)
//!   ECDH secret ──k1("prck")──> ConfirmationKey
//!               ──k1("prsk")──> SessionKey
//!               ──k1("prsn")──> SessionNonce (low 13 bytes)
//!               ──k1("prdk")──> DeviceKey
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ecdh;
pub mod error;
pub mod keys;
pub mod primitives;
pub mod provisioning;

pub use ecdh::{EcdhKeyPair, PUBLIC_KEY_SIZE, SHARED_SECRET_SIZE};
pub use error::CryptoError;
pub use keys::{ApplicationKeyMaterial, NetworkKeyMaterial};
pub use primitives::{
    aes_ccm_decrypt, aes_ccm_encrypt, aes_cmac, e, k1, k2, k3, k4, s1, MicSize, KEY_SIZE,
    NONCE_SIZE,
};
pub use provisioning::{
    confirmation_key, confirmation_salt, confirmation_value, provisioning_salt, SessionKeys,
    PROVISIONING_DATA_SIZE,
};

/// A 128-bit key as used throughout the mesh protocol
pub type Key128 = [u8; KEY_SIZE];
