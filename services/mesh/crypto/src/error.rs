//! Crypto error types.

use thiserror::Error;

/// Cryptographic operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// MIC did not verify; no plaintext is produced
    #[error("authentication failure")]
    AuthenticationFailure,

    /// Peer public key is not a point on P-256
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Private key bytes are not a valid P-256 scalar
    #[error("invalid private key")]
    InvalidPrivateKey,

    /// Cipher refused the input
    #[error("encryption failed")]
    Encryption,

    /// Input has the wrong size for the operation
    #[error("invalid length: {0}")]
    InvalidLength(usize),
}
