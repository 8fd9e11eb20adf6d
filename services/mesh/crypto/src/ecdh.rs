//! P-256 key agreement used during provisioning.
//!
//! Public keys travel on the wire as the raw 64-byte `X || Y` concatenation;
//! the SEC1 uncompressed prefix is added and stripped here.

use std::fmt;

use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use tracing::trace;

use crate::error::CryptoError;

/// Size of a raw public key on the wire
pub const PUBLIC_KEY_SIZE: usize = 64;

/// Size of the ECDH shared secret
pub const SHARED_SECRET_SIZE: usize = 32;

/// An ephemeral P-256 key pair.
pub struct EcdhKeyPair {
    secret: SecretKey,
    public: [u8; PUBLIC_KEY_SIZE],
}

impl EcdhKeyPair {
    /// Generate a fresh key pair from the OS RNG.
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::random(&mut OsRng))
    }

    /// Rebuild a key pair from a 32-byte private scalar.
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let point = secret.public_key().to_encoded_point(false);
        let mut public = [0u8; PUBLIC_KEY_SIZE];
        // Skip the 0x04 uncompressed-point tag
        public.copy_from_slice(&point.as_bytes()[1..]);
        Self { secret, public }
    }

    /// Raw `X || Y` public key
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public
    }

    /// Compute the shared secret with a peer's raw public key.
    pub fn shared_secret(
        &self,
        peer_public: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<[u8; SHARED_SECRET_SIZE], CryptoError> {
        let peer = parse_public_key(peer_public)?;
        let shared = diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());

        let mut out = [0u8; SHARED_SECRET_SIZE];
        out.copy_from_slice(shared.raw_secret_bytes());
        trace!("Computed ECDH shared secret");
        Ok(out)
    }
}

impl fmt::Debug for EcdhKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcdhKeyPair")
            .field("secret", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Validate a raw `X || Y` public key as a point on the curve.
pub fn parse_public_key(raw: &[u8; PUBLIC_KEY_SIZE]) -> Result<PublicKey, CryptoError> {
    let mut sec1 = [0u8; PUBLIC_KEY_SIZE + 1];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(raw);
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| CryptoError::InvalidPublicKey)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_secret_agrees() {
        let provisioner = EcdhKeyPair::generate();
        let device = EcdhKeyPair::generate();

        let a = provisioner.shared_secret(device.public_key()).unwrap();
        let b = device.shared_secret(provisioner.public_key()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_point_off_curve() {
        let pair = EcdhKeyPair::generate();
        let bogus = [0x01u8; PUBLIC_KEY_SIZE];
        assert_eq!(
            pair.shared_secret(&bogus),
            Err(CryptoError::InvalidPublicKey)
        );
    }

    #[test]
    fn test_from_private_bytes_is_deterministic() {
        let scalar = [0x42u8; 32];
        let a = EcdhKeyPair::from_private_bytes(&scalar).unwrap();
        let b = EcdhKeyPair::from_private_bytes(&scalar).unwrap();
        assert_eq!(a.public_key(), b.public_key());

        assert_eq!(
            EcdhKeyPair::from_private_bytes(&[0u8; 32]).unwrap_err(),
            CryptoError::InvalidPrivateKey
        );
    }
}
