//! 128-bit key storage with redacted debug output.

use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A 128-bit network, application or device key
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MeshKey([u8; 16]);

impl MeshKey {
    /// Wrap raw key bytes
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a random key from the thread RNG
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for MeshKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MeshKey(<redacted>)")
    }
}

impl Serialize for MeshKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(self.0))
    }
}

impl<'de> Deserialize<'de> for MeshKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(text.trim(), &mut bytes).map_err(D::Error::custom)?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_serialization() {
        let key = MeshKey::new([0xAB; 16]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"ABABABABABABABABABABABABABABABAB\"");
        assert_eq!(serde_json::from_str::<MeshKey>(&json).unwrap(), key);
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(serde_json::from_str::<MeshKey>("\"ABCD\"").is_err());
    }

    #[test]
    fn test_debug_redacted() {
        assert_eq!(format!("{:?}", MeshKey::new([1; 16])), "MeshKey(<redacted>)");
        assert_ne!(MeshKey::random(), MeshKey::random());
    }
}
