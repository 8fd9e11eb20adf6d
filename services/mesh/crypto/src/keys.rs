//! Derived key material for network and application keys.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::primitives::{k2, k3, k4, KEY_SIZE};

/// Everything derived from a network key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct NetworkKeyMaterial {
    /// 7-bit network identifier carried in every network PDU
    pub nid: u8,
    /// Network layer encryption key
    pub encryption_key: [u8; KEY_SIZE],
    /// Header obfuscation key
    pub privacy_key: [u8; KEY_SIZE],
    /// 64-bit public network id
    pub network_id: [u8; 8],
}

impl NetworkKeyMaterial {
    /// Derive NID, encryption and privacy keys (k2, P = 0x00) and the network id (k3).
    pub fn derive(net_key: &[u8; KEY_SIZE]) -> Self {
        let (nid, encryption_key, privacy_key) = k2(net_key, &[0x00]);
        Self {
            nid,
            encryption_key,
            privacy_key,
            network_id: k3(net_key),
        }
    }
}

impl fmt::Debug for NetworkKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkKeyMaterial")
            .field("nid", &format_args!("{:#04x}", self.nid))
            .field("encryption_key", &"<redacted>")
            .field("privacy_key", &"<redacted>")
            .finish()
    }
}

/// An application key together with its AID.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ApplicationKeyMaterial {
    /// 6-bit application key identifier
    pub aid: u8,
    /// Raw application key
    pub key: [u8; KEY_SIZE],
}

impl ApplicationKeyMaterial {
    /// Derive the AID (k4) for an application key.
    pub fn derive(app_key: &[u8; KEY_SIZE]) -> Self {
        Self {
            aid: k4(app_key),
            key: *app_key,
        }
    }
}

impl fmt::Debug for ApplicationKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationKeyMaterial")
            .field("aid", &format_args!("{:#04x}", self.aid))
            .field("key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_key_material() {
        let mut net_key = [0u8; 16];
        net_key.copy_from_slice(&hex::decode("7dd7364cd842ad18c17c2b820c84c3d6").unwrap());

        let material = NetworkKeyMaterial::derive(&net_key);
        assert_eq!(material.nid, 0x68);
        assert_eq!(
            hex::encode(material.encryption_key),
            "0953fa93e7caac9638f58820220a398e"
        );
        assert_eq!(
            hex::encode(material.privacy_key),
            "8b84eedec100067d670971dd2aa700cf"
        );
    }

    #[test]
    fn test_debug_redacts_keys() {
        let material = NetworkKeyMaterial::derive(&[0x11; 16]);
        let printed = format!("{:?}", material);
        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains("17, 17"));

        let app = ApplicationKeyMaterial::derive(&[0x22; 16]);
        assert!(!format!("{:?}", app).contains("34, 34"));
    }
}
