//! Stateful network layer: sequence numbers, IV index and replay protection.
//!
//! The layer is single-writer. The engine keeps it behind one async mutex so
//! that sequence allocation, encoding and the bearer write of a PDU happen as
//! one step.

use bytes::Bytes;
use mesh_crypto::NetworkKeyMaterial;
use mesh_storage::{IvIndex, NetworkKey};
use mesh_wire::{decode_network_pdu, encode_network_pdu, peek_ivi_nid, NetworkPdu, MAX_SEQ};
use std::collections::HashMap;
use tracing::{debug, info, trace};

use crate::error::MeshError;

/// Derived material for one network key index
#[derive(Debug)]
struct NetKeyState {
    index: u16,
    transmit: NetworkKeyMaterial,
    receive: Vec<NetworkKeyMaterial>,
}

impl NetKeyState {
    fn derive(key: &NetworkKey) -> Self {
        Self {
            index: key.index,
            transmit: NetworkKeyMaterial::derive(key.transmit_key().as_bytes()),
            receive: key
                .receive_keys()
                .into_iter()
                .map(|k| NetworkKeyMaterial::derive(k.as_bytes()))
                .collect(),
        }
    }
}

/// A PDU accepted by [`NetworkLayer::decode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPdu {
    /// Index of the network key that decrypted it
    pub net_key_index: u16,
    /// IV index it was sent with
    pub iv_index: u32,
    /// Clear-text PDU
    pub pdu: NetworkPdu,
}

/// Sequence, IV and key state of the local node
#[derive(Debug)]
pub struct NetworkLayer {
    address: u16,
    sequence: u32,
    iv: IvIndex,
    tx_key_index: u16,
    keys: Vec<NetKeyState>,
    /// Last encoded (IV index, seq) per source
    last_encoded: HashMap<u16, (u32, u32)>,
    /// Last accepted (IV index, seq) per source
    replay: HashMap<u16, (u32, u32)>,
}

impl NetworkLayer {
    /// Create the layer for a node at `address` whose next sequence number is `sequence`
    pub fn new(
        address: u16,
        sequence: u32,
        iv: IvIndex,
        tx_key_index: u16,
        keys: &[NetworkKey],
    ) -> Result<Self, MeshError> {
        if !keys.iter().any(|k| k.index == tx_key_index) {
            return Err(MeshError::KeyMismatch(format!(
                "no network key with index {}",
                tx_key_index
            )));
        }
        Ok(Self {
            address,
            sequence,
            iv,
            tx_key_index,
            keys: keys.iter().map(NetKeyState::derive).collect(),
            last_encoded: HashMap::new(),
            replay: HashMap::new(),
        })
    }

    /// Primary element address of the local node
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Next sequence number to use
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Current IV index state
    pub fn iv_index(&self) -> IvIndex {
        self.iv
    }

    /// Network key used for outbound PDUs
    pub fn tx_key_index(&self) -> u16 {
        self.tx_key_index
    }

    /// Replace the key set, e.g. after a key refresh phase change
    pub fn update_keys(&mut self, keys: &[NetworkKey]) {
        self.keys = keys.iter().map(NetKeyState::derive).collect();
        debug!("Network layer keys updated ({} keys)", self.keys.len());
    }

    /// Adopt a new IV index state. Entering a new transmit index resets the
    /// sequence number.
    pub fn set_iv_index(&mut self, iv: IvIndex) {
        let old_tx = self.iv.transmit_index();
        self.iv = iv;
        if iv.transmit_index() != old_tx {
            info!(
                "Transmit IV index {} -> {}, sequence reset",
                old_tx,
                iv.transmit_index()
            );
            self.sequence = 0;
        }
    }

    /// Take the next sequence number
    pub fn next_sequence(&mut self) -> Result<u32, MeshError> {
        if self.sequence > MAX_SEQ {
            return Err(MeshError::SequenceExhausted(self.address));
        }
        let seq = self.sequence;
        self.sequence += 1;
        Ok(seq)
    }

    /// Encrypt a PDU with the transmit key and IV index.
    ///
    /// (IV index, seq) must be strictly greater than the last value encoded
    /// for the same source.
    pub fn encode(&mut self, pdu: &NetworkPdu) -> Result<Bytes, MeshError> {
        let iv_index = self.iv.transmit_index();
        let current = (iv_index, pdu.seq);
        if let Some(last) = self.last_encoded.get(&pdu.src) {
            if current <= *last {
                return Err(MeshError::Invalid(format!(
                    "sequence {} for {:#06x} not above last encoded {}",
                    pdu.seq, pdu.src, last.1
                )));
            }
        }

        let state = self
            .keys
            .iter()
            .find(|k| k.index == self.tx_key_index)
            .ok_or(MeshError::NotProvisioned)?;
        let raw = encode_network_pdu(&state.transmit, iv_index, pdu)?;

        self.last_encoded.insert(pdu.src, current);
        trace!(
            seq = pdu.seq,
            src = pdu.src,
            dst = pdu.dst,
            "Encoded network PDU"
        );
        Ok(raw)
    }

    /// Decrypt a received PDU. Unknown NIDs, bad MICs and replays give `None`.
    pub fn decode(&mut self, raw: &[u8]) -> Option<ReceivedPdu> {
        let (ivi, nid) = match peek_ivi_nid(raw) {
            Ok(fields) => fields,
            Err(e) => {
                trace!("Dropping network PDU: {}", e);
                return None;
            }
        };
        let iv_index = match self.iv.receive_index(ivi) {
            Some(iv) => iv,
            None => {
                trace!("Dropping network PDU with IVI {} at IV index 0", ivi);
                return None;
            }
        };

        let decoded = self.keys.iter().find_map(|state| {
            state
                .receive
                .iter()
                .filter(|material| material.nid == nid)
                .find_map(|material| decode_network_pdu(material, iv_index, raw).ok())
                .map(|pdu| (state.index, pdu))
        });
        let (net_key_index, pdu) = match decoded {
            Some(found) => found,
            None => {
                trace!(nid, "Dropping network PDU: no key decrypts it");
                return None;
            }
        };

        if pdu.src == self.address {
            trace!("Dropping own network PDU");
            return None;
        }

        let current = (iv_index, pdu.seq);
        if let Some(last) = self.replay.get(&pdu.src) {
            if current <= *last {
                trace!(
                    src = pdu.src,
                    seq = pdu.seq,
                    "Dropping replayed network PDU"
                );
                return None;
            }
        }
        self.replay.insert(pdu.src, current);

        Some(ReceivedPdu {
            net_key_index,
            iv_index,
            pdu,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_storage::MeshKey;

    fn keys() -> Vec<NetworkKey> {
        vec![NetworkKey::new(0, "Primary", MeshKey::new([0x5a; 16]))]
    }

    fn layer(address: u16) -> NetworkLayer {
        NetworkLayer::new(address, 0, IvIndex::default(), 0, &keys()).unwrap()
    }

    fn pdu(layer: &mut NetworkLayer, dst: u16) -> NetworkPdu {
        NetworkPdu {
            ctl: false,
            ttl: 5,
            seq: layer.next_sequence().unwrap(),
            src: layer.address(),
            dst,
            transport_pdu: Bytes::from_static(&[0x00, 1, 2, 3, 4, 5, 6, 7]),
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut sender = layer(0x0001);
        let mut receiver = layer(0x0002);

        let original = pdu(&mut sender, 0x0002);
        let raw = sender.encode(&original).unwrap();
        let received = receiver.decode(&raw).unwrap();

        assert_eq!(received.pdu, original);
        assert_eq!(received.net_key_index, 0);
        assert_eq!(received.iv_index, 0);
    }

    #[test]
    fn test_encoder_rejects_reused_sequence() {
        let mut sender = layer(0x0001);
        let original = pdu(&mut sender, 0x0002);
        sender.encode(&original).unwrap();
        assert!(matches!(
            sender.encode(&original),
            Err(MeshError::Invalid(_))
        ));
    }

    #[test]
    fn test_replay_is_dropped() {
        let mut sender = layer(0x0001);
        let mut receiver = layer(0x0002);

        let first = pdu(&mut sender, 0x0002);
        let raw = sender.encode(&first).unwrap();
        assert!(receiver.decode(&raw).is_some());
        assert!(receiver.decode(&raw).is_none());

        let second = pdu(&mut sender, 0x0002);
        let raw = sender.encode(&second).unwrap();
        assert!(receiver.decode(&raw).is_some());
    }

    #[test]
    fn test_bad_mic_and_unknown_key_are_dropped() {
        let mut sender = layer(0x0001);
        let mut receiver = layer(0x0002);
        let original = pdu(&mut sender, 0x0002);
        let raw = sender.encode(&original).unwrap();

        let mut corrupted = raw.to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;
        assert!(receiver.decode(&corrupted).is_none());

        let other_keys = vec![NetworkKey::new(0, "Other", MeshKey::new([0x11; 16]))];
        let mut stranger = NetworkLayer::new(0x0003, 0, IvIndex::default(), 0, &other_keys).unwrap();
        assert!(stranger.decode(&raw).is_none());
    }

    #[test]
    fn test_sequence_exhaustion() {
        let mut node = NetworkLayer::new(0x0001, MAX_SEQ, IvIndex::default(), 0, &keys()).unwrap();
        assert_eq!(node.next_sequence().unwrap(), MAX_SEQ);
        assert!(matches!(
            node.next_sequence(),
            Err(MeshError::SequenceExhausted(0x0001))
        ));
    }

    #[test]
    fn test_iv_update_transmits_old_index_and_resets_sequence() {
        let mut node = NetworkLayer::new(
            0x0001,
            42,
            IvIndex {
                index: 4,
                update_active: false,
            },
            0,
            &keys(),
        )
        .unwrap();

        // Entering the update keeps transmitting with index 4
        node.set_iv_index(IvIndex {
            index: 5,
            update_active: true,
        });
        assert_eq!(node.iv_index().transmit_index(), 4);
        assert_eq!(node.sequence(), 42);

        node.set_iv_index(IvIndex {
            index: 5,
            update_active: false,
        });
        assert_eq!(node.sequence(), 0);
    }

    #[test]
    fn test_receive_during_iv_update() {
        let mut sender = NetworkLayer::new(
            0x0001,
            0,
            IvIndex {
                index: 7,
                update_active: false,
            },
            0,
            &keys(),
        )
        .unwrap();
        let mut receiver = NetworkLayer::new(
            0x0002,
            0,
            IvIndex {
                index: 8,
                update_active: true,
            },
            0,
            &keys(),
        )
        .unwrap();

        let original = pdu(&mut sender, 0x0002);
        let raw = sender.encode(&original).unwrap();
        let received = receiver.decode(&raw).unwrap();
        assert_eq!(received.iv_index, 7);
    }

    #[test]
    fn test_key_refresh_accepts_old_key() {
        let mut refreshed = keys();
        refreshed[0].begin_key_refresh(MeshKey::new([0x6b; 16])).unwrap();

        let mut old_sender = layer(0x0001);
        let mut receiver =
            NetworkLayer::new(0x0002, 0, IvIndex::default(), 0, &refreshed).unwrap();

        let original = pdu(&mut old_sender, 0x0002);
        let raw = old_sender.encode(&original).unwrap();
        assert!(receiver.decode(&raw).is_some());
    }

    #[test]
    fn test_key_refresh_transmit_key_follows_phase() {
        let mut refreshed = keys();
        refreshed[0].begin_key_refresh(MeshKey::new([0x6b; 16])).unwrap();

        let mut sender =
            NetworkLayer::new(0x0001, 0, IvIndex::default(), 0, &refreshed).unwrap();
        let mut old_only = layer(0x0002);

        // Phase 1 keeps transmitting with the old key
        let original = pdu(&mut sender, 0x0002);
        let raw = sender.encode(&original).unwrap();
        assert!(old_only.decode(&raw).is_some());

        refreshed[0].advance_key_refresh();
        sender.update_keys(&refreshed);
        let mut both =
            NetworkLayer::new(0x0003, 0, IvIndex::default(), 0, &refreshed).unwrap();

        let original = pdu(&mut sender, 0x0002);
        let raw = sender.encode(&original).unwrap();
        assert!(old_only.decode(&raw).is_none());
        assert!(both.decode(&raw).is_some());
    }
}
