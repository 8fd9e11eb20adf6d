//! Device side of the provisioning protocol.

use mesh_crypto::{
    confirmation_key, confirmation_salt, confirmation_value, provisioning_salt, EcdhKeyPair,
    SessionKeys,
};
use mesh_wire::address::UNICAST_MAX;
use mesh_wire::provisioning::StaticOobTypes;
use mesh_wire::{
    AuthMethod, Capabilities, FailureCode, ProvisioningData, ProvisioningPdu, PublicKeyTypes,
    Start,
};
use rand::RngCore;
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Device role states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioneeState {
    /// Unprovisioned, waiting for an Invite
    Beaconing,
    /// Capabilities sent
    AwaitingStart,
    /// Start accepted
    AwaitingPublicKey,
    /// Keys exchanged
    AwaitingConfirmation,
    /// Confirmation sent
    AwaitingRandom,
    /// Random sent
    AwaitingData,
    /// Provisioning Data accepted
    Complete,
    /// Failed PDU sent
    Failed(FailureCode),
}

/// Outcome of a successful provisioning on the device
#[derive(Clone)]
pub struct ProvisionedDevice {
    /// Network key, IV index and address received
    pub data: ProvisioningData,
    device_key: Zeroizing<[u8; 16]>,
}

impl ProvisionedDevice {
    /// Device key shared with the provisioner
    pub fn device_key(&self) -> [u8; 16] {
        *self.device_key
    }
}

impl fmt::Debug for ProvisionedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionedDevice")
            .field("unicast_address", &self.data.unicast_address)
            .field("key_index", &self.data.key_index)
            .field("iv_index", &self.data.iv_index)
            .finish_non_exhaustive()
    }
}

/// An unprovisioned device answering a provisioner
pub struct Provisionee {
    uuid: Uuid,
    capabilities: Capabilities,
    static_oob: Option<Zeroizing<[u8; 16]>>,
    key_pair: EcdhKeyPair,
    state: ProvisioneeState,
    start: Option<Start>,
    confirmation_inputs: Vec<u8>,
    auth: Zeroizing<[u8; 16]>,
    ecdh_secret: Option<Zeroizing<[u8; 32]>>,
    confirmation_salt: [u8; 16],
    confirmation_key: Zeroizing<[u8; 16]>,
    random: [u8; 16],
    provisioner_confirmation: [u8; 16],
    session: Option<SessionKeys>,
    result: Option<ProvisionedDevice>,
}

impl fmt::Debug for Provisionee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provisionee")
            .field("uuid", &self.uuid)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Provisionee {
    /// Device with a fresh key pair. `static_oob` is the value printed on
    /// the device, if any.
    pub fn new(uuid: Uuid, capabilities: Capabilities, static_oob: Option<[u8; 16]>) -> Self {
        Self::with_key_pair(uuid, capabilities, static_oob, EcdhKeyPair::generate())
    }

    /// Device with a fixed key pair, as when the public key is published out of band
    pub fn with_key_pair(
        uuid: Uuid,
        mut capabilities: Capabilities,
        static_oob: Option<[u8; 16]>,
        key_pair: EcdhKeyPair,
    ) -> Self {
        if static_oob.is_some() {
            capabilities.static_oob_type |= StaticOobTypes::AVAILABLE;
        }
        let mut random = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut random);
        Self {
            uuid,
            capabilities,
            static_oob: static_oob.map(Zeroizing::new),
            key_pair,
            state: ProvisioneeState::Beaconing,
            start: None,
            confirmation_inputs: Vec::with_capacity(145),
            auth: Zeroizing::new([0u8; 16]),
            ecdh_secret: None,
            confirmation_salt: [0u8; 16],
            confirmation_key: Zeroizing::new([0u8; 16]),
            random,
            provisioner_confirmation: [0u8; 16],
            session: None,
            result: None,
        }
    }

    /// Device UUID
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Advertised capabilities
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Raw public key, for out-of-band publication
    pub fn public_key(&self) -> &[u8; 64] {
        self.key_pair.public_key()
    }

    /// Current state
    pub fn state(&self) -> &ProvisioneeState {
        &self.state
    }

    /// Received data and device key, once complete
    pub fn result(&self) -> Option<&ProvisionedDevice> {
        self.result.as_ref()
    }

    /// Process one raw PDU and return the replies
    pub fn handle(&mut self, raw: &[u8]) -> Vec<ProvisioningPdu> {
        if matches!(
            self.state,
            ProvisioneeState::Complete | ProvisioneeState::Failed(_)
        ) {
            debug!("Ignoring provisioning PDU after session end");
            return Vec::new();
        }

        let pdu = match ProvisioningPdu::decode(raw) {
            Ok(pdu) => pdu,
            Err(e) => return self.fail(FailureCode::for_decode_error(&e)),
        };

        match (self.state.clone(), pdu) {
            (ProvisioneeState::Beaconing, ProvisioningPdu::Invite { attention_duration }) => {
                debug!("Invited, attention for {}s", attention_duration);
                self.confirmation_inputs.push(attention_duration);
                let reply = ProvisioningPdu::Capabilities(self.capabilities);
                self.confirmation_inputs.extend_from_slice(&reply.encode()[1..]);
                self.state = ProvisioneeState::AwaitingStart;
                vec![reply]
            }
            (ProvisioneeState::AwaitingStart, ProvisioningPdu::Start(start)) => {
                match self.accept_start(&start) {
                    Ok(()) => {
                        self.confirmation_inputs
                            .extend_from_slice(&ProvisioningPdu::Start(start).encode()[1..]);
                        self.start = Some(start);
                        self.state = ProvisioneeState::AwaitingPublicKey;
                        Vec::new()
                    }
                    Err(code) => self.fail(code),
                }
            }
            (ProvisioneeState::AwaitingPublicKey, ProvisioningPdu::PublicKey(peer)) => {
                self.on_public_key(&peer)
            }
            (ProvisioneeState::AwaitingConfirmation, ProvisioningPdu::Confirmation(value)) => {
                self.provisioner_confirmation = value;
                let own = confirmation_value(&self.confirmation_key, &self.random, &self.auth);
                if own == value {
                    return self.fail(FailureCode::ConfirmationFailed);
                }
                self.state = ProvisioneeState::AwaitingRandom;
                vec![ProvisioningPdu::Confirmation(own)]
            }
            (ProvisioneeState::AwaitingRandom, ProvisioningPdu::Random(peer_random)) => {
                self.on_random(&peer_random)
            }
            (ProvisioneeState::AwaitingData, ProvisioningPdu::Data(sealed)) => {
                self.on_data(&sealed)
            }
            (state, pdu) => {
                warn!("Unexpected {:?} PDU in state {:?}", pdu.pdu_type(), state);
                self.fail(FailureCode::UnexpectedPdu)
            }
        }
    }

    fn accept_start(&mut self, start: &Start) -> Result<(), FailureCode> {
        if start.oob_public_key
            && !self
                .capabilities
                .public_key_type
                .contains(PublicKeyTypes::OOB)
        {
            return Err(FailureCode::InvalidFormat);
        }
        match start.auth_method {
            AuthMethod::NoOob => {
                self.auth = Zeroizing::new([0u8; 16]);
            }
            AuthMethod::StaticOob => match &self.static_oob {
                Some(value) => self.auth = value.clone(),
                None => return Err(FailureCode::InvalidFormat),
            },
            AuthMethod::OutputOob | AuthMethod::InputOob => return Err(FailureCode::InvalidFormat),
        }
        Ok(())
    }

    fn on_public_key(&mut self, peer: &[u8; 64]) -> Vec<ProvisioningPdu> {
        let own = *self.key_pair.public_key();
        if *peer == own {
            return self.fail(FailureCode::UnexpectedError);
        }
        let secret = match self.key_pair.shared_secret(peer) {
            Ok(secret) => Zeroizing::new(secret),
            Err(e) => {
                warn!("Rejecting provisioner public key: {}", e);
                return self.fail(FailureCode::UnexpectedError);
            }
        };

        self.confirmation_inputs.extend_from_slice(peer);
        self.confirmation_inputs.extend_from_slice(&own);
        self.confirmation_salt = confirmation_salt(&self.confirmation_inputs);
        self.confirmation_key =
            Zeroizing::new(confirmation_key(&secret[..], &self.confirmation_salt));
        self.ecdh_secret = Some(secret);
        self.state = ProvisioneeState::AwaitingConfirmation;

        let oob_key = self.start.map(|s| s.oob_public_key).unwrap_or(false);
        if oob_key {
            Vec::new()
        } else {
            vec![ProvisioningPdu::PublicKey(own)]
        }
    }

    fn on_random(&mut self, peer_random: &[u8; 16]) -> Vec<ProvisioningPdu> {
        let expected = confirmation_value(&self.confirmation_key, peer_random, &self.auth);
        if expected != self.provisioner_confirmation {
            return self.fail(FailureCode::ConfirmationFailed);
        }
        let secret = match &self.ecdh_secret {
            Some(secret) => secret.clone(),
            None => return self.fail(FailureCode::UnexpectedError),
        };
        let salt = provisioning_salt(&self.confirmation_salt, peer_random, &self.random);
        self.session = Some(SessionKeys::derive(&secret[..], &salt));
        self.state = ProvisioneeState::AwaitingData;
        vec![ProvisioningPdu::Random(self.random)]
    }

    fn on_data(&mut self, sealed: &[u8; 33]) -> Vec<ProvisioningPdu> {
        let keys = match self.session.take() {
            Some(keys) => keys,
            None => return self.fail(FailureCode::UnexpectedError),
        };
        let clear = match keys.open_data(sealed) {
            Ok(clear) => Zeroizing::new(clear),
            Err(_) => return self.fail(FailureCode::DecryptionFailed),
        };
        let data = match ProvisioningData::from_bytes(&clear) {
            Ok(data) => data,
            Err(_) => return self.fail(FailureCode::InvalidFormat),
        };
        let last = data.unicast_address as u32 + self.capabilities.element_count as u32 - 1;
        if last > UNICAST_MAX as u32 {
            return self.fail(FailureCode::CannotAssignAddresses);
        }

        info!(
            "Device {} provisioned at {:#06x}",
            self.uuid, data.unicast_address
        );
        self.result = Some(ProvisionedDevice {
            data,
            device_key: Zeroizing::new(keys.device_key),
        });
        self.state = ProvisioneeState::Complete;
        vec![ProvisioningPdu::Complete]
    }

    fn fail(&mut self, code: FailureCode) -> Vec<ProvisioningPdu> {
        warn!("Device {} aborting provisioning: {:?}", self.uuid, code);
        self.state = ProvisioneeState::Failed(code);
        self.session = None;
        self.ecdh_secret = None;
        vec![ProvisioningPdu::Failed(code)]
    }
}
