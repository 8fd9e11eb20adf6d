//! Provisioner side of the provisioning protocol.
//!
//! The session is a pure state machine: it consumes raw provisioning PDUs and
//! returns the PDUs to send next. Timers, address reservation and bearer I/O
//! live in the manager.

use mesh_crypto::{
    confirmation_key, confirmation_salt, confirmation_value, provisioning_salt, CryptoError,
    EcdhKeyPair, SessionKeys,
};
use mesh_wire::provisioning::StaticOobTypes;
use mesh_wire::{
    AuthMethod, Capabilities, FailureCode, ProvisioningData, ProvisioningPdu, ProvisioningPduType,
    PublicKeyTypes, Start, WireError,
};
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Why a provisioning session failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    /// PDU type not allowed in the current state
    #[error("unexpected {got:?} PDU in state {state}")]
    UnexpectedPdu {
        /// State name
        state: &'static str,
        /// Received type
        got: ProvisioningPduType,
    },

    /// PDU failed type or length validation
    #[error("malformed PDU: {0}")]
    Malformed(WireError),

    /// Device sent Provisioning Failed
    #[error("device reported {0:?}")]
    Remote(FailureCode),

    /// Device confirmation does not match its random
    #[error("confirmation failed")]
    ConfirmationFailed,

    /// Peer echoed one of our own values
    #[error("reflected {0}")]
    Reflected(&'static str),

    /// Key agreement or sealing failed
    #[error("crypto: {0}")]
    Crypto(CryptoError),

    /// Device lacks a capability the parameters require
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Operation called in the wrong state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl From<CryptoError> for ProvisioningError {
    fn from(err: CryptoError) -> Self {
        ProvisioningError::Crypto(err)
    }
}

/// Provisioner role states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningState {
    /// Nothing sent yet
    Idle,
    /// Invite sent, waiting for Capabilities
    Invite,
    /// Capabilities received, waiting for the caller to start the exchange
    Capabilities,
    /// Start and our public key sent, waiting for the device key
    PublicKeyExchange,
    /// Device key taken from out-of-band data
    OobPublicKeyExchange,
    /// Confirmation sent, waiting for the device confirmation
    Confirmation,
    /// Random sent, waiting for the device random
    Random,
    /// Data sent, waiting for Complete
    DataDistribution,
    /// Device acknowledged the data
    Complete,
    /// Terminal failure
    Failed(ProvisioningError),
}

impl ProvisioningState {
    fn name(&self) -> &'static str {
        match self {
            ProvisioningState::Idle => "idle",
            ProvisioningState::Invite => "invite",
            ProvisioningState::Capabilities => "capabilities",
            ProvisioningState::PublicKeyExchange => "public_key_exchange",
            ProvisioningState::OobPublicKeyExchange => "oob_public_key_exchange",
            ProvisioningState::Confirmation => "confirmation",
            ProvisioningState::Random => "random",
            ProvisioningState::DataDistribution => "data_distribution",
            ProvisioningState::Complete => "complete",
            ProvisioningState::Failed(_) => "failed",
        }
    }
}

/// Authentication value agreed out of band
#[derive(Clone, PartialEq, Eq)]
pub enum AuthValue {
    /// No OOB authentication, sixteen zero octets
    NoOob,
    /// Static OOB value
    Static([u8; 16]),
}

impl AuthValue {
    fn bytes(&self) -> Zeroizing<[u8; 16]> {
        match self {
            AuthValue::NoOob => Zeroizing::new([0u8; 16]),
            AuthValue::Static(value) => Zeroizing::new(*value),
        }
    }
}

impl fmt::Debug for AuthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthValue::NoOob => f.write_str("NoOob"),
            AuthValue::Static(_) => f.write_str("Static(<redacted>)"),
        }
    }
}

/// Caller choices for one provisioning run
#[derive(Debug, Clone)]
pub struct ProvisioningParams {
    /// Authentication method and value
    pub auth: AuthValue,
    /// Device public key obtained out of band
    pub oob_public_key: Option<[u8; 64]>,
    /// Attention timer in seconds
    pub attention_duration: u8,
}

impl Default for ProvisioningParams {
    fn default() -> Self {
        Self {
            auth: AuthValue::NoOob,
            oob_public_key: None,
            attention_duration: 5,
        }
    }
}

/// What the caller must do after [`ProvisioningSession::handle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send these PDUs in order
    Send(Vec<ProvisioningPdu>),
    /// Reserve addresses, then call [`ProvisioningSession::start_exchange`]
    CapabilitiesReceived(Capabilities),
    /// Provisioning finished
    Complete,
}

/// One provisioning run against one device
pub struct ProvisioningSession {
    uuid: Uuid,
    params: ProvisioningParams,
    state: ProvisioningState,
    key_pair: EcdhKeyPair,
    confirmation_inputs: Vec<u8>,
    capabilities: Option<Capabilities>,
    data: Option<ProvisioningData>,
    ecdh_secret: Option<Zeroizing<[u8; 32]>>,
    confirmation_salt: [u8; 16],
    confirmation_key: Zeroizing<[u8; 16]>,
    random: [u8; 16],
    own_confirmation: [u8; 16],
    device_confirmation: Option<[u8; 16]>,
    device_key: Option<Zeroizing<[u8; 16]>>,
}

impl fmt::Debug for ProvisioningSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningSession")
            .field("uuid", &self.uuid)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ProvisioningSession {
    /// New session with a fresh ephemeral key pair
    pub fn new(uuid: Uuid, params: ProvisioningParams) -> Self {
        Self::with_key_pair(uuid, params, EcdhKeyPair::generate())
    }

    /// New session with a caller-supplied key pair
    pub fn with_key_pair(uuid: Uuid, params: ProvisioningParams, key_pair: EcdhKeyPair) -> Self {
        let mut random = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut random);
        Self {
            uuid,
            params,
            state: ProvisioningState::Idle,
            key_pair,
            confirmation_inputs: Vec::with_capacity(145),
            capabilities: None,
            data: None,
            ecdh_secret: None,
            confirmation_salt: [0u8; 16],
            confirmation_key: Zeroizing::new([0u8; 16]),
            random,
            own_confirmation: [0u8; 16],
            device_confirmation: None,
            device_key: None,
        }
    }

    /// Device UUID
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Current state
    pub fn state(&self) -> &ProvisioningState {
        &self.state
    }

    /// Capabilities reported by the device
    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }

    /// Provisioning Data sent to the device
    pub fn provisioning_data(&self) -> Option<&ProvisioningData> {
        self.data.as_ref()
    }

    /// Device key, known once the data was sealed
    pub fn device_key(&self) -> Option<[u8; 16]> {
        self.device_key.as_deref().copied()
    }

    /// Build the Invite and enter `Invite`
    pub fn invite(&mut self) -> Result<ProvisioningPdu, ProvisioningError> {
        if self.state != ProvisioningState::Idle {
            return Err(ProvisioningError::InvalidState("invite already sent"));
        }
        let attention_duration = self.params.attention_duration;
        self.confirmation_inputs.push(attention_duration);
        self.state = ProvisioningState::Invite;
        debug!("Inviting device {}", self.uuid);
        Ok(ProvisioningPdu::Invite { attention_duration })
    }

    /// Send Start and our public key. `data` carries the address reserved
    /// for the device.
    pub fn start_exchange(
        &mut self,
        data: ProvisioningData,
    ) -> Result<Vec<ProvisioningPdu>, ProvisioningError> {
        if self.state != ProvisioningState::Capabilities {
            return Err(ProvisioningError::InvalidState(
                "exchange starts after capabilities",
            ));
        }
        let caps = self
            .capabilities
            .ok_or(ProvisioningError::InvalidState("no capabilities"))?;

        let auth_method = match self.params.auth {
            AuthValue::NoOob => AuthMethod::NoOob,
            AuthValue::Static(_) => {
                if !caps.static_oob_type.contains(StaticOobTypes::AVAILABLE) {
                    return self.fail(ProvisioningError::Unsupported("static OOB"));
                }
                AuthMethod::StaticOob
            }
        };
        let oob_key = match self.params.oob_public_key {
            Some(key) if caps.public_key_type.contains(PublicKeyTypes::OOB) => Some(key),
            _ => None,
        };

        let start = Start::new(oob_key.is_some(), auth_method);
        let start_pdu = ProvisioningPdu::Start(start);
        self.confirmation_inputs
            .extend_from_slice(&start_pdu.encode()[1..]);
        let own_key = *self.key_pair.public_key();
        self.confirmation_inputs.extend_from_slice(&own_key);
        self.data = Some(data);

        let mut pdus = vec![start_pdu, ProvisioningPdu::PublicKey(own_key)];
        match oob_key {
            Some(device_key) => {
                self.state = ProvisioningState::OobPublicKeyExchange;
                debug!("Using out-of-band public key of {}", self.uuid);
                let confirmation = self.agree(&device_key)?;
                pdus.push(ProvisioningPdu::Confirmation(confirmation));
            }
            None => self.state = ProvisioningState::PublicKeyExchange,
        }
        Ok(pdus)
    }

    /// Process one raw PDU from the device
    pub fn handle(&mut self, raw: &[u8]) -> Result<Step, ProvisioningError> {
        if matches!(
            self.state,
            ProvisioningState::Complete | ProvisioningState::Failed(_)
        ) {
            return Err(ProvisioningError::InvalidState("session finished"));
        }

        let pdu = match ProvisioningPdu::decode(raw) {
            Ok(pdu) => pdu,
            Err(e) => return self.fail(ProvisioningError::Malformed(e)),
        };
        if let ProvisioningPdu::Failed(code) = pdu {
            return self.fail(ProvisioningError::Remote(code));
        }

        let current = self.state.clone();
        match (&current, pdu) {
            (ProvisioningState::Invite, ProvisioningPdu::Capabilities(caps)) => {
                self.confirmation_inputs
                    .extend_from_slice(&ProvisioningPdu::Capabilities(caps).encode()[1..]);
                self.capabilities = Some(caps);
                self.state = ProvisioningState::Capabilities;
                debug!(
                    "Device {} has {} element(s)",
                    self.uuid, caps.element_count
                );
                Ok(Step::CapabilitiesReceived(caps))
            }
            (ProvisioningState::PublicKeyExchange, ProvisioningPdu::PublicKey(device_key)) => {
                let confirmation = self.agree(&device_key)?;
                Ok(Step::Send(vec![ProvisioningPdu::Confirmation(confirmation)]))
            }
            (ProvisioningState::Confirmation, ProvisioningPdu::Confirmation(value)) => {
                if value == self.own_confirmation {
                    return self.fail(ProvisioningError::Reflected("confirmation"));
                }
                self.device_confirmation = Some(value);
                self.state = ProvisioningState::Random;
                Ok(Step::Send(vec![ProvisioningPdu::Random(self.random)]))
            }
            (ProvisioningState::Random, ProvisioningPdu::Random(device_random)) => {
                let sealed = self.check_and_seal(&device_random)?;
                self.state = ProvisioningState::DataDistribution;
                Ok(Step::Send(vec![ProvisioningPdu::Data(sealed)]))
            }
            (ProvisioningState::DataDistribution, ProvisioningPdu::Complete) => {
                self.state = ProvisioningState::Complete;
                info!("Device {} accepted provisioning data", self.uuid);
                Ok(Step::Complete)
            }
            (state, pdu) => {
                let err = ProvisioningError::UnexpectedPdu {
                    state: state.name(),
                    got: pdu.pdu_type(),
                };
                self.fail(err)
            }
        }
    }

    /// Abort the session locally
    pub fn abort(&mut self, err: ProvisioningError) {
        if !matches!(self.state, ProvisioningState::Failed(_)) {
            self.state = ProvisioningState::Failed(err);
        }
    }

    fn fail<T>(&mut self, err: ProvisioningError) -> Result<T, ProvisioningError> {
        warn!(
            "Provisioning of {} failed in state {}: {}",
            self.uuid,
            self.state.name(),
            err
        );
        self.state = ProvisioningState::Failed(err.clone());
        Err(err)
    }

    /// ECDH with the device key and our confirmation value
    fn agree(&mut self, device_key: &[u8; 64]) -> Result<[u8; 16], ProvisioningError> {
        if device_key == self.key_pair.public_key() {
            return self.fail(ProvisioningError::Reflected("public key"));
        }
        let secret = match self.key_pair.shared_secret(device_key) {
            Ok(secret) => Zeroizing::new(secret),
            Err(e) => return self.fail(e.into()),
        };

        self.confirmation_inputs.extend_from_slice(device_key);
        self.confirmation_salt = confirmation_salt(&self.confirmation_inputs);
        self.confirmation_key =
            Zeroizing::new(confirmation_key(&secret[..], &self.confirmation_salt));
        let auth = self.params.auth.bytes();
        self.own_confirmation = confirmation_value(&self.confirmation_key, &self.random, &auth);
        self.ecdh_secret = Some(secret);
        self.state = ProvisioningState::Confirmation;
        Ok(self.own_confirmation)
    }

    fn check_and_seal(&mut self, device_random: &[u8; 16]) -> Result<[u8; 33], ProvisioningError> {
        let auth = self.params.auth.bytes();
        let expected = confirmation_value(&self.confirmation_key, device_random, &auth);
        if self.device_confirmation != Some(expected) {
            return self.fail(ProvisioningError::ConfirmationFailed);
        }

        let secret = match &self.ecdh_secret {
            Some(secret) => secret.clone(),
            None => return self.fail(ProvisioningError::InvalidState("no shared secret")),
        };
        let salt = provisioning_salt(&self.confirmation_salt, &self.random, device_random);
        let keys = SessionKeys::derive(&secret[..], &salt);

        let data = match &self.data {
            Some(data) => data.to_bytes(),
            None => return self.fail(ProvisioningError::InvalidState("no provisioning data")),
        };
        let clear = Zeroizing::new(data);
        let sealed = match keys.seal_data(&clear) {
            Ok(sealed) => sealed,
            Err(e) => return self.fail(e.into()),
        };
        let mut out = [0u8; 33];
        if sealed.len() != out.len() {
            return self.fail(CryptoError::InvalidLength(sealed.len()).into());
        }
        out.copy_from_slice(&sealed);
        self.device_key = Some(Zeroizing::new(keys.device_key));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisionee::{Provisionee, ProvisioneeState};

    fn data(address: u16) -> ProvisioningData {
        ProvisioningData {
            net_key: [0x7d; 16],
            key_index: 0,
            flags: 0,
            iv_index: 0x11,
            unicast_address: address,
        }
    }

    /// Drive both ends until one stops answering
    fn run(
        session: &mut ProvisioningSession,
        device: &mut Provisionee,
    ) -> Result<(), ProvisioningError> {
        let mut outbound = vec![session.invite()?];
        while !outbound.is_empty() {
            let mut replies = Vec::new();
            for pdu in outbound.drain(..) {
                replies.extend(device.handle(&pdu.encode()));
            }
            for reply in replies {
                match session.handle(&reply.encode())? {
                    Step::Send(pdus) => outbound.extend(pdus),
                    Step::CapabilitiesReceived(caps) => {
                        assert_eq!(caps.element_count, 2);
                        outbound.extend(session.start_exchange(data(0x0100))?);
                    }
                    Step::Complete => return Ok(()),
                }
            }
        }
        Err(ProvisioningError::InvalidState("exchange stalled"))
    }

    #[test]
    fn test_no_oob_handshake() {
        let uuid = Uuid::new_v4();
        let mut session = ProvisioningSession::new(uuid, ProvisioningParams::default());
        let mut device = Provisionee::new(uuid, Capabilities::no_oob(2), None);

        run(&mut session, &mut device).unwrap();

        assert_eq!(session.state(), &ProvisioningState::Complete);
        assert_eq!(device.state(), &ProvisioneeState::Complete);
        let result = device.result().unwrap();
        assert_eq!(result.data, data(0x0100));
        assert_eq!(result.device_key(), session.device_key().unwrap());
    }

    #[test]
    fn test_static_oob_handshake() {
        let uuid = Uuid::new_v4();
        let mut caps = Capabilities::no_oob(2);
        caps.static_oob_type = StaticOobTypes::AVAILABLE;
        let params = ProvisioningParams {
            auth: AuthValue::Static([0x42; 16]),
            ..Default::default()
        };
        let mut session = ProvisioningSession::new(uuid, params);
        let mut device = Provisionee::new(uuid, caps, Some([0x42; 16]));

        run(&mut session, &mut device).unwrap();
        assert!(device.result().is_some());
    }

    #[test]
    fn test_wrong_static_oob_fails_confirmation() {
        let uuid = Uuid::new_v4();
        let mut caps = Capabilities::no_oob(2);
        caps.static_oob_type = StaticOobTypes::AVAILABLE;
        let params = ProvisioningParams {
            auth: AuthValue::Static([0x42; 16]),
            ..Default::default()
        };
        let mut session = ProvisioningSession::new(uuid, params);
        let mut device = Provisionee::new(uuid, caps, Some([0x43; 16]));

        let err = run(&mut session, &mut device).unwrap_err();
        assert_eq!(err, ProvisioningError::Remote(FailureCode::ConfirmationFailed));
        assert!(matches!(session.state(), ProvisioningState::Failed(_)));
        assert_eq!(
            device.state(),
            &ProvisioneeState::Failed(FailureCode::ConfirmationFailed)
        );
    }

    #[test]
    fn test_oob_public_key_skips_device_key() {
        let uuid = Uuid::new_v4();
        let mut caps = Capabilities::no_oob(2);
        caps.public_key_type = PublicKeyTypes::OOB;
        let device_keys = EcdhKeyPair::generate();
        let params = ProvisioningParams {
            oob_public_key: Some(*device_keys.public_key()),
            ..Default::default()
        };
        let mut session = ProvisioningSession::new(uuid, params);
        let mut device = Provisionee::with_key_pair(uuid, caps, None, device_keys);

        run(&mut session, &mut device).unwrap();
        assert_eq!(
            device.result().unwrap().device_key(),
            session.device_key().unwrap()
        );
    }

    #[test]
    fn test_unexpected_pdu_fails() {
        let mut session = ProvisioningSession::new(Uuid::new_v4(), ProvisioningParams::default());
        session.invite().unwrap();

        let err = session
            .handle(&ProvisioningPdu::Random([0u8; 16]).encode())
            .unwrap_err();
        assert_eq!(
            err,
            ProvisioningError::UnexpectedPdu {
                state: "invite",
                got: ProvisioningPduType::Random
            }
        );
        assert!(session.handle(&[0x01]).is_err());
    }

    #[test]
    fn test_malformed_and_remote_failures() {
        let mut session = ProvisioningSession::new(Uuid::new_v4(), ProvisioningParams::default());
        session.invite().unwrap();
        assert!(matches!(
            session.handle(&[0x01, 0x02]),
            Err(ProvisioningError::Malformed(_))
        ));

        let mut session = ProvisioningSession::new(Uuid::new_v4(), ProvisioningParams::default());
        session.invite().unwrap();
        assert_eq!(
            session
                .handle(&ProvisioningPdu::Failed(FailureCode::OutOfResources).encode())
                .unwrap_err(),
            ProvisioningError::Remote(FailureCode::OutOfResources)
        );
    }

    #[test]
    fn test_static_oob_requires_device_support() {
        let uuid = Uuid::new_v4();
        let params = ProvisioningParams {
            auth: AuthValue::Static([1; 16]),
            ..Default::default()
        };
        let mut session = ProvisioningSession::new(uuid, params);
        session.invite().unwrap();
        session
            .handle(&ProvisioningPdu::Capabilities(Capabilities::no_oob(1)).encode())
            .unwrap();
        assert_eq!(
            session.start_exchange(data(0x0002)).unwrap_err(),
            ProvisioningError::Unsupported("static OOB")
        );
    }

    #[test]
    fn test_reflected_public_key_rejected() {
        let uuid = Uuid::new_v4();
        let mut session = ProvisioningSession::new(uuid, ProvisioningParams::default());
        session.invite().unwrap();
        session
            .handle(&ProvisioningPdu::Capabilities(Capabilities::no_oob(1)).encode())
            .unwrap();
        let pdus = session.start_exchange(data(0x0002)).unwrap();
        let own_key = pdus[1].clone();
        assert_eq!(
            session.handle(&own_key.encode()).unwrap_err(),
            ProvisioningError::Reflected("public key")
        );
    }
}
