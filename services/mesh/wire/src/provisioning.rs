//! Provisioning protocol PDUs.
//!
//! Every PDU is a one-octet type followed by fixed-length parameters. Decoding
//! checks the type first and then the exact parameter length, so callers can
//! map failures onto the protocol's `Invalid PDU` / `Invalid Format` codes.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Size of a raw P-256 public key
pub const PUBLIC_KEY_SIZE: usize = 64;

/// Size of the encrypted Provisioning Data (25 octets plus 64-bit MIC)
pub const ENCRYPTED_DATA_SIZE: usize = 33;

/// Size of the Capabilities parameters
pub const CAPABILITIES_SIZE: usize = 11;

/// Size of the Start parameters
pub const START_SIZE: usize = 5;

/// Provisioning PDU types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningPduType {
    /// Invite
    Invite = 0x00,
    /// Capabilities
    Capabilities = 0x01,
    /// Start
    Start = 0x02,
    /// Public Key
    PublicKey = 0x03,
    /// Input Complete
    InputComplete = 0x04,
    /// Confirmation
    Confirmation = 0x05,
    /// Random
    Random = 0x06,
    /// Data
    Data = 0x07,
    /// Complete
    Complete = 0x08,
    /// Failed
    Failed = 0x09,
}

impl TryFrom<u8> for ProvisioningPduType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ProvisioningPduType::Invite),
            0x01 => Ok(ProvisioningPduType::Capabilities),
            0x02 => Ok(ProvisioningPduType::Start),
            0x03 => Ok(ProvisioningPduType::PublicKey),
            0x04 => Ok(ProvisioningPduType::InputComplete),
            0x05 => Ok(ProvisioningPduType::Confirmation),
            0x06 => Ok(ProvisioningPduType::Random),
            0x07 => Ok(ProvisioningPduType::Data),
            0x08 => Ok(ProvisioningPduType::Complete),
            0x09 => Ok(ProvisioningPduType::Failed),
            _ => Err(WireError::Type(value)),
        }
    }
}

impl ProvisioningPduType {
    /// Exact parameter length for this type
    pub fn param_len(self) -> usize {
        match self {
            ProvisioningPduType::Invite => 1,
            ProvisioningPduType::Capabilities => CAPABILITIES_SIZE,
            ProvisioningPduType::Start => START_SIZE,
            ProvisioningPduType::PublicKey => PUBLIC_KEY_SIZE,
            ProvisioningPduType::InputComplete => 0,
            ProvisioningPduType::Confirmation => 16,
            ProvisioningPduType::Random => 16,
            ProvisioningPduType::Data => ENCRYPTED_DATA_SIZE,
            ProvisioningPduType::Complete => 0,
            ProvisioningPduType::Failed => 1,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ProvisioningPduType::Invite => "invite",
            ProvisioningPduType::Capabilities => "capabilities",
            ProvisioningPduType::Start => "start",
            ProvisioningPduType::PublicKey => "public key",
            ProvisioningPduType::InputComplete => "input complete",
            ProvisioningPduType::Confirmation => "confirmation",
            ProvisioningPduType::Random => "random",
            ProvisioningPduType::Data => "data",
            ProvisioningPduType::Complete => "complete",
            ProvisioningPduType::Failed => "failed",
        }
    }
}

/// Error codes carried by a Provisioning Failed PDU
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCode {
    /// Prohibited
    Prohibited = 0x00,
    /// PDU type not recognized
    InvalidPdu = 0x01,
    /// Parameters outside the expected range or wrong length
    InvalidFormat = 0x02,
    /// PDU not expected at this point
    UnexpectedPdu = 0x03,
    /// Confirmation value does not match
    ConfirmationFailed = 0x04,
    /// Device is out of resources
    OutOfResources = 0x05,
    /// Provisioning Data could not be decrypted
    DecryptionFailed = 0x06,
    /// Unexpected error
    UnexpectedError = 0x07,
    /// Device cannot assign consecutive unicast addresses
    CannotAssignAddresses = 0x08,
}

impl TryFrom<u8> for FailureCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FailureCode::Prohibited),
            0x01 => Ok(FailureCode::InvalidPdu),
            0x02 => Ok(FailureCode::InvalidFormat),
            0x03 => Ok(FailureCode::UnexpectedPdu),
            0x04 => Ok(FailureCode::ConfirmationFailed),
            0x05 => Ok(FailureCode::OutOfResources),
            0x06 => Ok(FailureCode::DecryptionFailed),
            0x07 => Ok(FailureCode::UnexpectedError),
            0x08 => Ok(FailureCode::CannotAssignAddresses),
            _ => Err(WireError::Code(value)),
        }
    }
}

impl FailureCode {
    /// Map a decode error onto the failure code a device reports
    pub fn for_decode_error(err: &WireError) -> Self {
        match err {
            WireError::Type(_) => FailureCode::InvalidPdu,
            _ => FailureCode::InvalidFormat,
        }
    }
}

bitflags! {
    /// Supported provisioning algorithms
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Algorithms: u16 {
        /// FIPS P-256 elliptic curve
        const FIPS_P256 = 1 << 0;
    }
}

bitflags! {
    /// Supported public key types
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PublicKeyTypes: u8 {
        /// Public key available out of band
        const OOB = 1 << 0;
    }
}

bitflags! {
    /// Supported static OOB types
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StaticOobTypes: u8 {
        /// Static OOB information available
        const AVAILABLE = 1 << 0;
    }
}

bitflags! {
    /// Output OOB actions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OutputOobActions: u16 {
        /// Blink
        const BLINK = 1 << 0;
        /// Beep
        const BEEP = 1 << 1;
        /// Vibrate
        const VIBRATE = 1 << 2;
        /// Output numeric
        const NUMERIC = 1 << 3;
        /// Output alphanumeric
        const ALPHANUMERIC = 1 << 4;
    }
}

bitflags! {
    /// Input OOB actions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct InputOobActions: u16 {
        /// Push
        const PUSH = 1 << 0;
        /// Twist
        const TWIST = 1 << 1;
        /// Input numeric
        const NUMERIC = 1 << 2;
        /// Input alphanumeric
        const ALPHANUMERIC = 1 << 3;
    }
}

/// Device capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Number of elements (1..=255)
    pub element_count: u8,
    /// Supported algorithms
    pub algorithms: Algorithms,
    /// Supported public key types
    pub public_key_type: PublicKeyTypes,
    /// Supported static OOB types
    pub static_oob_type: StaticOobTypes,
    /// Maximum output OOB size
    pub output_oob_size: u8,
    /// Supported output OOB actions
    pub output_oob_action: OutputOobActions,
    /// Maximum input OOB size
    pub input_oob_size: u8,
    /// Supported input OOB actions
    pub input_oob_action: InputOobActions,
}

impl Capabilities {
    /// Minimal capabilities: P-256, no OOB of any kind
    pub fn no_oob(element_count: u8) -> Self {
        Self {
            element_count,
            algorithms: Algorithms::FIPS_P256,
            public_key_type: PublicKeyTypes::empty(),
            static_oob_type: StaticOobTypes::empty(),
            output_oob_size: 0,
            output_oob_action: OutputOobActions::empty(),
            input_oob_size: 0,
            input_oob_action: InputOobActions::empty(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.element_count);
        buf.put_u16(self.algorithms.bits());
        buf.put_u8(self.public_key_type.bits());
        buf.put_u8(self.static_oob_type.bits());
        buf.put_u8(self.output_oob_size);
        buf.put_u16(self.output_oob_action.bits());
        buf.put_u8(self.input_oob_size);
        buf.put_u16(self.input_oob_action.bits());
    }

    fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        let caps = Self {
            element_count: buf.get_u8(),
            algorithms: Algorithms::from_bits_retain(buf.get_u16()),
            public_key_type: PublicKeyTypes::from_bits_retain(buf.get_u8()),
            static_oob_type: StaticOobTypes::from_bits_retain(buf.get_u8()),
            output_oob_size: buf.get_u8(),
            output_oob_action: OutputOobActions::from_bits_retain(buf.get_u16()),
            input_oob_size: buf.get_u8(),
            input_oob_action: InputOobActions::from_bits_retain(buf.get_u16()),
        };
        if caps.element_count == 0 {
            return Err(WireError::Field("element count"));
        }
        if !caps.algorithms.contains(Algorithms::FIPS_P256) {
            return Err(WireError::Field("algorithms"));
        }
        if caps.output_oob_size > 8 || caps.input_oob_size > 8 {
            return Err(WireError::Field("oob size"));
        }
        Ok(caps)
    }
}

/// Authentication method selected in Start
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    /// No OOB authentication; AuthValue is zero
    NoOob = 0x00,
    /// Static OOB authentication
    StaticOob = 0x01,
    /// Output OOB authentication
    OutputOob = 0x02,
    /// Input OOB authentication
    InputOob = 0x03,
}

impl TryFrom<u8> for AuthMethod {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(AuthMethod::NoOob),
            0x01 => Ok(AuthMethod::StaticOob),
            0x02 => Ok(AuthMethod::OutputOob),
            0x03 => Ok(AuthMethod::InputOob),
            _ => Err(WireError::Field("authentication method")),
        }
    }
}

/// Start parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Start {
    /// Algorithm (0 = FIPS P-256)
    pub algorithm: u8,
    /// Public key delivered out of band
    pub oob_public_key: bool,
    /// Authentication method
    pub auth_method: AuthMethod,
    /// Authentication action (OOB methods only)
    pub auth_action: u8,
    /// Authentication size (OOB methods only)
    pub auth_size: u8,
}

impl Start {
    /// Start with FIPS P-256 and the given public key and auth method
    pub fn new(oob_public_key: bool, auth_method: AuthMethod) -> Self {
        Self {
            algorithm: 0,
            oob_public_key,
            auth_method,
            auth_action: 0,
            auth_size: 0,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.algorithm);
        buf.put_u8(self.oob_public_key as u8);
        buf.put_u8(self.auth_method as u8);
        buf.put_u8(self.auth_action);
        buf.put_u8(self.auth_size);
    }

    fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        let algorithm = buf.get_u8();
        if algorithm != 0 {
            return Err(WireError::Field("algorithm"));
        }
        let oob_public_key = match buf.get_u8() {
            0 => false,
            1 => true,
            _ => return Err(WireError::Field("public key")),
        };
        let auth_method = AuthMethod::try_from(buf.get_u8())?;
        let auth_action = buf.get_u8();
        let auth_size = buf.get_u8();

        match auth_method {
            AuthMethod::NoOob | AuthMethod::StaticOob => {
                if auth_action != 0 || auth_size != 0 {
                    return Err(WireError::Field("authentication action"));
                }
            }
            AuthMethod::OutputOob | AuthMethod::InputOob => {
                if auth_size == 0 || auth_size > 8 {
                    return Err(WireError::Field("authentication size"));
                }
            }
        }

        Ok(Self {
            algorithm,
            oob_public_key,
            auth_method,
            auth_action,
            auth_size,
        })
    }
}

/// A provisioning PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningPdu {
    /// Invite with attention timer seconds
    Invite {
        /// Attention timer in seconds
        attention_duration: u8,
    },
    /// Device capabilities
    Capabilities(Capabilities),
    /// Provisioning method selection
    Start(Start),
    /// Raw `X || Y` public key
    PublicKey([u8; PUBLIC_KEY_SIZE]),
    /// Input OOB completed on the device
    InputComplete,
    /// Confirmation value
    Confirmation([u8; 16]),
    /// Random value
    Random([u8; 16]),
    /// Encrypted Provisioning Data with MIC
    Data([u8; ENCRYPTED_DATA_SIZE]),
    /// Provisioning complete
    Complete,
    /// Provisioning failed
    Failed(FailureCode),
}

impl ProvisioningPdu {
    /// The PDU type
    pub fn pdu_type(&self) -> ProvisioningPduType {
        match self {
            ProvisioningPdu::Invite { .. } => ProvisioningPduType::Invite,
            ProvisioningPdu::Capabilities(_) => ProvisioningPduType::Capabilities,
            ProvisioningPdu::Start(_) => ProvisioningPduType::Start,
            ProvisioningPdu::PublicKey(_) => ProvisioningPduType::PublicKey,
            ProvisioningPdu::InputComplete => ProvisioningPduType::InputComplete,
            ProvisioningPdu::Confirmation(_) => ProvisioningPduType::Confirmation,
            ProvisioningPdu::Random(_) => ProvisioningPduType::Random,
            ProvisioningPdu::Data(_) => ProvisioningPduType::Data,
            ProvisioningPdu::Complete => ProvisioningPduType::Complete,
            ProvisioningPdu::Failed(_) => ProvisioningPduType::Failed,
        }
    }

    /// Encode the type octet and parameters
    pub fn encode(&self) -> Bytes {
        let pdu_type = self.pdu_type();
        let mut buf = BytesMut::with_capacity(1 + pdu_type.param_len());
        buf.put_u8(pdu_type as u8);

        match self {
            ProvisioningPdu::Invite { attention_duration } => buf.put_u8(*attention_duration),
            ProvisioningPdu::Capabilities(caps) => caps.encode(&mut buf),
            ProvisioningPdu::Start(start) => start.encode(&mut buf),
            ProvisioningPdu::PublicKey(key) => buf.put_slice(key),
            ProvisioningPdu::Confirmation(value) | ProvisioningPdu::Random(value) => {
                buf.put_slice(value)
            }
            ProvisioningPdu::Data(data) => buf.put_slice(data),
            ProvisioningPdu::Failed(code) => buf.put_u8(*code as u8),
            ProvisioningPdu::InputComplete | ProvisioningPdu::Complete => {}
        }

        buf.freeze()
    }

    /// Decode a PDU, checking the type and then the exact length
    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        let (&type_octet, params) = raw.split_first().ok_or(WireError::Incomplete)?;
        // The two high bits are padding and must be zero
        if type_octet & 0xC0 != 0 {
            return Err(WireError::Reserved);
        }
        let pdu_type = ProvisioningPduType::try_from(type_octet)?;

        let expected = pdu_type.param_len();
        if params.len() != expected {
            return Err(WireError::Length {
                pdu: pdu_type.name(),
                expected,
                actual: params.len(),
            });
        }

        let pdu = match pdu_type {
            ProvisioningPduType::Invite => ProvisioningPdu::Invite {
                attention_duration: params[0],
            },
            ProvisioningPduType::Capabilities => {
                ProvisioningPdu::Capabilities(Capabilities::decode(params)?)
            }
            ProvisioningPduType::Start => ProvisioningPdu::Start(Start::decode(params)?),
            ProvisioningPduType::PublicKey => ProvisioningPdu::PublicKey(fixed(params)),
            ProvisioningPduType::InputComplete => ProvisioningPdu::InputComplete,
            ProvisioningPduType::Confirmation => ProvisioningPdu::Confirmation(fixed(params)),
            ProvisioningPduType::Random => ProvisioningPdu::Random(fixed(params)),
            ProvisioningPduType::Data => ProvisioningPdu::Data(fixed(params)),
            ProvisioningPduType::Complete => ProvisioningPdu::Complete,
            ProvisioningPduType::Failed => {
                ProvisioningPdu::Failed(FailureCode::try_from(params[0])?)
            }
        };

        Ok(pdu)
    }
}

/// Copy a slice whose length was already checked
fn fixed<const N: usize>(params: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&params[..N]);
    out
}

/// Clear-text Provisioning Data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningData {
    /// Network key
    pub net_key: [u8; 16],
    /// Network key index (12 bits)
    pub key_index: u16,
    /// Bit 0 key refresh, bit 1 IV update
    pub flags: u8,
    /// Current IV index
    pub iv_index: u32,
    /// Primary element address
    pub unicast_address: u16,
}

impl ProvisioningData {
    /// Key refresh flag
    pub const FLAG_KEY_REFRESH: u8 = 0x01;
    /// IV update flag
    pub const FLAG_IV_UPDATE: u8 = 0x02;

    /// Encode the 25 clear-text octets
    pub fn to_bytes(&self) -> [u8; 25] {
        let mut out = [0u8; 25];
        let mut buf = &mut out[..];
        buf.put_slice(&self.net_key);
        buf.put_u16(self.key_index & 0x0FFF);
        buf.put_u8(self.flags);
        buf.put_u32(self.iv_index);
        buf.put_u16(self.unicast_address);
        out
    }

    /// Decode the 25 clear-text octets
    pub fn from_bytes(raw: &[u8; 25]) -> Result<Self, WireError> {
        let mut buf = &raw[..];
        let mut net_key = [0u8; 16];
        buf.copy_to_slice(&mut net_key);
        let key_index = buf.get_u16();
        let flags = buf.get_u8();
        let iv_index = buf.get_u32();
        let unicast_address = buf.get_u16();

        if key_index > 0x0FFF {
            return Err(WireError::Field("key index"));
        }
        if flags & !0x03 != 0 {
            return Err(WireError::Reserved);
        }
        if !(0x0001..=0x7FFF).contains(&unicast_address) {
            return Err(WireError::Address(unicast_address));
        }

        Ok(Self {
            net_key,
            key_index,
            flags,
            iv_index,
            unicast_address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invite_and_failed_layout() {
        let invite = ProvisioningPdu::Invite {
            attention_duration: 5,
        };
        assert_eq!(invite.encode().as_ref(), &[0x00, 0x05]);

        let failed = ProvisioningPdu::Failed(FailureCode::ConfirmationFailed);
        assert_eq!(failed.encode().as_ref(), &[0x09, 0x04]);
        assert_eq!(ProvisioningPdu::decode(&[0x09, 0x04]).unwrap(), failed);
    }

    #[test]
    fn test_capabilities_layout() {
        let caps = Capabilities::no_oob(2);
        let encoded = ProvisioningPdu::Capabilities(caps).encode();
        assert_eq!(
            encoded.as_ref(),
            &[0x01, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            ProvisioningPdu::decode(&encoded).unwrap(),
            ProvisioningPdu::Capabilities(caps)
        );
    }

    #[test]
    fn test_start_validation() {
        let start = ProvisioningPdu::Start(Start::new(false, AuthMethod::StaticOob));
        let encoded = start.encode();
        assert_eq!(encoded.as_ref(), &[0x02, 0x00, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(ProvisioningPdu::decode(&encoded).unwrap(), start);

        // No-OOB with a nonzero action
        assert!(ProvisioningPdu::decode(&[0x02, 0x00, 0x00, 0x00, 0x01, 0x00]).is_err());
        // Unknown algorithm
        assert!(ProvisioningPdu::decode(&[0x02, 0x01, 0x00, 0x00, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_wrong_length_and_type() {
        assert_eq!(
            ProvisioningPdu::decode(&[0x05, 0x00]).unwrap_err(),
            WireError::Length {
                pdu: "confirmation",
                expected: 16,
                actual: 1
            }
        );
        let err = ProvisioningPdu::decode(&[0x0A]).unwrap_err();
        assert_eq!(err, WireError::Type(0x0A));
        assert_eq!(FailureCode::for_decode_error(&err), FailureCode::InvalidPdu);
        assert_eq!(
            FailureCode::for_decode_error(&WireError::Malformed),
            FailureCode::InvalidFormat
        );
        assert_eq!(ProvisioningPdu::decode(&[]).unwrap_err(), WireError::Incomplete);
    }

    #[test]
    fn test_public_key_and_data_lengths() {
        let key = ProvisioningPdu::PublicKey([7u8; 64]);
        assert_eq!(key.encode().len(), 65);
        assert_eq!(ProvisioningPdu::decode(&key.encode()).unwrap(), key);

        let data = ProvisioningPdu::Data([1u8; 33]);
        assert_eq!(data.encode().len(), 34);
    }

    #[test]
    fn test_provisioning_data_layout() {
        let data = ProvisioningData {
            net_key: [0xAB; 16],
            key_index: 0x0567,
            flags: ProvisioningData::FLAG_IV_UPDATE,
            iv_index: 0x12345678,
            unicast_address: 0x0B0C,
        };
        let raw = data.to_bytes();
        assert_eq!(&raw[16..], &[0x05, 0x67, 0x02, 0x12, 0x34, 0x56, 0x78, 0x0B, 0x0C]);
        assert_eq!(ProvisioningData::from_bytes(&raw).unwrap(), data);

        let mut bad = raw;
        bad[23] = 0x80;
        bad[24] = 0x00;
        assert_eq!(
            ProvisioningData::from_bytes(&bad).unwrap_err(),
            WireError::Address(0x8000)
        );
    }
}
