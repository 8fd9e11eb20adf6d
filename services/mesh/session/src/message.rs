//! Access messages as a tagged variant, their opcode registry and the
//! per-send message state.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mesh_wire::{access_payload, Address, Opcode};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::MeshError;
use crate::upper::KeyRef;

/// Largest number of transition steps (0x3F means unknown)
pub const MAX_TRANSITION_STEPS: u8 = 0x3E;

/// Generic Default Transition Time plus delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Number of steps (6 bits)
    pub steps: u8,
    /// Step resolution: 100 ms, 1 s, 10 s or 10 min
    pub resolution: u8,
    /// Delay in 5 ms units
    pub delay: u8,
}

impl Transition {
    /// Validated transition
    pub fn new(steps: u8, resolution: u8, delay: u8) -> Result<Self, MeshError> {
        if steps > MAX_TRANSITION_STEPS {
            return Err(MeshError::Invalid(format!("transition steps {:#04x}", steps)));
        }
        if resolution > 3 {
            return Err(MeshError::Invalid(format!(
                "transition resolution {}",
                resolution
            )));
        }
        Ok(Self {
            steps,
            resolution,
            delay,
        })
    }

    fn time_octet(&self) -> u8 {
        (self.resolution << 6) | self.steps
    }

    fn decode(time: u8, delay: u8) -> Result<Self, MeshError> {
        Self::new(time & 0x3F, time >> 6, delay)
            .map_err(|e| MeshError::ProtocolViolation(e.to_string()))
    }

    /// Total transition duration, excluding the delay
    pub fn duration(&self) -> Duration {
        let unit = match self.resolution {
            0 => Duration::from_millis(100),
            1 => Duration::from_secs(1),
            2 => Duration::from_secs(10),
            _ => Duration::from_secs(600),
        };
        unit * self.steps as u32
    }
}

/// A typed access message
#[derive(Debug, Clone, PartialEq)]
pub enum MeshMessage {
    /// Generic OnOff Get
    GenericOnOffGet,
    /// Generic OnOff Set
    GenericOnOffSet {
        /// Target state
        on: bool,
        /// Transaction identifier
        tid: u8,
        /// Optional transition
        transition: Option<Transition>,
    },
    /// Generic OnOff Set Unacknowledged
    GenericOnOffSetUnacknowledged {
        /// Target state
        on: bool,
        /// Transaction identifier
        tid: u8,
        /// Optional transition
        transition: Option<Transition>,
    },
    /// Generic OnOff Status
    GenericOnOffStatus {
        /// Present state
        present: bool,
        /// Target state and remaining time octet while transitioning
        target: Option<(bool, u8)>,
    },
    /// Generic Level Get
    GenericLevelGet,
    /// Generic Level Set
    GenericLevelSet {
        /// Target level
        level: i16,
        /// Transaction identifier
        tid: u8,
        /// Optional transition
        transition: Option<Transition>,
    },
    /// Generic Level Set Unacknowledged
    GenericLevelSetUnacknowledged {
        /// Target level
        level: i16,
        /// Transaction identifier
        tid: u8,
        /// Optional transition
        transition: Option<Transition>,
    },
    /// Generic Level Status
    GenericLevelStatus {
        /// Present level
        present: i16,
        /// Target level and remaining time octet while transitioning
        target: Option<(i16, u8)>,
    },
    /// Any other opcode, parameters kept verbatim
    Raw {
        /// Opcode
        opcode: Opcode,
        /// Parameters
        params: Bytes,
    },
}

type Decoder = fn(&[u8]) -> Result<MeshMessage, MeshError>;

static DECODERS: Lazy<HashMap<Opcode, Decoder>> = Lazy::new(|| {
    let mut map: HashMap<Opcode, Decoder> = HashMap::new();
    map.insert(Opcode::GENERIC_ONOFF_GET, |p| {
        expect_len(p, &[0])?;
        Ok(MeshMessage::GenericOnOffGet)
    });
    map.insert(Opcode::GENERIC_ONOFF_SET, |p| {
        let (on, tid, transition) = decode_onoff_set(p)?;
        Ok(MeshMessage::GenericOnOffSet {
            on,
            tid,
            transition,
        })
    });
    map.insert(Opcode::GENERIC_ONOFF_SET_UNACK, |p| {
        let (on, tid, transition) = decode_onoff_set(p)?;
        Ok(MeshMessage::GenericOnOffSetUnacknowledged {
            on,
            tid,
            transition,
        })
    });
    map.insert(Opcode::GENERIC_ONOFF_STATUS, |p| {
        expect_len(p, &[1, 3])?;
        let present = onoff(p[0])?;
        let target = if p.len() == 3 {
            Some((onoff(p[1])?, p[2]))
        } else {
            None
        };
        Ok(MeshMessage::GenericOnOffStatus { present, target })
    });
    map.insert(Opcode::GENERIC_LEVEL_GET, |p| {
        expect_len(p, &[0])?;
        Ok(MeshMessage::GenericLevelGet)
    });
    map.insert(Opcode::GENERIC_LEVEL_SET, |p| {
        let (level, tid, transition) = decode_level_set(p)?;
        Ok(MeshMessage::GenericLevelSet {
            level,
            tid,
            transition,
        })
    });
    map.insert(Opcode::GENERIC_LEVEL_SET_UNACK, |p| {
        let (level, tid, transition) = decode_level_set(p)?;
        Ok(MeshMessage::GenericLevelSetUnacknowledged {
            level,
            tid,
            transition,
        })
    });
    map.insert(Opcode::GENERIC_LEVEL_STATUS, |p| {
        expect_len(p, &[2, 5])?;
        let mut buf = p;
        let present = buf.get_i16_le();
        let target = if buf.remaining() == 3 {
            Some((buf.get_i16_le(), buf.get_u8()))
        } else {
            None
        };
        Ok(MeshMessage::GenericLevelStatus { present, target })
    });
    map
});

fn expect_len(params: &[u8], allowed: &[usize]) -> Result<(), MeshError> {
    if allowed.contains(&params.len()) {
        Ok(())
    } else {
        Err(MeshError::ProtocolViolation(format!(
            "unexpected parameter length {}",
            params.len()
        )))
    }
}

fn onoff(value: u8) -> Result<bool, MeshError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(MeshError::ProtocolViolation(format!(
            "OnOff value {:#04x}",
            other
        ))),
    }
}

fn decode_onoff_set(p: &[u8]) -> Result<(bool, u8, Option<Transition>), MeshError> {
    expect_len(p, &[2, 4])?;
    let transition = if p.len() == 4 {
        Some(Transition::decode(p[2], p[3])?)
    } else {
        None
    };
    Ok((onoff(p[0])?, p[1], transition))
}

fn decode_level_set(p: &[u8]) -> Result<(i16, u8, Option<Transition>), MeshError> {
    expect_len(p, &[3, 5])?;
    let level = i16::from_le_bytes([p[0], p[1]]);
    let transition = if p.len() == 5 {
        Some(Transition::decode(p[3], p[4])?)
    } else {
        None
    };
    Ok((level, p[2], transition))
}

fn put_transition(buf: &mut BytesMut, transition: &Option<Transition>) {
    if let Some(t) = transition {
        buf.put_u8(t.time_octet());
        buf.put_u8(t.delay);
    }
}

impl MeshMessage {
    /// Opcode of this message
    pub fn opcode(&self) -> Opcode {
        match self {
            MeshMessage::GenericOnOffGet => Opcode::GENERIC_ONOFF_GET,
            MeshMessage::GenericOnOffSet { .. } => Opcode::GENERIC_ONOFF_SET,
            MeshMessage::GenericOnOffSetUnacknowledged { .. } => Opcode::GENERIC_ONOFF_SET_UNACK,
            MeshMessage::GenericOnOffStatus { .. } => Opcode::GENERIC_ONOFF_STATUS,
            MeshMessage::GenericLevelGet => Opcode::GENERIC_LEVEL_GET,
            MeshMessage::GenericLevelSet { .. } => Opcode::GENERIC_LEVEL_SET,
            MeshMessage::GenericLevelSetUnacknowledged { .. } => Opcode::GENERIC_LEVEL_SET_UNACK,
            MeshMessage::GenericLevelStatus { .. } => Opcode::GENERIC_LEVEL_STATUS,
            MeshMessage::Raw { opcode, .. } => *opcode,
        }
    }

    /// Opcode of the expected response, for acknowledged messages
    pub fn response_opcode(&self) -> Option<Opcode> {
        match self {
            MeshMessage::GenericOnOffGet | MeshMessage::GenericOnOffSet { .. } => {
                Some(Opcode::GENERIC_ONOFF_STATUS)
            }
            MeshMessage::GenericLevelGet | MeshMessage::GenericLevelSet { .. } => {
                Some(Opcode::GENERIC_LEVEL_STATUS)
            }
            _ => None,
        }
    }

    /// Whether a response is expected
    pub fn is_acknowledged(&self) -> bool {
        self.response_opcode().is_some()
    }

    /// Replace the TID of a "set" message
    pub fn with_tid(self, new_tid: u8) -> Self {
        match self {
            MeshMessage::GenericOnOffSet { on, transition, .. } => MeshMessage::GenericOnOffSet {
                on,
                tid: new_tid,
                transition,
            },
            MeshMessage::GenericOnOffSetUnacknowledged { on, transition, .. } => {
                MeshMessage::GenericOnOffSetUnacknowledged {
                    on,
                    tid: new_tid,
                    transition,
                }
            }
            MeshMessage::GenericLevelSet {
                level, transition, ..
            } => MeshMessage::GenericLevelSet {
                level,
                tid: new_tid,
                transition,
            },
            MeshMessage::GenericLevelSetUnacknowledged {
                level, transition, ..
            } => MeshMessage::GenericLevelSetUnacknowledged {
                level,
                tid: new_tid,
                transition,
            },
            other => other,
        }
    }

    /// Whether the message carries a TID
    pub fn has_tid(&self) -> bool {
        matches!(
            self,
            MeshMessage::GenericOnOffSet { .. }
                | MeshMessage::GenericOnOffSetUnacknowledged { .. }
                | MeshMessage::GenericLevelSet { .. }
                | MeshMessage::GenericLevelSetUnacknowledged { .. }
        )
    }

    /// Encoded parameters
    pub fn parameters(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            MeshMessage::GenericOnOffGet | MeshMessage::GenericLevelGet => {}
            MeshMessage::GenericOnOffSet {
                on,
                tid,
                transition,
            }
            | MeshMessage::GenericOnOffSetUnacknowledged {
                on,
                tid,
                transition,
            } => {
                buf.put_u8(*on as u8);
                buf.put_u8(*tid);
                put_transition(&mut buf, transition);
            }
            MeshMessage::GenericOnOffStatus { present, target } => {
                buf.put_u8(*present as u8);
                if let Some((on, remaining)) = target {
                    buf.put_u8(*on as u8);
                    buf.put_u8(*remaining);
                }
            }
            MeshMessage::GenericLevelSet {
                level,
                tid,
                transition,
            }
            | MeshMessage::GenericLevelSetUnacknowledged {
                level,
                tid,
                transition,
            } => {
                buf.put_i16_le(*level);
                buf.put_u8(*tid);
                put_transition(&mut buf, transition);
            }
            MeshMessage::GenericLevelStatus { present, target } => {
                buf.put_i16_le(*present);
                if let Some((level, remaining)) = target {
                    buf.put_i16_le(*level);
                    buf.put_u8(*remaining);
                }
            }
            MeshMessage::Raw { params, .. } => buf.put_slice(params),
        }
        buf.freeze()
    }

    /// Opcode followed by parameters
    pub fn encode(&self) -> Result<Bytes, MeshError> {
        Ok(access_payload(self.opcode(), &self.parameters())?)
    }

    /// Decode an access payload; unregistered opcodes become [`MeshMessage::Raw`]
    pub fn decode(raw: &[u8]) -> Result<Self, MeshError> {
        let (opcode, params) = Opcode::decode(raw)?;
        match DECODERS.get(&opcode) {
            Some(decoder) => decoder(params),
            None => Ok(MeshMessage::Raw {
                opcode,
                params: Bytes::copy_from_slice(params),
            }),
        }
    }
}

/// Hands out 8-bit transaction identifiers per source address
#[derive(Debug, Default)]
pub struct TidCounter {
    next: HashMap<u16, u8>,
}

impl TidCounter {
    /// Create an empty counter
    pub fn new() -> Self {
        Self::default()
    }

    /// Next TID for `source`; wraps 255 -> 0
    pub fn next(&mut self, source: u16) -> u8 {
        let slot = self.next.entry(source).or_insert(0);
        let tid = *slot;
        *slot = slot.wrapping_add(1);
        tid
    }
}

/// Per-send state of an access message
#[derive(Debug, Clone, PartialEq)]
pub enum MessageState {
    /// Completes when the last PDU reaches the bearer
    Unacknowledged {
        /// Message to send
        message: MeshMessage,
        /// Destination address
        destination: u16,
        /// Securing key
        key: KeyRef,
    },
    /// Completes when a matching response arrives, or fails after `timeout`
    Acknowledged {
        /// Message to send
        message: MeshMessage,
        /// Destination address
        destination: u16,
        /// Securing key
        key: KeyRef,
        /// Opcode of the awaited response
        response_opcode: Opcode,
        /// Response deadline
        timeout: Duration,
    },
}

impl MessageState {
    /// State for `message`, acknowledged when it expects a response
    pub fn new(message: MeshMessage, destination: u16, key: KeyRef, timeout: Duration) -> Self {
        match message.response_opcode() {
            Some(response_opcode) => MessageState::Acknowledged {
                message,
                destination,
                key,
                response_opcode,
                timeout,
            },
            None => MessageState::Unacknowledged {
                message,
                destination,
                key,
            },
        }
    }

    /// The message
    pub fn message(&self) -> &MeshMessage {
        match self {
            MessageState::Unacknowledged { message, .. }
            | MessageState::Acknowledged { message, .. } => message,
        }
    }

    /// Destination address
    pub fn destination(&self) -> u16 {
        match self {
            MessageState::Unacknowledged { destination, .. }
            | MessageState::Acknowledged { destination, .. } => *destination,
        }
    }

    /// Securing key
    pub fn key(&self) -> KeyRef {
        match self {
            MessageState::Unacknowledged { key, .. } | MessageState::Acknowledged { key, .. } => {
                *key
            }
        }
    }

    /// Build the access payload
    pub fn build_payload(&self) -> Result<Bytes, MeshError> {
        let destination = Address(self.destination());
        if !destination.is_valid_destination() {
            return Err(MeshError::Invalid(format!(
                "invalid destination {}",
                destination
            )));
        }
        self.message().encode()
    }

    /// Whether a received message answers this one.
    ///
    /// A response travels to the requester's unicast address, secured with
    /// the key of the request. Responses to a unicast request must come from
    /// that element; a group or virtual request is answered by any element.
    pub fn matches(&self, opcode: Opcode, source: u16, destination: u16, key: KeyRef) -> bool {
        match self {
            MessageState::Unacknowledged { .. } => false,
            MessageState::Acknowledged {
                destination: requested,
                key: request_key,
                response_opcode,
                ..
            } => {
                *response_opcode == opcode
                    && *request_key == key
                    && Address(source).is_unicast()
                    && Address(destination).is_unicast()
                    && (!Address(*requested).is_unicast() || *requested == source)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_onoff_set_encoding() {
        let msg = MeshMessage::GenericOnOffSet {
            on: true,
            tid: 7,
            transition: Some(Transition::new(0x0A, 1, 2).unwrap()),
        };
        assert_eq!(msg.encode().unwrap().as_ref(), &[0x82, 0x02, 0x01, 0x07, 0x4A, 0x02]);
        assert_eq!(MeshMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
        assert_eq!(msg.response_opcode(), Some(Opcode::GENERIC_ONOFF_STATUS));
    }

    #[test]
    fn test_level_status_decoding() {
        let raw = [0x82, 0x08, 0x00, 0x80, 0xFF, 0x7F, 0x05];
        assert_eq!(
            MeshMessage::decode(&raw).unwrap(),
            MeshMessage::GenericLevelStatus {
                present: i16::MIN,
                target: Some((i16::MAX, 0x05)),
            }
        );
    }

    #[test]
    fn test_transition_validation() {
        assert!(Transition::new(0x3E, 3, 0).is_ok());
        assert!(Transition::new(0x3F, 0, 0).is_err());
        assert!(Transition::new(1, 4, 0).is_err());
        assert_eq!(
            Transition::new(5, 1, 0).unwrap().duration(),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_bad_parameters_rejected() {
        // OnOff value 2 is prohibited
        assert!(MeshMessage::decode(&[0x82, 0x02, 0x02, 0x00]).is_err());
        // Wrong length
        assert!(MeshMessage::decode(&[0x82, 0x04, 0x01, 0x00]).is_err());
    }

    #[test]
    fn test_unknown_opcode_is_raw() {
        let raw = [0xC1, 0x59, 0x00, 0xAA, 0xBB];
        let msg = MeshMessage::decode(&raw).unwrap();
        assert_eq!(
            msg,
            MeshMessage::Raw {
                opcode: Opcode::Vendor {
                    opcode: 0x01,
                    company: 0x0059
                },
                params: Bytes::from_static(&[0xAA, 0xBB]),
            }
        );
        assert!(!msg.is_acknowledged());
        assert_eq!(msg.encode().unwrap().as_ref(), &raw);
    }

    #[test]
    fn test_tid_counter_wraps_per_source() {
        let mut tids = TidCounter::new();
        for expected in 0..=255u8 {
            assert_eq!(tids.next(0x0001), expected);
        }
        assert_eq!(tids.next(0x0001), 0);
        assert_eq!(tids.next(0x0002), 0);
    }

    #[test]
    fn test_message_state_matching() {
        let timeout = Duration::from_secs(2);
        let unicast = MessageState::new(
            MeshMessage::GenericOnOffGet,
            0x0005,
            KeyRef::App(0),
            timeout,
        );
        assert!(unicast.matches(Opcode::GENERIC_ONOFF_STATUS, 0x0005, 0x0001, KeyRef::App(0)));
        assert!(!unicast.matches(Opcode::GENERIC_ONOFF_STATUS, 0x0006, 0x0001, KeyRef::App(0)));
        assert!(!unicast.matches(Opcode::GENERIC_LEVEL_STATUS, 0x0005, 0x0001, KeyRef::App(0)));

        let group = MessageState::new(
            MeshMessage::GenericLevelGet,
            0xC000,
            KeyRef::App(0),
            timeout,
        );
        assert!(group.matches(Opcode::GENERIC_LEVEL_STATUS, 0x0042, 0x0001, KeyRef::App(0)));
        // Other key, published status, group source
        assert!(!group.matches(Opcode::GENERIC_LEVEL_STATUS, 0x0042, 0x0001, KeyRef::App(1)));
        assert!(!group.matches(Opcode::GENERIC_LEVEL_STATUS, 0x0042, 0x0001, KeyRef::Device));
        assert!(!group.matches(Opcode::GENERIC_LEVEL_STATUS, 0x0042, 0xC001, KeyRef::App(0)));
        assert!(!group.matches(Opcode::GENERIC_LEVEL_STATUS, 0xC002, 0x0001, KeyRef::App(0)));

        let unack = MessageState::new(
            MeshMessage::GenericOnOffSetUnacknowledged {
                on: false,
                tid: 0,
                transition: None,
            },
            0xC000,
            KeyRef::App(0),
            timeout,
        );
        assert!(!unack.matches(Opcode::GENERIC_ONOFF_STATUS, 0x0042, 0x0001, KeyRef::App(0)));
        assert!(unack.build_payload().is_ok());
    }

    #[test]
    fn test_tid_replacement() {
        let set = MeshMessage::GenericLevelSet {
            level: -100,
            tid: 0,
            transition: None,
        };
        assert!(set.has_tid());
        assert_eq!(
            set.with_tid(42),
            MeshMessage::GenericLevelSet {
                level: -100,
                tid: 42,
                transition: None,
            }
        );

        assert!(!MeshMessage::GenericOnOffGet.has_tid());
        assert_eq!(
            MeshMessage::GenericOnOffGet.with_tid(42),
            MeshMessage::GenericOnOffGet
        );
    }
}
