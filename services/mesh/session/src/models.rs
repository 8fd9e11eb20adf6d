//! Local model servers that answer incoming access messages.

use mesh_wire::Opcode;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tracing::debug;

use crate::message::MeshMessage;

/// A model bound to the local node
pub trait ModelHandler: Send + Sync {
    /// Opcodes this model consumes
    fn opcodes(&self) -> &[Opcode];

    /// Process a message. The returned message is sent back to `source`.
    fn handle(&self, source: u16, destination: u16, message: &MeshMessage) -> Option<MeshMessage>;
}

const ONOFF_OPCODES: [Opcode; 3] = [
    Opcode::GENERIC_ONOFF_GET,
    Opcode::GENERIC_ONOFF_SET,
    Opcode::GENERIC_ONOFF_SET_UNACK,
];

const LEVEL_OPCODES: [Opcode; 3] = [
    Opcode::GENERIC_LEVEL_GET,
    Opcode::GENERIC_LEVEL_SET,
    Opcode::GENERIC_LEVEL_SET_UNACK,
];

/// Generic OnOff Server with instantaneous transitions
#[derive(Debug, Default)]
pub struct GenericOnOffServer {
    state: AtomicBool,
}

impl GenericOnOffServer {
    /// Server starting in `initial`
    pub fn new(initial: bool) -> Self {
        Self {
            state: AtomicBool::new(initial),
        }
    }

    /// Present state
    pub fn state(&self) -> bool {
        self.state.load(Ordering::SeqCst)
    }

    fn status(&self) -> MeshMessage {
        MeshMessage::GenericOnOffStatus {
            present: self.state(),
            target: None,
        }
    }
}

impl ModelHandler for GenericOnOffServer {
    fn opcodes(&self) -> &[Opcode] {
        &ONOFF_OPCODES
    }

    fn handle(&self, source: u16, _destination: u16, message: &MeshMessage) -> Option<MeshMessage> {
        match message {
            MeshMessage::GenericOnOffGet => Some(self.status()),
            MeshMessage::GenericOnOffSet { on, .. } => {
                self.state.store(*on, Ordering::SeqCst);
                debug!("OnOff set to {} by {:#06x}", on, source);
                Some(self.status())
            }
            MeshMessage::GenericOnOffSetUnacknowledged { on, .. } => {
                self.state.store(*on, Ordering::SeqCst);
                debug!("OnOff set to {} by {:#06x} (unacknowledged)", on, source);
                None
            }
            _ => None,
        }
    }
}

/// Generic Level Server with instantaneous transitions
#[derive(Debug, Default)]
pub struct GenericLevelServer {
    level: AtomicI32,
}

impl GenericLevelServer {
    /// Server starting at `initial`
    pub fn new(initial: i16) -> Self {
        Self {
            level: AtomicI32::new(initial as i32),
        }
    }

    /// Present level
    pub fn level(&self) -> i16 {
        self.level.load(Ordering::SeqCst) as i16
    }

    fn status(&self) -> MeshMessage {
        MeshMessage::GenericLevelStatus {
            present: self.level(),
            target: None,
        }
    }
}

impl ModelHandler for GenericLevelServer {
    fn opcodes(&self) -> &[Opcode] {
        &LEVEL_OPCODES
    }

    fn handle(&self, _source: u16, _destination: u16, message: &MeshMessage) -> Option<MeshMessage> {
        match message {
            MeshMessage::GenericLevelGet => Some(self.status()),
            MeshMessage::GenericLevelSet { level, .. } => {
                self.level.store(*level as i32, Ordering::SeqCst);
                Some(self.status())
            }
            MeshMessage::GenericLevelSetUnacknowledged { level, .. } => {
                self.level.store(*level as i32, Ordering::SeqCst);
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_onoff_server() {
        let server = GenericOnOffServer::new(false);
        let reply = server.handle(
            0x0001,
            0x0002,
            &MeshMessage::GenericOnOffSet {
                on: true,
                tid: 0,
                transition: None,
            },
        );
        assert_eq!(
            reply,
            Some(MeshMessage::GenericOnOffStatus {
                present: true,
                target: None
            })
        );

        let reply = server.handle(
            0x0001,
            0x0002,
            &MeshMessage::GenericOnOffSetUnacknowledged {
                on: false,
                tid: 1,
                transition: None,
            },
        );
        assert!(reply.is_none());
        assert!(!server.state());
    }

    #[test]
    fn test_level_server() {
        let server = GenericLevelServer::new(-100);
        assert_eq!(
            server.handle(0x0001, 0x0002, &MeshMessage::GenericLevelGet),
            Some(MeshMessage::GenericLevelStatus {
                present: -100,
                target: None
            })
        );
        server.handle(
            0x0001,
            0x0002,
            &MeshMessage::GenericLevelSetUnacknowledged {
                level: 2000,
                tid: 3,
                transition: None,
            },
        );
        assert_eq!(server.level(), 2000);
        assert!(server.opcodes().contains(&Opcode::GENERIC_LEVEL_SET));
    }
}
