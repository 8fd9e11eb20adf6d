//! Event notification for observers of the engine (UI, CLI)

use mesh_wire::Opcode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::message::MeshMessage;

/// Something observers may want to react to
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// A group became the target of subsequent commands
    GroupSelected {
        /// Group address
        address: u16,
    },
    /// Bearer connected or disconnected
    ConnectionStateChanged {
        /// New state
        connected: bool,
    },
    /// A message was handed to the bearer
    MessageSent {
        /// Message opcode
        opcode: Opcode,
        /// Destination address
        destination: u16,
    },
    /// A message could not be delivered or got no response
    MessageFailed {
        /// Message opcode
        opcode: Opcode,
        /// Destination address
        destination: u16,
        /// Machine-readable reason
        reason: &'static str,
    },
    /// Response to an acknowledged message
    MessageReceived {
        /// Source element
        source: u16,
        /// Decoded message
        message: MeshMessage,
    },
    /// Message not matching any pending exchange
    UnsolicitedMessage {
        /// Source element
        source: u16,
        /// Destination address
        destination: u16,
        /// Decoded message
        message: MeshMessage,
    },
    /// Provisioning finished and the node joined the network
    NodeProvisioned {
        /// Device UUID
        uuid: Uuid,
        /// Primary element address
        unicast_address: u16,
        /// Number of elements
        element_count: u8,
    },
    /// Provisioning aborted
    ProvisioningFailed {
        /// Device UUID
        uuid: Uuid,
        /// Machine-readable reason
        reason: &'static str,
    },
}

/// An event with its notifier sequence number
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Monotonic per notifier, starting at 1
    pub sequence: u64,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
    /// The event
    pub event: MeshEvent,
}

/// Broadcasts engine events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventNotifier {
    event_tx: broadcast::Sender<EventRecord>,
    sequence_counter: Arc<AtomicU64>,
}

impl EventNotifier {
    /// Create a notifier buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            event_tx,
            sequence_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.event_tx.subscribe()
    }

    fn next_sequence(&self) -> u64 {
        self.sequence_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish an event. Having no subscriber is not an error.
    pub fn notify(&self, event: MeshEvent) {
        match &event {
            MeshEvent::NodeProvisioned {
                uuid,
                unicast_address,
                ..
            } => info!("Node {} provisioned at {:#06x}", uuid, unicast_address),
            MeshEvent::ProvisioningFailed { uuid, reason } => {
                warn!("Provisioning of {} failed: {}", uuid, reason)
            }
            MeshEvent::MessageFailed {
                opcode,
                destination,
                reason,
            } => warn!(
                "Message {} to {:#06x} failed: {}",
                opcode, destination, reason
            ),
            MeshEvent::ConnectionStateChanged { connected } => {
                info!("Connection state changed: connected={}", connected)
            }
            _ => {}
        }

        let record = EventRecord {
            sequence: self.next_sequence(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            event,
        };
        let sequence = record.sequence;
        if self.event_tx.send(record).is_err() {
            debug!("No subscribers for event (seq: {})", sequence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_are_sequenced() {
        let notifier = EventNotifier::new(8);
        let mut rx = notifier.subscribe();

        notifier.notify(MeshEvent::GroupSelected { address: 0xC000 });
        notifier.notify(MeshEvent::ConnectionStateChanged { connected: false });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(first.event, MeshEvent::GroupSelected { address: 0xC000 });
    }

    #[test]
    fn test_notify_without_subscribers() {
        let notifier = EventNotifier::new(1);
        notifier.notify(MeshEvent::GroupSelected { address: 0xC001 });
    }
}
