//! Provisioning, network layer, transport and access dispatch for the
//! Bluetooth mesh engine.
//!
//! This crate turns the codecs of `mesh-wire` and the key material of
//! `mesh-crypto` into a working mesh participant on top of any bearer that
//! moves proxy PDUs.
//!
//! ## Features
//!
//! - **Provisioning**: Provisioner and device roles, No OOB and Static OOB
//! - **Network Layer**: Sequence numbers, IV index, replay protection
//! - **Lower Transport**: Segmentation, reassembly and Segment Acknowledgments
//! - **Access Layer**: Generic OnOff and Level messages, vendor passthrough
//! - **Engine**: Pending responses, local model servers and event fan-out
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_session::{EngineConfig, LoopbackBearer, MeshEvent, MeshManager};
//! use mesh_storage::MeshNetwork;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let network = MeshNetwork::generate("Home", None);
//! let provisioner = network.provisioners[0].uuid;
//! let (end, _peer) = LoopbackBearer::pair(23);
//!
//! let manager = MeshManager::for_provisioner(
//!     network,
//!     provisioner,
//!     Arc::new(end.bearer),
//!     EngineConfig::default(),
//!     None,
//! )?;
//! manager.attach(end.inbound);
//!
//! let mut events = manager.subscribe();
//! let status = manager.send_generic_on_off(0x0002, 0, true).await?;
//! println!("Status: {:?}", status);
//!
//! while let Ok(record) = events.recv().await {
//!     if let MeshEvent::UnsolicitedMessage { source, message, .. } = record.event {
//!         println!("{:#06x} sent {}", source, message.opcode());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod message;
pub mod models;
pub mod network;
pub mod provisionee;
pub mod provisioning;
pub mod reliability;
pub mod transport;
pub mod upper;

// Re-export main types
pub use config::EngineConfig;
pub use error::MeshError;
pub use events::{EventNotifier, EventRecord, MeshEvent};
pub use manager::{MeshManager, PendingResponse};
pub use message::{MeshMessage, MessageState, TidCounter, Transition};
pub use models::{GenericLevelServer, GenericOnOffServer, ModelHandler};
pub use network::{NetworkLayer, ReceivedPdu};
pub use provisionee::{ProvisionedDevice, Provisionee, ProvisioneeState};
pub use provisioning::{
    AuthValue, ProvisioningError, ProvisioningParams, ProvisioningSession, ProvisioningState, Step,
};
pub use reliability::{
    CompletedMessage, IncomingSegment, OutgoingState, ReassemblyTable, SegmentOutcome,
    SegmentedSend,
};
pub use transport::{Bearer, LoopbackBearer, LoopbackEnd};
pub use upper::{KeyRef, NonceKind, UpperContext};
