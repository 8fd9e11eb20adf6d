//! Mesh manager: the engine facade tying the layers to a bearer.
//!
//! The manager owns the network aggregate, the stateful network layer and the
//! transport tables for one bearer connection. Inbound proxy PDUs are fed
//! through [`MeshManager::on_raw_pdu_received`] (or a pump started with
//! [`MeshManager::attach`]); outbound traffic starts from the send and
//! provisioning commands.

use bytes::Bytes;
use dashmap::DashMap;
use mesh_crypto::ApplicationKeyMaterial;
use mesh_storage::{
    AllocatedRange, ApplicationKey, Group, IvIndex, KeyRefreshPhase, MeshKey, MeshNetwork,
    NetworkKey, NetworkStore, Node, RangeKind,
};
use mesh_wire::{
    proxy, Address, LowerTransportPdu, NetworkPdu, Opcode, ProvisioningData, ProvisioningPdu,
    ProxyPduType, ProxyReassembler, SegmentAck, Segmenter,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock as StdRwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::EngineConfig;
use crate::error::MeshError;
use crate::events::{EventNotifier, EventRecord, MeshEvent};
use crate::message::{MeshMessage, MessageState, TidCounter};
use crate::models::ModelHandler;
use crate::network::{NetworkLayer, ReceivedPdu};
use crate::provisionee::{ProvisionedDevice, Provisionee, ProvisioneeState};
use crate::provisioning::{ProvisioningError, ProvisioningParams, ProvisioningSession, Step};
use crate::reliability::{IncomingSegment, OutgoingState, SegmentOutcome, SegmentedSend};
use crate::transport::Bearer;
use crate::upper::{self, KeyRef, NonceKind, UpperContext};

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An acknowledged message waiting for its response
struct PendingEntry {
    state: MessageState,
    tx: oneshot::Sender<MeshMessage>,
}

/// Inbound provisioning PDUs are forwarded to the running session
struct ProvisioningLink {
    device: Uuid,
    tx: mpsc::UnboundedSender<Bytes>,
}

/// A decrypted-to-be upper transport PDU with its addressing
struct UpperPdu {
    akf: bool,
    aid: u8,
    szmic: bool,
    seq: u32,
    iv_index: u32,
    src: u16,
    dst: u16,
    net_key_index: u16,
    upper_pdu: Bytes,
}

struct Inner {
    config: EngineConfig,
    bearer: Arc<dyn Bearer>,
    network: RwLock<MeshNetwork>,
    /// Single writer for sequence numbers and network encoding
    layer: Mutex<Option<NetworkLayer>>,
    provisioner_id: Option<Uuid>,
    store: Option<Arc<dyn NetworkStore>>,
    events: EventNotifier,
    pending: DashMap<u64, PendingEntry>,
    next_exchange: AtomicU64,
    /// Ack channels of segmented sends, keyed by (destination, SeqZero)
    outgoing: DashMap<(u16, u16), mpsc::UnboundedSender<SegmentAck>>,
    reassembly: StdMutex<crate::reliability::ReassemblyTable>,
    proxy_rx: StdMutex<ProxyReassembler>,
    /// In-flight address reservations by device UUID
    reservations: DashMap<Uuid, AllocatedRange>,
    provisioning: StdMutex<Option<ProvisioningLink>>,
    provisionee: StdMutex<Option<Provisionee>>,
    tids: StdMutex<TidCounter>,
    handlers: StdRwLock<Vec<Arc<dyn ModelHandler>>>,
    selected_group: StdMutex<Option<u16>>,
    connected: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Releases the provisioning slot and any reservation of one run
struct ProvisioningGuard<'a> {
    inner: &'a Inner,
    device: Uuid,
}

impl Drop for ProvisioningGuard<'_> {
    fn drop(&mut self) {
        if self.inner.reservations.remove(&self.device).is_some() {
            debug!("Released address reservation of {}", self.device);
        }
        let mut slot = lock(&self.inner.provisioning);
        if slot.as_ref().map(|link| link.device) == Some(self.device) {
            *slot = None;
        }
    }
}

/// Removes the ack channel of a segmented send
struct OutgoingGuard<'a> {
    inner: &'a Inner,
    key: Option<(u16, u16)>,
}

impl Drop for OutgoingGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.inner.outgoing.remove(&key);
        }
    }
}

/// Response handle of an acknowledged message.
///
/// Dropping it, or calling [`cancel`](Self::cancel), removes the exchange
/// from the pending table.
pub struct PendingResponse {
    id: u64,
    opcode: Opcode,
    destination: u16,
    timeout: Duration,
    rx: oneshot::Receiver<MeshMessage>,
    inner: Arc<Inner>,
}

impl PendingResponse {
    /// Exchange id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response; `NoResponse` after the acknowledgment timeout
    pub async fn wait(mut self) -> Result<MeshMessage, MeshError> {
        match timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(MeshError::Cancelled),
            Err(_) => {
                self.inner.events.notify(MeshEvent::MessageFailed {
                    opcode: self.opcode,
                    destination: self.destination,
                    reason: MeshError::NoResponse.reason(),
                });
                Err(MeshError::NoResponse)
            }
        }
    }

    /// Stop waiting
    pub fn cancel(self) {
        debug!("Exchange {} cancelled", self.id);
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.id);
    }
}

/// The mesh engine for one bearer connection
#[derive(Clone)]
pub struct MeshManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MeshManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshManager")
            .field("provisioner", &self.inner.provisioner_id)
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

impl MeshManager {
    fn build(
        config: EngineConfig,
        bearer: Arc<dyn Bearer>,
        network: MeshNetwork,
        layer: Option<NetworkLayer>,
        provisioner_id: Option<Uuid>,
        provisionee: Option<Provisionee>,
        store: Option<Arc<dyn NetworkStore>>,
    ) -> Self {
        let events = EventNotifier::new(config.event_capacity);
        let reassembly = crate::reliability::ReassemblyTable::new(config.reassembly_timeout);
        Self {
            inner: Arc::new(Inner {
                config,
                bearer,
                network: RwLock::new(network),
                layer: Mutex::new(layer),
                provisioner_id,
                store,
                events,
                pending: DashMap::new(),
                next_exchange: AtomicU64::new(1),
                outgoing: DashMap::new(),
                reassembly: StdMutex::new(reassembly),
                proxy_rx: StdMutex::new(ProxyReassembler::new()),
                reservations: DashMap::new(),
                provisioning: StdMutex::new(None),
                provisionee: StdMutex::new(provisionee),
                tids: StdMutex::new(TidCounter::new()),
                handlers: StdRwLock::new(Vec::new()),
                selected_group: StdMutex::new(None),
                connected: AtomicBool::new(false),
                tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Engine acting for `provisioner`, whose own node sends and receives
    pub fn for_provisioner(
        network: MeshNetwork,
        provisioner: Uuid,
        bearer: Arc<dyn Bearer>,
        config: EngineConfig,
        store: Option<Arc<dyn NetworkStore>>,
    ) -> Result<Self, MeshError> {
        config.validate()?;
        let address = network
            .provisioner(provisioner)
            .ok_or_else(|| MeshError::Invalid(format!("unknown provisioner {}", provisioner)))?
            .unicast_address
            .ok_or(MeshError::NotProvisioned)?;
        let sequence = network
            .node_by_address(address)
            .map(|node| node.sequence_number)
            .ok_or(MeshError::NotProvisioned)?;
        let tx_key = network
            .primary_net_key()
            .map(|key| key.index)
            .ok_or(MeshError::NotProvisioned)?;
        let layer = NetworkLayer::new(
            address,
            sequence,
            network.iv_index,
            tx_key,
            &network.net_keys,
        )?;

        info!(
            "Mesh manager for provisioner {} at {:#06x} (sequence {})",
            provisioner, address, sequence
        );
        Ok(Self::build(
            config,
            bearer,
            network,
            Some(layer),
            Some(provisioner),
            None,
            store,
        ))
    }

    /// Engine for an unprovisioned device waiting to be provisioned
    pub fn unprovisioned(
        provisionee: Provisionee,
        bearer: Arc<dyn Bearer>,
        config: EngineConfig,
        store: Option<Arc<dyn NetworkStore>>,
    ) -> Result<Self, MeshError> {
        config.validate()?;
        let network = MeshNetwork::new(format!("Device {}", provisionee.uuid()));
        info!("Mesh manager for unprovisioned device {}", provisionee.uuid());
        Ok(Self::build(
            config,
            bearer,
            network,
            None,
            None,
            Some(provisionee),
            store,
        ))
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EventRecord> {
        self.inner.events.subscribe()
    }

    /// Start pumping `inbound` into the engine and the reassembly sweep.
    /// The tasks hold only a weak reference and stop with the manager.
    pub fn attach(&self, mut inbound: mpsc::UnboundedReceiver<Bytes>) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let pump = tokio::spawn(async move {
            while let Some(pdu) = inbound.recv().await {
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                MeshManager { inner }.on_raw_pdu_received(&pdu).await;
            }
            debug!("Inbound PDU stream ended");
        });

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.reassembly_sweep_interval;
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                lock(&inner.reassembly).sweep(Instant::now());
            }
        });

        lock(&self.inner.tasks).extend([pump, sweeper]);
        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner
            .events
            .notify(MeshEvent::ConnectionStateChanged { connected: true });
    }

    /// Close the bearer, abort background tasks and fail everything pending
    pub async fn disconnect(&self) {
        self.inner.bearer.close().await;
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        // Dropping the senders resolves waiters with `Cancelled`
        self.inner.pending.clear();
        self.inner.outgoing.clear();
        lock(&self.inner.provisioning).take();
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            self.inner
                .events
                .notify(MeshEvent::ConnectionStateChanged { connected: false });
        }
    }

    /// Whether the bearer is attached
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Register a local model server
    pub fn register_model(&self, handler: Arc<dyn ModelHandler>) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Number of acknowledged messages waiting for a response
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of inbound segmented messages being reassembled
    pub fn reassembly_count(&self) -> usize {
        lock(&self.inner.reassembly).len()
    }

    /// Primary element address of the local node
    pub async fn local_address(&self) -> Option<u16> {
        self.inner.layer.lock().await.as_ref().map(|l| l.address())
    }

    /// Snapshot of the network with the current sequence number and IV index
    /// written back into the local node
    pub async fn network(&self) -> MeshNetwork {
        let state = self
            .inner
            .layer
            .lock()
            .await
            .as_ref()
            .map(|l| (l.address(), l.sequence(), l.iv_index()));

        let mut network = self.inner.network.write().await;
        if let Some((address, sequence, iv)) = state {
            if let Some(node) = network.node_by_address_mut(address) {
                node.sequence_number = sequence;
            }
            network.iv_index = iv;
        }
        network.clone()
    }

    /// Save the network through the storage port, if one is configured
    pub async fn persist(&self) -> Result<(), MeshError> {
        let store = match &self.inner.store {
            Some(store) => store.clone(),
            None => return Ok(()),
        };
        let snapshot = self.network().await;
        store.save(&snapshot).await?;
        debug!("Persisted network {}", snapshot.id);
        Ok(())
    }

    // ---- Network management ----

    /// Grant a range to this manager's provisioner
    pub async fn allocate_range(
        &self,
        kind: RangeKind,
        range: AllocatedRange,
    ) -> Result<(), MeshError> {
        let provisioner = self.provisioner_id()?;
        self.inner
            .network
            .write()
            .await
            .allocate_range(provisioner, kind, range)?;
        self.persist().await
    }

    /// Create a group at the lowest free address of the provisioner's ranges
    pub async fn create_group(&self, name: impl Into<String>) -> Result<Group, MeshError> {
        let provisioner = self.provisioner_id()?;
        let group = {
            let mut network = self.inner.network.write().await;
            let address = network.next_group_address(provisioner)?;
            let group = Group {
                address,
                name: name.into(),
            };
            network.add_group(group.clone())?;
            group
        };
        info!("Created group {:#06x} ({})", group.address, group.name);
        self.persist().await?;
        Ok(group)
    }

    /// Add an application key and bind it to the local node
    pub async fn import_app_key(
        &self,
        index: u16,
        key: [u8; 16],
        bound_net_key: u16,
    ) -> Result<(), MeshError> {
        let address = self.local_address().await.ok_or(MeshError::NotProvisioned)?;
        {
            let mut network = self.inner.network.write().await;
            network.add_app_key(ApplicationKey {
                index,
                name: format!("Application Key {}", index),
                bound_net_key,
                key: MeshKey::new(key),
            })?;
            if let Some(node) = network.node_by_address_mut(address) {
                if !node.app_keys.contains(&index) {
                    node.app_keys.push(index);
                }
            }
        }
        debug!("Imported application key {}", index);
        self.persist().await
    }

    /// Enter IV update in progress with index + 1
    pub async fn begin_iv_update(&self) -> Result<u32, MeshError> {
        let iv = {
            let mut network = self.inner.network.write().await;
            network.begin_iv_update()?;
            network.iv_index
        };
        self.apply_iv_index(iv).await;
        self.persist().await?;
        Ok(iv.index)
    }

    /// Return to normal IV operation; the sequence number restarts at 0
    pub async fn complete_iv_update(&self) -> Result<(), MeshError> {
        let iv = {
            let mut network = self.inner.network.write().await;
            network.complete_iv_update();
            network.iv_index
        };
        self.apply_iv_index(iv).await;
        self.persist().await
    }

    async fn apply_iv_index(&self, iv: IvIndex) {
        if let Some(layer) = self.inner.layer.lock().await.as_mut() {
            layer.set_iv_index(iv);
        }
    }

    /// Start a key refresh of a network key; both keys are accepted inbound
    pub async fn begin_key_refresh(&self, index: u16, new_key: [u8; 16]) -> Result<(), MeshError> {
        let keys = {
            let mut network = self.inner.network.write().await;
            network
                .net_key_mut(index)
                .ok_or_else(|| MeshError::KeyMismatch(format!("no network key {}", index)))?
                .begin_key_refresh(MeshKey::new(new_key))?;
            network.net_keys.clone()
        };
        if let Some(layer) = self.inner.layer.lock().await.as_mut() {
            layer.update_keys(&keys);
        }
        self.persist().await
    }

    /// Advance the key refresh phase of a network key
    pub async fn advance_key_refresh(&self, index: u16) -> Result<KeyRefreshPhase, MeshError> {
        let (phase, keys) = {
            let mut network = self.inner.network.write().await;
            let phase = network
                .net_key_mut(index)
                .ok_or_else(|| MeshError::KeyMismatch(format!("no network key {}", index)))?
                .advance_key_refresh();
            (phase, network.net_keys.clone())
        };
        if let Some(layer) = self.inner.layer.lock().await.as_mut() {
            layer.update_keys(&keys);
        }
        self.persist().await?;
        Ok(phase)
    }

    fn provisioner_id(&self) -> Result<Uuid, MeshError> {
        self.inner
            .provisioner_id
            .ok_or_else(|| MeshError::Invalid("manager has no provisioner".to_string()))
    }

    // ---- Commands ----

    /// Make `address` the target of group commands
    pub async fn select_group(&self, address: u16) -> Result<(), MeshError> {
        if !Address(address).is_group() {
            return Err(MeshError::Invalid(format!(
                "{:#06x} is not a group address",
                address
            )));
        }
        if self.inner.network.read().await.group(address).is_none() {
            return Err(MeshError::Invalid(format!("unknown group {:#06x}", address)));
        }
        *lock(&self.inner.selected_group) = Some(address);
        self.inner
            .events
            .notify(MeshEvent::GroupSelected { address });
        Ok(())
    }

    /// Group selected with [`select_group`](Self::select_group)
    pub fn selected_group(&self) -> Option<u16> {
        *lock(&self.inner.selected_group)
    }

    /// Send a message without waiting for a response. Completes when the
    /// last PDU reached the bearer (or, when segmented to a unicast
    /// address, when every segment was acknowledged).
    pub async fn send_message(
        &self,
        message: MeshMessage,
        destination: u16,
        key: KeyRef,
    ) -> Result<(), MeshError> {
        let state = MessageState::new(
            message,
            destination,
            key,
            self.inner.config.acknowledged_message_timeout,
        );
        self.transmit(&state).await
    }

    /// Send an acknowledged message and register it in the pending table
    pub async fn send_acknowledged(
        &self,
        message: MeshMessage,
        destination: u16,
        key: KeyRef,
    ) -> Result<PendingResponse, MeshError> {
        let state = MessageState::new(
            message,
            destination,
            key,
            self.inner.config.acknowledged_message_timeout,
        );
        let timeout = match &state {
            MessageState::Acknowledged { timeout, .. } => *timeout,
            MessageState::Unacknowledged { message, .. } => {
                return Err(MeshError::Invalid(format!(
                    "{} expects no response",
                    message.opcode()
                )))
            }
        };

        let id = self.inner.next_exchange.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        // Registered before sending so a fast response is not missed
        self.inner.pending.insert(
            id,
            PendingEntry {
                state: state.clone(),
                tx,
            },
        );
        let pending = PendingResponse {
            id,
            opcode: state.message().opcode(),
            destination,
            timeout,
            rx,
            inner: self.inner.clone(),
        };

        self.transmit(&state).await?;
        trace!("Exchange {} registered", id);
        Ok(pending)
    }

    /// Send an acknowledged message and wait for its response
    pub async fn request(
        &self,
        message: MeshMessage,
        destination: u16,
        key: KeyRef,
    ) -> Result<MeshMessage, MeshError> {
        self.send_acknowledged(message, destination, key)
            .await?
            .wait()
            .await
    }

    /// Stamp a transactional message with the next TID of the local element
    async fn with_next_tid(&self, message: MeshMessage) -> Result<MeshMessage, MeshError> {
        if !message.has_tid() {
            return Ok(message);
        }
        let source = self.local_address().await.ok_or(MeshError::NotProvisioned)?;
        let tid = lock(&self.inner.tids).next(source);
        Ok(message.with_tid(tid))
    }

    /// Generic OnOff Set (acknowledged); returns the Status
    pub async fn send_generic_on_off(
        &self,
        destination: u16,
        app_key_index: u16,
        on: bool,
    ) -> Result<MeshMessage, MeshError> {
        let message = self
            .with_next_tid(MeshMessage::GenericOnOffSet {
                on,
                tid: 0,
                transition: None,
            })
            .await?;
        self.request(message, destination, KeyRef::App(app_key_index))
            .await
    }

    /// Generic OnOff Set Unacknowledged
    pub async fn send_generic_on_off_unacknowledged(
        &self,
        destination: u16,
        app_key_index: u16,
        on: bool,
    ) -> Result<(), MeshError> {
        let message = self
            .with_next_tid(MeshMessage::GenericOnOffSetUnacknowledged {
                on,
                tid: 0,
                transition: None,
            })
            .await?;
        self.send_message(message, destination, KeyRef::App(app_key_index))
            .await
    }

    /// Generic Level Set (acknowledged); returns the Status
    pub async fn send_generic_level(
        &self,
        destination: u16,
        app_key_index: u16,
        level: i16,
    ) -> Result<MeshMessage, MeshError> {
        let message = self
            .with_next_tid(MeshMessage::GenericLevelSet {
                level,
                tid: 0,
                transition: None,
            })
            .await?;
        self.request(message, destination, KeyRef::App(app_key_index))
            .await
    }

    /// Generic Level Set Unacknowledged
    pub async fn send_generic_level_unacknowledged(
        &self,
        destination: u16,
        app_key_index: u16,
        level: i16,
    ) -> Result<(), MeshError> {
        let message = self
            .with_next_tid(MeshMessage::GenericLevelSetUnacknowledged {
                level,
                tid: 0,
                transition: None,
            })
            .await?;
        self.send_message(message, destination, KeyRef::App(app_key_index))
            .await
    }

    // ---- Outbound path ----

    async fn transmit(&self, state: &MessageState) -> Result<(), MeshError> {
        let opcode = state.message().opcode();
        let destination = state.destination();
        match self.transmit_access(state).await {
            Ok(()) => {
                self.inner.events.notify(MeshEvent::MessageSent {
                    opcode,
                    destination,
                });
                Ok(())
            }
            Err(e) => {
                self.inner.events.notify(MeshEvent::MessageFailed {
                    opcode,
                    destination,
                    reason: e.reason(),
                });
                Err(e)
            }
        }
    }

    /// Key bytes, nonce family, AKF and AID for an outbound message
    async fn resolve_key(
        &self,
        key: KeyRef,
        destination: u16,
    ) -> Result<(Zeroizing<[u8; 16]>, NonceKind, bool, u8), MeshError> {
        let (local_address, tx_key_index) = {
            let layer = self.inner.layer.lock().await;
            let layer = layer.as_ref().ok_or(MeshError::NotProvisioned)?;
            (layer.address(), layer.tx_key_index())
        };
        let network = self.inner.network.read().await;

        match key {
            KeyRef::App(index) => {
                let app_key = network.app_key(index).ok_or_else(|| {
                    MeshError::KeyMismatch(format!("unknown application key {}", index))
                })?;
                if app_key.bound_net_key != tx_key_index {
                    return Err(MeshError::KeyMismatch(format!(
                        "application key {} is bound to network key {}, not {}",
                        index, app_key.bound_net_key, tx_key_index
                    )));
                }
                let material = ApplicationKeyMaterial::derive(app_key.key.as_bytes());
                Ok((
                    Zeroizing::new(material.key),
                    NonceKind::Application,
                    true,
                    material.aid,
                ))
            }
            KeyRef::Device => {
                // A remote node's key when we know it, our own otherwise
                let node = network
                    .node_by_address(destination)
                    .filter(|node| !node.has_address(local_address))
                    .or_else(|| network.node_by_address(local_address))
                    .ok_or_else(|| {
                        MeshError::KeyMismatch(format!("no device key for {:#06x}", destination))
                    })?;
                Ok((
                    Zeroizing::new(*node.device_key.as_bytes()),
                    NonceKind::Device,
                    false,
                    0,
                ))
            }
        }
    }

    async fn transmit_access(&self, state: &MessageState) -> Result<(), MeshError> {
        let payload = state.build_payload()?;
        let destination = state.destination();
        let (key, kind, akf, aid) = self.resolve_key(state.key(), destination).await?;
        let ttl = self.inner.config.default_ttl;
        let szmic = upper::choose_szmic(payload.len());

        if !upper::needs_segmentation(payload.len()) {
            self.send_network_pdu(false, destination, ttl, |seq, src, iv_index| {
                let ctx = UpperContext {
                    seq,
                    src,
                    dst: destination,
                    iv_index,
                    szmic: false,
                };
                let upper_pdu = upper::seal(&key, kind, &ctx, &payload)?;
                Ok(LowerTransportPdu::UnsegmentedAccess {
                    akf,
                    aid,
                    upper_pdu,
                }
                .encode()?)
            })
            .await?;
            return Ok(());
        }

        let group = !Address(destination).is_unicast();
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        let mut guard = OutgoingGuard {
            inner: &self.inner,
            key: None,
        };
        let mut send: Option<SegmentedSend> = None;
        let mut rest: Vec<LowerTransportPdu> = Vec::new();

        // The first segment's sequence number is the message's SeqAuth
        self.send_network_pdu(false, destination, ttl, |seq, src, iv_index| {
            let ctx = UpperContext {
                seq,
                src,
                dst: destination,
                iv_index,
                szmic,
            };
            let upper_pdu = upper::seal(&key, kind, &ctx, &payload)?;
            let seq_zero = (seq & 0x1FFF) as u16;
            let segments = Segmenter::new().segment_access(akf, aid, szmic, seq_zero, &upper_pdu)?;

            let mut tracker = SegmentedSend::new(segments, seq_zero, group, ttl, &self.inner.config);
            let mut batch = tracker.pending_segments();
            if batch.is_empty() {
                return Err(MeshError::Invalid("nothing to send".to_string()));
            }
            let first = batch.remove(0).encode()?;
            if !group {
                self.inner.outgoing.insert((destination, seq_zero), ack_tx);
                guard.key = Some((destination, seq_zero));
            }
            rest = batch;
            send = Some(tracker);
            Ok(first)
        })
        .await?;

        let mut send = send.ok_or_else(|| MeshError::Invalid("segmentation failed".to_string()))?;
        for pdu in rest {
            self.send_lower(destination, ttl, &pdu).await?;
        }
        if group {
            debug!(
                seq_zero = send.seq_zero(),
                "Group segmented send complete"
            );
            return Ok(());
        }

        let mut deadline = Instant::now() + send.retransmit_interval();
        loop {
            match timeout_at(deadline, ack_rx.recv()).await {
                Ok(Some(ack)) => {
                    if send.on_ack(&ack) {
                        debug!(seq_zero = send.seq_zero(), "Segmented send acknowledged");
                        return Ok(());
                    }
                    deadline = Instant::now() + send.retransmit_interval();
                }
                Ok(None) => return Err(MeshError::Cancelled),
                Err(_) => match send.on_timeout() {
                    OutgoingState::TimedOut => return Err(MeshError::TransportTimeout),
                    retry => {
                        trace!(?retry, "Resending unacknowledged segments");
                        for pdu in send.pending_segments() {
                            self.send_lower(destination, ttl, &pdu).await?;
                        }
                        deadline = Instant::now() + send.retransmit_interval();
                    }
                },
            }
        }
    }

    async fn send_lower(&self, dst: u16, ttl: u8, pdu: &LowerTransportPdu) -> Result<u32, MeshError> {
        let encoded = pdu.encode()?;
        self.send_network_pdu(pdu.is_control(), dst, ttl, |_, _, _| Ok(encoded))
            .await
    }

    /// Allocate a sequence number, build the transport PDU for it, encode
    /// and write, all under the layer lock. `build` receives (seq, src, IV index).
    async fn send_network_pdu<F>(
        &self,
        ctl: bool,
        dst: u16,
        ttl: u8,
        build: F,
    ) -> Result<u32, MeshError>
    where
        F: FnOnce(u32, u16, u32) -> Result<Bytes, MeshError>,
    {
        let mut guard = self.inner.layer.lock().await;
        let layer = guard.as_mut().ok_or(MeshError::NotProvisioned)?;
        let seq = layer.next_sequence()?;
        let src = layer.address();
        let iv_index = layer.iv_index().transmit_index();
        let transport_pdu = build(seq, src, iv_index)?;
        let raw = layer.encode(&NetworkPdu {
            ctl,
            ttl,
            seq,
            src,
            dst,
            transport_pdu,
        })?;
        self.write_proxy(ProxyPduType::Network, &raw).await?;
        Ok(seq)
    }

    async fn write_proxy(&self, pdu_type: ProxyPduType, data: &[u8]) -> Result<(), MeshError> {
        let pieces = proxy::segment(pdu_type, data, self.inner.bearer.mtu_size())?;
        for piece in pieces {
            self.inner.bearer.send_raw_pdu(piece).await?;
        }
        Ok(())
    }

    async fn send_provisioning(&self, pdu: &ProvisioningPdu) -> Result<(), MeshError> {
        trace!("Sending provisioning {:?}", pdu.pdu_type());
        self.write_proxy(ProxyPduType::Provisioning, &pdu.encode())
            .await
    }

    // ---- Inbound path ----

    /// Feed one proxy PDU from the bearer
    pub async fn on_raw_pdu_received(&self, raw: &[u8]) {
        let message = match lock(&self.inner.proxy_rx).push(raw) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(e) => {
                debug!("Dropping proxy PDU: {}", e);
                return;
            }
        };

        match message {
            (ProxyPduType::Network, pdu) => self.handle_network_pdu(&pdu).await,
            (ProxyPduType::Provisioning, pdu) => self.handle_provisioning_pdu(pdu).await,
            (ProxyPduType::Beacon, _) => trace!("Ignoring mesh beacon"),
            (ProxyPduType::ProxyConfiguration, _) => trace!("Ignoring proxy configuration"),
        }
    }

    async fn handle_network_pdu(&self, raw: &[u8]) {
        let received = match self.inner.layer.lock().await.as_mut() {
            Some(layer) => layer.decode(raw),
            None => {
                trace!("Dropping network PDU before provisioning");
                return;
            }
        };
        let ReceivedPdu {
            net_key_index,
            iv_index,
            pdu,
        } = match received {
            Some(received) => received,
            None => return,
        };

        if !self.is_local_destination(pdu.dst).await {
            trace!(dst = pdu.dst, "Dropping PDU for another node");
            return;
        }

        let lower = match LowerTransportPdu::decode(pdu.ctl, &pdu.transport_pdu) {
            Ok(lower) => lower,
            Err(e) => {
                debug!(src = pdu.src, "Dropping malformed transport PDU: {}", e);
                return;
            }
        };

        match lower {
            LowerTransportPdu::UnsegmentedAccess {
                akf,
                aid,
                upper_pdu,
            } => {
                self.deliver_upper(UpperPdu {
                    akf,
                    aid,
                    szmic: false,
                    seq: pdu.seq,
                    iv_index,
                    src: pdu.src,
                    dst: pdu.dst,
                    net_key_index,
                    upper_pdu,
                })
                .await
            }
            LowerTransportPdu::SegmentedAccess {
                akf,
                aid,
                info,
                segment,
            } => {
                let outcome = lock(&self.inner.reassembly).insert(
                    IncomingSegment {
                        src: pdu.src,
                        seq: pdu.seq,
                        iv_index,
                        akf,
                        aid,
                        info,
                        segment,
                    },
                    Instant::now(),
                );
                let unicast = Address(pdu.dst).is_unicast();
                match outcome {
                    SegmentOutcome::Complete(message) => {
                        if unicast {
                            self.send_ack(pdu.src, info.seq_zero, message.block_ack)
                                .await;
                        }
                        self.deliver_upper(UpperPdu {
                            akf: message.akf,
                            aid: message.aid,
                            szmic: message.szmic,
                            seq: message.seq_origin(),
                            iv_index: message.iv_index(),
                            src: pdu.src,
                            dst: pdu.dst,
                            net_key_index,
                            upper_pdu: message.upper_pdu,
                        })
                        .await
                    }
                    SegmentOutcome::Duplicate { block_ack } => {
                        if unicast {
                            self.send_ack(pdu.src, info.seq_zero, block_ack).await;
                        }
                    }
                    SegmentOutcome::Incomplete | SegmentOutcome::Rejected => {}
                }
            }
            LowerTransportPdu::SegmentAck(ack) => {
                match self.inner.outgoing.get(&(pdu.src, ack.seq_zero)) {
                    Some(tx) => {
                        let _ = tx.send(ack);
                    }
                    None => trace!(src = pdu.src, seq_zero = ack.seq_zero, "Stray segment ack"),
                }
            }
            LowerTransportPdu::UnsegmentedControl { opcode, .. }
            | LowerTransportPdu::SegmentedControl { opcode, .. } => {
                debug!(opcode, "Ignoring transport control message");
            }
        }
    }

    async fn is_local_destination(&self, dst: u16) -> bool {
        let address = Address(dst);
        if !address.is_unicast() {
            return address.is_valid_destination();
        }
        let local = match self.local_address().await {
            Some(local) => local,
            None => return false,
        };
        let network = self.inner.network.read().await;
        match network.node_by_address(local) {
            Some(node) => node.has_address(dst),
            None => dst == local,
        }
    }

    async fn send_ack(&self, dst: u16, seq_zero: u16, block_ack: u32) {
        let ack = LowerTransportPdu::SegmentAck(SegmentAck {
            obo: false,
            seq_zero,
            block_ack,
        });
        if let Err(e) = self
            .send_lower(dst, self.inner.config.default_ttl, &ack)
            .await
        {
            warn!("Failed to acknowledge segments of {:#06x}: {}", dst, e);
        }
    }

    /// Keys that may have sealed `pdu`, with the reference to reply under
    async fn candidate_keys(&self, pdu: &UpperPdu) -> Vec<(Zeroizing<[u8; 16]>, NonceKind, KeyRef)> {
        let local = self.local_address().await;
        let network = self.inner.network.read().await;

        if pdu.akf {
            return network
                .app_keys
                .iter()
                .filter(|k| k.bound_net_key == pdu.net_key_index)
                .map(|k| (k, ApplicationKeyMaterial::derive(k.key.as_bytes())))
                .filter(|(_, material)| material.aid == pdu.aid)
                .map(|(k, material)| {
                    (
                        Zeroizing::new(material.key),
                        NonceKind::Application,
                        KeyRef::App(k.index),
                    )
                })
                .collect();
        }

        let mut keys = Vec::new();
        for address in [local, Some(pdu.src)].into_iter().flatten() {
            if let Some(node) = network.node_by_address(address) {
                keys.push((
                    Zeroizing::new(*node.device_key.as_bytes()),
                    NonceKind::Device,
                    KeyRef::Device,
                ));
            }
        }
        keys
    }

    async fn deliver_upper(&self, pdu: UpperPdu) {
        let ctx = UpperContext {
            seq: pdu.seq,
            src: pdu.src,
            dst: pdu.dst,
            iv_index: pdu.iv_index,
            szmic: pdu.szmic,
        };
        let opened = self
            .candidate_keys(&pdu)
            .await
            .into_iter()
            .find_map(|(key, kind, key_ref)| {
                upper::open(&key, kind, &ctx, &pdu.upper_pdu)
                    .ok()
                    .map(|payload| (payload, key_ref))
            });
        let (payload, key_ref) = match opened {
            Some(opened) => opened,
            None => {
                trace!(src = pdu.src, akf = pdu.akf, "No key opens upper transport PDU");
                return;
            }
        };

        let message = match MeshMessage::decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                debug!(src = pdu.src, "Dropping access message: {}", e);
                return;
            }
        };
        self.dispatch(pdu.src, pdu.dst, key_ref, message);
    }

    fn dispatch(&self, source: u16, destination: u16, key: KeyRef, message: MeshMessage) {
        let opcode = message.opcode();
        let matched = self
            .inner
            .pending
            .iter()
            .find(|entry| {
                entry
                    .value()
                    .state
                    .matches(opcode, source, destination, key)
            })
            .map(|entry| *entry.key());
        if let Some((id, entry)) = matched.and_then(|id| self.inner.pending.remove(&id)) {
            debug!("Exchange {} answered by {:#06x}", id, source);
            let _ = entry.tx.send(message.clone());
            self.inner.events.notify(MeshEvent::MessageReceived { source, message });
            return;
        }

        self.inner.events.notify(MeshEvent::UnsolicitedMessage {
            source,
            destination,
            message: message.clone(),
        });

        let handlers: Vec<Arc<dyn ModelHandler>> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| h.opcodes().contains(&opcode))
            .cloned()
            .collect();
        for handler in handlers {
            if let Some(reply) = handler.handle(source, destination, &message) {
                // Replies may need acknowledgments delivered by this very task
                let manager = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.send_message(reply, source, key).await {
                        warn!("Model reply to {:#06x} failed: {}", source, e);
                    }
                });
            }
        }
    }

    // ---- Provisioning ----

    /// Provision the device `device` over this bearer and add it as a node
    pub async fn provision(
        &self,
        device: Uuid,
        params: ProvisioningParams,
    ) -> Result<Node, MeshError> {
        let provisioner = self.provisioner_id()?;
        let mut rx = {
            let mut slot = lock(&self.inner.provisioning);
            if slot.is_some() {
                return Err(MeshError::SessionBusy);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *slot = Some(ProvisioningLink { device, tx });
            rx
        };
        let _guard = ProvisioningGuard {
            inner: &self.inner,
            device,
        };

        info!("Provisioning device {}", device);
        let result = self
            .run_provisioning(device, provisioner, params, &mut rx)
            .await;
        match &result {
            Ok(node) => self.inner.events.notify(MeshEvent::NodeProvisioned {
                uuid: node.uuid,
                unicast_address: node.unicast_address,
                element_count: node.element_count,
            }),
            Err(e) => self.inner.events.notify(MeshEvent::ProvisioningFailed {
                uuid: device,
                reason: e.reason(),
            }),
        }
        result
    }

    /// Abort the running provisioning session, if any
    pub fn cancel_provisioning(&self) -> bool {
        let link = lock(&self.inner.provisioning).take();
        match link {
            Some(link) => {
                info!("Cancelling provisioning of {}", link.device);
                true
            }
            None => false,
        }
    }

    async fn run_provisioning(
        &self,
        device: Uuid,
        provisioner: Uuid,
        params: ProvisioningParams,
        rx: &mut mpsc::UnboundedReceiver<Bytes>,
    ) -> Result<Node, MeshError> {
        let mut session = ProvisioningSession::new(device, params);
        let invite = session.invite()?;
        self.send_provisioning(&invite).await?;

        loop {
            let raw = match timeout(self.inner.config.provisioning_timeout, rx.recv()).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    session.abort(ProvisioningError::InvalidState("cancelled"));
                    return Err(MeshError::Cancelled);
                }
                Err(_) => {
                    session.abort(ProvisioningError::InvalidState("timed out"));
                    warn!(
                        "Provisioning of {} timed out in state {:?}",
                        device,
                        session.state()
                    );
                    return Err(MeshError::TransportTimeout);
                }
            };

            match session.handle(&raw)? {
                Step::Send(pdus) => {
                    for pdu in &pdus {
                        self.send_provisioning(pdu).await?;
                    }
                }
                Step::CapabilitiesReceived(caps) => {
                    let data = match self.reserve(device, provisioner, caps.element_count).await {
                        Ok(data) => data,
                        Err(e) => {
                            session.abort(ProvisioningError::InvalidState("no address"));
                            return Err(e);
                        }
                    };
                    for pdu in &session.start_exchange(data)? {
                        self.send_provisioning(pdu).await?;
                    }
                }
                Step::Complete => break,
            }
        }

        let data = session
            .provisioning_data()
            .cloned()
            .ok_or_else(|| MeshError::Invalid("no provisioning data".to_string()))?;
        let device_key = session
            .device_key()
            .ok_or_else(|| MeshError::Invalid("no device key".to_string()))?;
        let element_count = session.capabilities().map_or(1, |c| c.element_count);

        let node = Node::new(
            device,
            format!("Node {:#06x}", data.unicast_address),
            data.unicast_address,
            element_count,
            MeshKey::new(device_key),
        );
        {
            let mut network = self.inner.network.write().await;
            self.inner.reservations.remove(&device);
            network.add_node(node.clone())?;
        }
        self.persist().await?;
        Ok(node)
    }

    /// Reserve addresses for a device under the network write lock
    async fn reserve(
        &self,
        device: Uuid,
        provisioner: Uuid,
        element_count: u8,
    ) -> Result<ProvisioningData, MeshError> {
        let network = self.inner.network.write().await;
        let reserved: Vec<AllocatedRange> = self
            .inner
            .reservations
            .iter()
            .map(|entry| *entry.value())
            .collect();
        let address = network.next_unicast_address(provisioner, element_count, &reserved)?;
        let range = AllocatedRange {
            low: address,
            high: address + element_count as u16 - 1,
        };
        self.inner.reservations.insert(device, range);
        debug!("Reserved {} for device {}", range, device);

        let key = network.primary_net_key().ok_or(MeshError::NotProvisioned)?;
        let mut flags = 0;
        // The flag signals phase 2; a phase 1 device gets the old key
        if key.phase == KeyRefreshPhase::Finalizing {
            flags |= ProvisioningData::FLAG_KEY_REFRESH;
        }
        if network.iv_index.update_active {
            flags |= ProvisioningData::FLAG_IV_UPDATE;
        }
        Ok(ProvisioningData {
            net_key: *key.transmit_key().as_bytes(),
            key_index: key.index,
            flags,
            iv_index: network.iv_index.index,
            unicast_address: address,
        })
    }

    /// Let an unprovisioned device answer provisioners on this bearer
    pub fn accept_provisioning(&self, provisionee: Provisionee) -> Result<(), MeshError> {
        let mut slot = lock(&self.inner.provisionee);
        if slot.is_some() {
            return Err(MeshError::SessionBusy);
        }
        *slot = Some(provisionee);
        Ok(())
    }

    async fn handle_provisioning_pdu(&self, pdu: Bytes) {
        // Provisioner role: hand the PDU to the running session
        let link = lock(&self.inner.provisioning)
            .as_ref()
            .map(|link| link.tx.clone());
        if let Some(tx) = link {
            let _ = tx.send(pdu);
            return;
        }

        // Device role
        let (replies, done) = {
            let mut slot = lock(&self.inner.provisionee);
            let device = match slot.as_mut() {
                Some(device) => device,
                None => {
                    trace!("Ignoring provisioning PDU without a session");
                    return;
                }
            };
            let replies = device.handle(&pdu);
            let done = match device.state() {
                ProvisioneeState::Complete => device.result().cloned().map(|result| {
                    (device.uuid(), result, device.capabilities().element_count)
                }),
                _ => None,
            };
            if done.is_some() || matches!(device.state(), ProvisioneeState::Failed(_)) {
                slot.take();
            }
            (replies, done)
        };

        // Join the network before the provisioner learns about it
        if let Some((uuid, result, element_count)) = done {
            if let Err(e) = self.install(uuid, result, element_count).await {
                warn!("Failed to install provisioning data: {}", e);
            }
        }
        for reply in &replies {
            if let Err(e) = self.send_provisioning(reply).await {
                warn!("Failed to send provisioning reply: {}", e);
            }
        }
    }

    async fn install(
        &self,
        uuid: Uuid,
        result: ProvisionedDevice,
        element_count: u8,
    ) -> Result<(), MeshError> {
        let data = &result.data;
        let iv = IvIndex {
            index: data.iv_index,
            update_active: data.flags & ProvisioningData::FLAG_IV_UPDATE != 0,
        };
        {
            let mut network = self.inner.network.write().await;
            network.net_keys = vec![NetworkKey::new(
                data.key_index,
                "Network Key",
                MeshKey::new(data.net_key),
            )];
            network.iv_index = iv;
            network.nodes.retain(|n| n.uuid != uuid);
            let mut node = Node::new(
                uuid,
                "Local Node",
                data.unicast_address,
                element_count,
                MeshKey::new(result.device_key()),
            );
            node.net_keys = vec![data.key_index];
            network.add_node(node)?;

            let layer = NetworkLayer::new(
                data.unicast_address,
                0,
                iv,
                data.key_index,
                &network.net_keys,
            )?;
            *self.inner.layer.lock().await = Some(layer);
        }

        info!(
            "Joined network as {:#06x} (IV index {})",
            data.unicast_address, data.iv_index
        );
        self.inner.events.notify(MeshEvent::NodeProvisioned {
            uuid,
            unicast_address: data.unicast_address,
            element_count,
        });
        self.persist().await
    }
}
