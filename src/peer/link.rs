// ABOUTME: Per-peer control link: state machine, heartbeat, timing probes, RPC
// ABOUTME: Transport-agnostic; the concrete channel hides behind PeerTransport

use crate::config::{INIT_PROBE_COUNT, INIT_PROBE_SPACING, PROBE_INTERVAL};
use crate::error::Error;
use crate::peer::manager::Notice;
use crate::peer::messages::{ControlMessage, PeerDescriptor, RpcEnvelope};
use crate::time::{Clock, TimeSyncEvent, Timekeeper};
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lifecycle of a peer. Transitions are forward-only; `Deleted` is
/// terminal and a reconnecting peer always gets a fresh [`Peer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    /// Link is up, identity not yet exchanged.
    Connecting,
    /// Identity exchanged; timing probes are flowing.
    Connected,
    /// Torn down. Terminal.
    Deleted,
}

/// How a peer is being torn down.
#[derive(Debug, Clone, Copy, Default)]
pub struct DestroyOptions {
    /// The failure looks transient; callers may attempt a reconnect.
    pub can_try_reconnect: bool,
    /// Send a graceful `disconnect` notice before closing the transport.
    pub advertise_destroy: bool,
}

/// Events a single peer publishes to its observers.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The state machine advanced.
    StateChanged(PeerState),
    /// The peer refreshed its replicated-state blob.
    SharedState(Value),
    /// The peer reached `Deleted`.
    Destroyed {
        /// Transient failure; a reconnect may succeed.
        can_try_reconnect: bool,
    },
}

/// Capability interface over the concrete message channel.
///
/// The channel itself (WebSocket, WebRTC data channel, in-process loopback)
/// is owned by an external collaborator; the link only needs ordered,
/// reliable delivery while connected.
pub trait PeerTransport: Send + Sync + 'static {
    /// Enqueue a message for delivery. Must not block.
    fn send(&self, message: ControlMessage) -> Result<(), Error>;
    /// Tear the channel down.
    fn close(&self);
}

/// Transport of the local peer: nothing to send, nothing to close.
struct NullTransport;

impl PeerTransport for NullTransport {
    fn send(&self, _message: ControlMessage) -> Result<(), Error> {
        Ok(())
    }
    fn close(&self) {}
}

type RpcHandler = Box<dyn Fn(Value) -> Result<Value, Error> + Send + Sync>;
type PendingRpc = oneshot::Sender<Result<Value, Error>>;

pub(crate) struct PeerInner {
    descriptor: RwLock<PeerDescriptor>,
    is_local: bool,
    clock: Clock,
    no_response_timeout: Duration,
    transport: Box<dyn PeerTransport>,
    state_tx: watch::Sender<PeerState>,
    events: broadcast::Sender<PeerEvent>,
    timekeeper: Timekeeper,
    pending: Mutex<HashMap<String, PendingRpc>>,
    handlers: RwLock<HashMap<String, RpcHandler>>,
    // Heartbeat deadline; every inbound message pushes it forward.
    deadline_tx: watch::Sender<tokio::time::Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    notices: Option<mpsc::UnboundedSender<Notice>>,
}

/// Handle to one peer of the mesh. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Create the distinguished local peer: always `Connected`, clock delta
    /// 0 by construction, never probed.
    pub fn new_local(descriptor: PeerDescriptor, clock: Clock) -> Self {
        Self::build(descriptor, Box::new(NullTransport), clock, true, None, Duration::MAX)
    }

    pub(crate) fn new_remote(
        descriptor: PeerDescriptor,
        transport: Box<dyn PeerTransport>,
        clock: Clock,
        no_response_timeout: Duration,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> Self {
        Self::build(
            descriptor,
            transport,
            clock,
            false,
            Some(notices),
            no_response_timeout,
        )
    }

    fn build(
        descriptor: PeerDescriptor,
        transport: Box<dyn PeerTransport>,
        clock: Clock,
        is_local: bool,
        notices: Option<mpsc::UnboundedSender<Notice>>,
        no_response_timeout: Duration,
    ) -> Self {
        let initial = if is_local {
            PeerState::Connected
        } else {
            PeerState::Connecting
        };
        let (state_tx, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(64);
        let deadline = tokio::time::Instant::now()
            .checked_add(no_response_timeout)
            .unwrap_or_else(tokio::time::Instant::now);
        let (deadline_tx, _) = watch::channel(deadline);
        Self {
            inner: Arc::new(PeerInner {
                descriptor: RwLock::new(descriptor),
                is_local,
                clock,
                no_response_timeout,
                transport,
                state_tx,
                events,
                timekeeper: Timekeeper::new(clock),
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                deadline_tx,
                tasks: Mutex::new(Vec::new()),
                notices,
            }),
        }
    }

    /// Start the link's background work: message loop, heartbeat watchdog,
    /// and the steady timing-probe cadence.
    pub(crate) fn spawn_link(&self, inbound: mpsc::UnboundedReceiver<ControlMessage>) {
        debug_assert!(!self.inner.is_local, "local peer has no link to run");
        self.touch();
        let mut tasks = self.inner.tasks.lock();
        tasks.push(tokio::spawn(run_link(self.clone(), inbound)));
        tasks.push(tokio::spawn(run_probes(self.clone())));
    }

    /// Snapshot of the descriptor.
    pub fn descriptor(&self) -> PeerDescriptor {
        self.inner.descriptor.read().clone()
    }

    /// Stable identity.
    pub fn uuid(&self) -> Uuid {
        self.inner.descriptor.read().uuid
    }

    /// Per-process identity.
    pub fn instance_uuid(&self) -> Uuid {
        self.inner.descriptor.read().instance_uuid
    }

    /// True for the peer representing this process.
    pub fn is_local(&self) -> bool {
        self.inner.is_local
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to peer events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    /// The clock-offset estimator for this peer.
    pub fn timekeeper(&self) -> &Timekeeper {
        &self.inner.timekeeper
    }

    /// Subscribe to time-sync events.
    pub fn subscribe_time_sync(&self) -> broadcast::Receiver<TimeSyncEvent> {
        self.inner.timekeeper.subscribe()
    }

    /// This peer's clock estimate in ms. For the local peer this is plain
    /// local time; for remotes the committed delta is applied, or the live
    /// window median when `precise` is set.
    pub fn current_time(&self, precise: bool) -> f64 {
        if self.inner.is_local {
            self.inner.clock.now()
        } else {
            self.inner.timekeeper.current_time(precise)
        }
    }

    /// True for the local peer, and for remotes once the initial probe
    /// burst has been digested.
    pub fn is_time_synchronized(&self) -> bool {
        self.inner.is_local || self.inner.timekeeper.is_synchronized()
    }

    /// Resolve once [`Self::is_time_synchronized`] holds.
    pub async fn wait_for_first_time_sync(&self) {
        if self.inner.is_local {
            return;
        }
        self.inner.timekeeper.wait_for_first_sync().await;
    }

    /// Resolve once the peer reaches `Connected`. Fails if it is deleted
    /// first.
    pub async fn wait_for_connected(&self) -> Result<(), Error> {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                PeerState::Connected => return Ok(()),
                PeerState::Deleted => return Err(Error::LinkClosed),
                PeerState::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::LinkClosed);
            }
        }
    }

    /// Send a control message over the transport.
    pub fn send(&self, message: ControlMessage) -> Result<(), Error> {
        self.inner.transport.send(message)
    }

    /// Register the handler invoked for inbound calls of `rpc_type`.
    /// Replaces any previous handler for the same type.
    pub fn register_rpc_handler<F>(&self, rpc_type: &str, handler: F)
    where
        F: Fn(Value) -> Result<Value, Error> + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .insert(rpc_type.to_string(), Box::new(handler));
    }

    /// Issue a correlated call and await the peer's response.
    ///
    /// There is no built-in timeout; wrap with `tokio::time::timeout` where
    /// one is needed. If the link dies first the call fails with
    /// [`Error::LinkClosed`].
    pub async fn send_rpc(&self, rpc_type: &str, body: Value) -> Result<Value, Error> {
        let uuid = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(uuid.clone(), tx);

        let envelope = RpcEnvelope {
            uuid: uuid.clone(),
            rpc_type: rpc_type.to_string(),
            is_response: false,
            is_error: false,
            body,
        };
        if let Err(err) = self.send(ControlMessage::Rpc(envelope)) {
            self.inner.pending.lock().remove(&uuid);
            return Err(err);
        }

        rx.await.map_err(|_| Error::LinkClosed)?
    }

    /// Tear the peer down. Idempotent; the first call wins.
    pub fn destroy(&self, options: DestroyOptions) {
        if !self.advance_state(PeerState::Deleted) {
            return;
        }
        debug!(
            "destroying peer {} (reconnect={})",
            self.inner.descriptor.read().name,
            options.can_try_reconnect
        );

        // Leaving Connected invalidates accumulated timing samples.
        self.inner.timekeeper.flush();

        if options.advertise_destroy {
            let _ = self.send(ControlMessage::Disconnect);
        }
        self.inner.transport.close();

        // In-flight calls resolve with LinkClosed as their slots drop.
        self.inner.pending.lock().clear();
        self.inner.handlers.write().clear();

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        let _ = self.inner.events.send(PeerEvent::Destroyed {
            can_try_reconnect: options.can_try_reconnect,
        });
        self.notify(Notice::Destroyed {
            peer: self.clone(),
            can_try_reconnect: options.can_try_reconnect,
        });
    }

    /// True when both handles refer to the same underlying link.
    pub fn same_link(&self, other: &Peer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn replace_descriptor(&self, descriptor: PeerDescriptor) {
        *self.inner.descriptor.write() = descriptor;
    }

    /// Promote to `Connected` after identity exchange; fires the initial
    /// probe burst.
    pub(crate) fn promote_connected(&self) {
        if !self.advance_state(PeerState::Connected) {
            return;
        }
        if !self.inner.is_local {
            let burst = tokio::spawn(run_probe_burst(self.clone()));
            self.inner.tasks.lock().push(burst);
        }
    }

    /// Forward-only transition; returns false when already at or past the
    /// target state.
    fn advance_state(&self, target: PeerState) -> bool {
        let mut advanced = false;
        self.inner.state_tx.send_if_modified(|state| {
            if *state < target {
                *state = target;
                advanced = true;
                true
            } else {
                false
            }
        });
        if advanced {
            // Observers hear about it on their next scheduling tick, which
            // keeps ordering identical for startup-time and late peers.
            let _ = self.inner.events.send(PeerEvent::StateChanged(target));
            self.notify(Notice::StateChanged { peer: self.clone() });
        }
        advanced
    }

    fn notify(&self, notice: Notice) {
        if let Some(tx) = &self.inner.notices {
            let _ = tx.send(notice);
        }
    }

    /// Push the heartbeat deadline forward.
    fn touch(&self) {
        if self.inner.no_response_timeout == Duration::MAX {
            return;
        }
        let deadline = tokio::time::Instant::now() + self.inner.no_response_timeout;
        self.inner.deadline_tx.send_replace(deadline);
    }

    /// Resolve when the heartbeat deadline passes without being pushed.
    async fn heartbeat_expired(&self) {
        let mut rx = self.inner.deadline_tx.subscribe();
        loop {
            let deadline = *rx.borrow_and_update();
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    if *rx.borrow() <= tokio::time::Instant::now() {
                        return;
                    }
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Sender gone: peer is being torn down elsewhere.
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }

    fn handle_message(&self, message: ControlMessage) {
        match message {
            ControlMessage::TimekeepRequest { sent_at } => {
                let response = ControlMessage::TimekeepResponse {
                    sent_at,
                    responded_at: self.inner.clock.now(),
                };
                if let Err(err) = self.send(response) {
                    warn!("failed to reflect timing probe: {err}");
                }
            }
            ControlMessage::TimekeepResponse {
                sent_at,
                responded_at,
            } => {
                self.inner.timekeeper.handle_response(sent_at, responded_at);
            }
            ControlMessage::PeerInfo { peer, shared_state } => {
                self.notify(Notice::PeerInfo {
                    link: self.clone(),
                    descriptor: peer,
                });
                if let Some(state) = shared_state {
                    let _ = self.inner.events.send(PeerEvent::SharedState(state));
                }
            }
            ControlMessage::Disconnect => {
                self.destroy(DestroyOptions {
                    can_try_reconnect: false,
                    advertise_destroy: false,
                });
            }
            ControlMessage::Rpc(envelope) => {
                if envelope.is_response {
                    self.resolve_rpc(envelope);
                } else {
                    self.dispatch_rpc(envelope);
                }
            }
        }
    }

    fn dispatch_rpc(&self, envelope: RpcEnvelope) {
        let result = {
            let handlers = self.inner.handlers.read();
            match handlers.get(&envelope.rpc_type) {
                Some(handler) => handler(envelope.body),
                None => Err(Error::UnknownRpcType(envelope.rpc_type.clone())),
            }
        };
        let response = match result {
            Ok(body) => RpcEnvelope {
                uuid: envelope.uuid,
                rpc_type: envelope.rpc_type,
                is_response: true,
                is_error: false,
                body,
            },
            Err(err) => RpcEnvelope {
                uuid: envelope.uuid,
                rpc_type: envelope.rpc_type,
                is_response: true,
                is_error: true,
                body: Value::String(err.to_string()),
            },
        };
        if let Err(err) = self.send(ControlMessage::Rpc(response)) {
            warn!("failed to answer call: {err}");
        }
    }

    fn resolve_rpc(&self, envelope: RpcEnvelope) {
        let slot = self.inner.pending.lock().remove(&envelope.uuid);
        match slot {
            Some(tx) => {
                let outcome = if envelope.is_error {
                    let text = envelope
                        .body
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| envelope.body.to_string());
                    Err(Error::Rpc(text))
                } else {
                    Ok(envelope.body)
                };
                let _ = tx.send(outcome);
            }
            // Response to a call we no longer track. Dropped on purpose.
            None => trace!("dropping response for unknown call {}", envelope.uuid),
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("uuid", &self.uuid())
            .field("state", &self.state())
            .field("local", &self.is_local())
            .finish()
    }
}

/// Message loop of a remote link: inbound dispatch plus the heartbeat
/// watchdog. Exits when the peer is deleted.
async fn run_link(peer: Peer, mut inbound: mpsc::UnboundedReceiver<ControlMessage>) {
    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => {
                    peer.touch();
                    peer.handle_message(message);
                    if peer.state() == PeerState::Deleted {
                        return;
                    }
                }
                None => {
                    // Transport dropped the channel under us.
                    peer.destroy(DestroyOptions {
                        can_try_reconnect: true,
                        advertise_destroy: false,
                    });
                    return;
                }
            },
            _ = peer.heartbeat_expired() => {
                warn!("peer {} went silent, tearing down", peer.descriptor().name);
                peer.destroy(DestroyOptions {
                    can_try_reconnect: true,
                    advertise_destroy: false,
                });
                return;
            }
        }
    }
}

/// Steady timing-probe cadence, active for the whole life of the link.
async fn run_probes(peer: Peer) {
    let mut interval = tokio::time::interval(PROBE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if peer.state() == PeerState::Deleted {
            return;
        }
        let probe = ControlMessage::TimekeepRequest {
            sent_at: peer.inner.clock.now(),
        };
        if peer.send(probe).is_err() {
            peer.destroy(DestroyOptions {
                can_try_reconnect: true,
                advertise_destroy: false,
            });
            return;
        }
    }
}

/// Burst fired on `Connecting -> Connected` to fill the delta window fast.
async fn run_probe_burst(peer: Peer) {
    for _ in 0..INIT_PROBE_COUNT {
        let probe = ControlMessage::TimekeepRequest {
            sent_at: peer.inner.clock.now(),
        };
        if peer.send(probe).is_err() {
            return;
        }
        tokio::time::sleep(INIT_PROBE_SPACING).await;
    }
}
