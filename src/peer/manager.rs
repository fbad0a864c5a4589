// ABOUTME: Registry of peers keyed by stable uuid, with lifecycle events
// ABOUTME: Resolves duplicate connections and process restarts on peerInfo

use crate::context::Context;
use crate::peer::link::{DestroyOptions, Peer, PeerState, PeerTransport};
use crate::peer::messages::{ControlMessage, PeerDescriptor};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Internal notifications flowing from peers into the registry task.
#[derive(Debug)]
pub(crate) enum Notice {
    /// The peer's state machine advanced.
    StateChanged {
        /// The peer that moved.
        peer: Peer,
    },
    /// The peer reached `Deleted`.
    Destroyed {
        /// The peer that was torn down.
        peer: Peer,
        /// Whether a reconnect may succeed.
        can_try_reconnect: bool,
    },
    /// A `peerInfo` arrived on the given link.
    PeerInfo {
        /// The link the message arrived on.
        link: Peer,
        /// The descriptor it carried.
        descriptor: PeerDescriptor,
    },
}

/// Registry-level events.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// Some peer changed state.
    PeerChanged(Peer),
    /// A peer reached `Connected`.
    PeerConnected(Peer),
    /// A stable uuid reached `Connected` for the first time this process.
    NewPeerConnected(Peer),
    /// A peer was removed from the registry.
    PeerDeleted {
        /// Stable uuid of the departed peer.
        uuid: Uuid,
        /// Whether callers may try reconnecting.
        can_try_reconnect: bool,
    },
}

struct ManagerInner {
    context: Context,
    local: Peer,
    peers: RwLock<HashMap<Uuid, Peer>>,
    ever_connected: Mutex<HashSet<Uuid>>,
    events: broadcast::Sender<ManagerEvent>,
    notices: mpsc::UnboundedSender<Notice>,
}

/// Arena of peers for one process.
///
/// Peers are looked up by stable uuid; bindings and sinks hold uuids, never
/// owning references, so teardown is a slot clear plus failed lookups. One
/// stable uuid maps to at most one live peer (see `peerInfo` resolution).
#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<ManagerInner>,
}

impl PeerManager {
    /// Create a manager. The local peer is registered immediately and is
    /// always `Connected`.
    pub fn new(context: Context) -> Self {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let local = Peer::new_local(context.local_descriptor(), context.clock());

        let inner = Arc::new(ManagerInner {
            context,
            local: local.clone(),
            peers: RwLock::new(HashMap::new()),
            ever_connected: Mutex::new(HashSet::new()),
            events,
            notices,
        });
        inner
            .peers
            .write()
            .insert(local.uuid(), local.clone());
        inner.ever_connected.lock().insert(local.uuid());

        let manager = Self { inner };
        tokio::spawn(run_registry(manager.clone(), notice_rx));
        manager
    }

    /// The peer representing this process.
    pub fn local_peer(&self) -> Peer {
        self.inner.local.clone()
    }

    /// Subscribe to registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Look a peer up by stable uuid.
    pub fn get(&self, uuid: Uuid) -> Option<Peer> {
        self.inner.peers.read().get(&uuid).cloned()
    }

    /// All peers currently in `Connected`.
    pub fn connected_peers(&self) -> Vec<Peer> {
        self.inner
            .peers
            .read()
            .values()
            .filter(|peer| peer.state() == PeerState::Connected)
            .cloned()
            .collect()
    }

    /// Number of registered peers, the local one included.
    pub fn len(&self) -> usize {
        self.inner.peers.read().len()
    }

    /// Never true: the local peer is always registered.
    pub fn is_empty(&self) -> bool {
        self.inner.peers.read().is_empty()
    }

    /// Adopt a freshly established link.
    ///
    /// `descriptor` is the provisional identity from the rendezvous
    /// exchange; it is replaced by the first `peerInfo`. The link starts in
    /// `Connecting`, gets its heartbeat and probe tasks, and our own
    /// `peerInfo` is sent as the opening handshake move.
    pub fn adopt_link(
        &self,
        descriptor: PeerDescriptor,
        transport: Box<dyn PeerTransport>,
        inbound: mpsc::UnboundedReceiver<ControlMessage>,
    ) -> Result<Peer, crate::error::Error> {
        let peer = Peer::new_remote(
            descriptor,
            transport,
            self.inner.context.clock(),
            self.inner.context.config().no_response_timeout,
            self.inner.notices.clone(),
        );
        // Not registered yet: the arena slot is claimed when the first
        // peerInfo proves the stable identity (see resolve_peer_info).
        peer.spawn_link(inbound);
        peer.send(ControlMessage::PeerInfo {
            peer: self.inner.context.local_descriptor(),
            shared_state: None,
        })?;
        debug!("adopted link to {}", peer.descriptor().name);
        Ok(peer)
    }

    /// Apply the `peerInfo` resolution rules to `link` carrying
    /// `incoming`. Returns the surviving peer for that stable uuid, or
    /// `None` when the link itself was destroyed as a duplicate.
    fn resolve_peer_info(&self, link: &Peer, incoming: PeerDescriptor) -> Option<Peer> {
        if link.state() == PeerState::Deleted {
            return None;
        }

        let incumbent = {
            let peers = self.inner.peers.read();
            peers
                .get(&incoming.uuid)
                .filter(|peer| !peer.same_link(link) && peer.state() != PeerState::Deleted)
                .cloned()
        };

        if let Some(incumbent) = incumbent {
            if incumbent.instance_uuid() == incoming.instance_uuid {
                // Same process connected twice; the newcomer loses.
                info!(
                    "duplicate link for peer {} ({}), dropping newcomer",
                    incoming.name, incoming.uuid
                );
                {
                    // The newcomer is only deregistered if it ever claimed
                    // a slot; the incumbent's slot must survive.
                    let mut peers = self.inner.peers.write();
                    if let Some(registered) = peers.get(&link.uuid()) {
                        if registered.same_link(link) {
                            peers.remove(&link.uuid());
                        }
                    }
                }
                link.destroy(DestroyOptions {
                    can_try_reconnect: false,
                    advertise_destroy: false,
                });
                return Some(incumbent);
            }
            // Same stable identity, new process: the incumbent is stale.
            info!(
                "peer {} restarted (instance {} -> {}), replacing link",
                incoming.name,
                incumbent.instance_uuid(),
                incoming.instance_uuid
            );
            incumbent.destroy(DestroyOptions {
                can_try_reconnect: false,
                advertise_destroy: true,
            });
        }

        // Re-key the link under its real stable uuid.
        {
            let mut peers = self.inner.peers.write();
            let old_uuid = link.uuid();
            if let Some(registered) = peers.get(&old_uuid) {
                if registered.same_link(link) && old_uuid != incoming.uuid {
                    peers.remove(&old_uuid);
                }
            }
            link.replace_descriptor(incoming);
            peers.insert(link.uuid(), link.clone());
        }
        link.promote_connected();
        Some(link.clone())
    }

    fn handle_notice(&self, notice: Notice) {
        match notice {
            Notice::StateChanged { peer } => {
                let state = peer.state();
                let _ = self.inner.events.send(ManagerEvent::PeerChanged(peer.clone()));
                if state == PeerState::Connected {
                    let _ = self
                        .inner
                        .events
                        .send(ManagerEvent::PeerConnected(peer.clone()));
                    if self.inner.ever_connected.lock().insert(peer.uuid()) {
                        let _ = self
                            .inner
                            .events
                            .send(ManagerEvent::NewPeerConnected(peer));
                    }
                }
            }
            Notice::Destroyed {
                peer,
                can_try_reconnect,
            } => {
                let uuid = peer.uuid();
                {
                    let mut peers = self.inner.peers.write();
                    // Only clear the slot if it still holds this link; a
                    // replacement may already have taken the uuid.
                    if let Some(registered) = peers.get(&uuid) {
                        if registered.same_link(&peer) {
                            peers.remove(&uuid);
                        }
                    }
                }
                let _ = self.inner.events.send(ManagerEvent::PeerDeleted {
                    uuid,
                    can_try_reconnect,
                });
            }
            Notice::PeerInfo { link, descriptor } => {
                self.resolve_peer_info(&link, descriptor);
            }
        }
    }
}

impl std::fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerManager")
            .field("peers", &self.len())
            .finish()
    }
}

/// Registry task: serializes all bookkeeping so no two notices for the
/// same peer race each other.
async fn run_registry(manager: PeerManager, mut notices: mpsc::UnboundedReceiver<Notice>) {
    while let Some(notice) = notices.recv().await {
        manager.handle_notice(notice);
    }
}
