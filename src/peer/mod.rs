// ABOUTME: Peer mesh: typed control messages, per-peer links, and the registry
// ABOUTME: Everything above the raw transport and below the audio pipeline

/// Per-peer control link and transport capability trait
pub mod link;
/// Registry of peers and lifecycle events
pub mod manager;
/// Typed control-channel message definitions
pub mod messages;

pub use link::{DestroyOptions, Peer, PeerEvent, PeerState, PeerTransport};
pub use manager::{ManagerEvent, PeerManager};
pub use messages::{Capacity, ControlMessage, PeerDescriptor, RpcEnvelope};
