// ABOUTME: Main library entry point for unison
// ABOUTME: Exports the peer mesh, time sync, and synchronized playback pipeline

//! # unison
//!
//! Synchronized multi-device audio playback: every output device in the
//! mesh emits the same sample at the same wall-clock instant, within a few
//! milliseconds.
//!
//! The crate carries the core of the pipeline: the clock-offset estimator
//! between peers, the sample-accurate local playback scheduler over a
//! lock-free shared buffer, and the AirPlay-compatible RTP transport for
//! one class of remote sinks. Discovery, rendezvous transports, codecs,
//! and UI are external collaborators reached through the interfaces in
//! [`peer`] and [`rendezvous`].
//!
//! ## Example: joining a mesh
//!
//! ```no_run
//! use unison::context::{Context, ContextOptions};
//! use unison::peer::PeerManager;
//! use unison::rendezvous::loopback_pair;
//!
//! #[tokio::main]
//! async fn main() {
//!     let context = Context::new(ContextOptions::builder().name("kitchen").build());
//!     let manager = PeerManager::new(context.clone());
//!
//!     // A real deployment hands adopt_link a rendezvous-established
//!     // transport and the remote's provisional descriptor; the loopback
//!     // pair stands in for one here. The peer reaches Connected once the
//!     // remote's peerInfo arrives over the link.
//!     let (local_end, _remote_end) = loopback_pair();
//!     let remote_descriptor = context.local_descriptor();
//!     let peer = manager
//!         .adopt_link(remote_descriptor, local_end.transport, local_end.inbound)
//!         .unwrap();
//!     println!("link is {:?}", peer.state());
//! }
//! ```

#![warn(missing_docs)]

/// AirPlay-compatible RTP transport
pub mod airplay;
/// Shared sample buffer, volume control, and the synchronized sink
pub mod audio;
/// Runtime configuration
pub mod config;
/// Runtime context threaded through constructors
pub mod context;
/// Error types
pub mod error;
/// Peer links, control messages, and the registry
pub mod peer;
/// Source-to-sink binding and orchestration
pub mod pipe;
/// Bootstrap signalling contract and loopback channels
pub mod rendezvous;
/// Audio source descriptors and chunk types
pub mod source;
/// Bounded window statistics
pub mod stats;
/// Monotonic clock and the per-peer time-sync estimator
pub mod time;

pub use audio::SyncedSink;
pub use config::Config;
pub use context::{Context, ContextOptions};
pub use peer::{Peer, PeerManager, PeerState};
pub use pipe::Pipe;
pub use source::{AudioChunk, SourceDescriptor, SourceHandle};
pub use time::Clock;

/// Result type for unison operations
pub type Result<T> = std::result::Result<T, error::Error>;
