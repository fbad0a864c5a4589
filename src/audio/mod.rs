// ABOUTME: Audio pipeline pieces shared with the real-time callback
// ABOUTME: Circular sample buffer, volume control, and the synchronized sink

/// Lock-free volume/mute control and the callback-side gain smoother
pub mod gain;
/// Circular sample buffer and delay scalar shared with the callback
pub mod shared_buffer;
/// Synchronized local sink scheduler
pub mod synced_sink;

pub use gain::VolumeControl;
pub use shared_buffer::{SharedDelay, SharedSampleBuffer};
pub use synced_sink::SyncedSink;
