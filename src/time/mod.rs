// ABOUTME: Time primitives for unison
// ABOUTME: Monotonic process clock and the per-peer clock-offset estimator

/// Process-start-relative monotonic clock
pub mod clock;
/// Per-peer clock-offset estimation from timing probes
pub mod timekeeper;

pub use clock::Clock;
pub use timekeeper::{TimeSyncEvent, Timekeeper};
