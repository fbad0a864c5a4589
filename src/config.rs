// ABOUTME: Runtime configuration for unison
// ABOUTME: Stream format constants, sync cadences, timeouts, and transport tuning

use std::time::Duration;

/// Number of timing probes fired back-to-back when a peer connects.
///
/// A peer is considered time-synchronized once its delta window holds at
/// least this many samples.
pub const INIT_PROBE_COUNT: usize = 10;

/// Spacing between the initial burst probes.
pub const INIT_PROBE_SPACING: Duration = Duration::from_millis(10);

/// Cadence of the steady-state timing probe.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Committed clock delta only moves when the window median differs from it
/// by more than this many milliseconds.
pub const DELTA_UPDATE_THRESHOLD_MS: f64 = 5.0;

/// Capacity of the per-peer clock-delta window.
pub const DELTA_WINDOW_CAPACITY: usize = 100;

/// Runtime configuration.
///
/// `Config::default()` matches the values the rest of the mesh expects;
/// individual fields can be overridden before handing the config to
/// [`crate::context::Context`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Sample rate of the shared stream format, in Hz.
    pub stream_rate: u32,
    /// Samples per chunk, per channel.
    pub chunk_samples: u32,
    /// Upper bound on sink latency, in milliseconds. Bounds the size of the
    /// shared sample buffer.
    pub max_latency_ms: u32,
    /// A peer that stays silent for this long is torn down.
    pub no_response_timeout: Duration,
    /// Audio frames carried by one AirPlay packet.
    pub frames_per_packet: u32,
    /// First UDP port tried when binding the AirPlay socket.
    pub airplay_base_port: u16,
    /// Encoded audio packets retained for resend requests.
    pub resend_history_packets: usize,
    /// Cadence of the output-device availability poll.
    pub sink_poll_interval: Duration,
    /// Idle lifetime of a rendezvous conversation, in seconds.
    pub conversation_expire_secs: u64,
}

impl Config {
    /// Duration of one chunk in milliseconds.
    pub fn chunk_duration_ms(&self) -> f64 {
        self.chunk_samples as f64 * 1000.0 / self.stream_rate as f64
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stream_rate: 48_000,
            chunk_samples: 480,
            max_latency_ms: 2_000,
            no_response_timeout: Duration::from_secs(30),
            frames_per_packet: 352,
            airplay_base_port: 6_000,
            resend_history_packets: 512,
            sink_poll_interval: Duration::from_secs(5),
            conversation_expire_secs: 300,
        }
    }
}
