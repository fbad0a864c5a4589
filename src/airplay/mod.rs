// ABOUTME: AirPlay-compatible RTP transport over UDP
// ABOUTME: Header/NTP codec, bound socket with timing responder, packet sender

/// RTP header and NTP timestamp codec
pub mod rtp;
/// Outbound audio, sync, and resend packets
pub mod sender;
/// Bound UDP socket, port acquisition, inbound dispatch
pub mod socket;

pub use rtp::{ResendRange, RtpHeader, TimingStamps};
pub use sender::{AirplaySender, AirplaySession};
pub use socket::{bind_from, AirplayEvent, AirplaySocket};
