// ABOUTME: RTP header and NTP timestamp codec for the AirPlay transport
// ABOUTME: 4-byte headers, 8-byte fixed-point timestamps, big-endian throughout

/// Known RTP payload types on the AirPlay control and audio ports.
pub mod payload_type {
    /// Timing probe from the device.
    pub const TIMING_REQUEST: u8 = 0x52;
    /// Our reflection of a timing probe.
    pub const TIMING_RESPONSE: u8 = 0x53;
    /// Periodic sync beacon pinning RTP time to NTP time.
    pub const SYNC: u8 = 0x54;
    /// Device asking for lost packets by sequence range.
    pub const RANGE_RESEND: u8 = 0x55;
    /// Encoded audio frames.
    pub const AUDIO_DATA: u8 = 0x60;

    /// True for payload types this transport understands.
    pub fn is_known(value: u8) -> bool {
        matches!(
            value,
            TIMING_REQUEST | TIMING_RESPONSE | SYNC | RANGE_RESEND | AUDIO_DATA
        )
    }
}

/// Four-byte RTP header.
///
/// Byte 0 carries the extension bit and a 4-bit source id, byte 1 the
/// marker bit and 7-bit payload type, bytes 2-3 the big-endian sequence
/// number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Extension flag (top bit of byte 0).
    pub extension: bool,
    /// 4-bit source identifier.
    pub source: u8,
    /// Marker flag (top bit of byte 1).
    pub marker: bool,
    /// 7-bit payload type.
    pub payload_type: u8,
    /// 16-bit sequence number.
    pub seqnum: u16,
}

impl RtpHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 4;

    /// Encode to wire bytes.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let byte0 = if self.extension { 0x80 } else { 0 } | (self.source & 0x0f);
        let byte1 = if self.marker { 0x80 } else { 0 } | (self.payload_type & 0x7f);
        let seq = self.seqnum.to_be_bytes();
        [byte0, byte1, seq[0], seq[1]]
    }

    /// Parse from the front of a packet. `None` when too short.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            extension: bytes[0] & 0x80 != 0,
            source: bytes[0] & 0x0f,
            marker: bytes[1] & 0x80 != 0,
            payload_type: bytes[1] & 0x7f,
            seqnum: u16::from_be_bytes([bytes[2], bytes[3]]),
        })
    }
}

const NTP_FRAC_SCALE: f64 = 4294967296.0; // 2^32

/// Encode milliseconds as an 8-byte NTP timestamp: u32 integer seconds,
/// u32 fractional seconds in units of 2^-32.
pub fn encode_ntp(ms: f64) -> [u8; 8] {
    let seconds = (ms / 1000.0).max(0.0);
    let integer = seconds.floor();
    let mut fraction = ((seconds - integer) * NTP_FRAC_SCALE).round();
    // Rounding can land exactly on 2^32; fold into the fraction's ceiling.
    if fraction >= NTP_FRAC_SCALE {
        fraction = NTP_FRAC_SCALE - 1.0;
    }
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&(integer as u32).to_be_bytes());
    out[4..].copy_from_slice(&(fraction as u32).to_be_bytes());
    out
}

/// Decode an 8-byte NTP timestamp into milliseconds.
pub fn parse_ntp(bytes: &[u8]) -> Option<f64> {
    if bytes.len() < 8 {
        return None;
    }
    let integer = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64;
    let fraction = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as f64;
    Some((integer + fraction / NTP_FRAC_SCALE) * 1000.0)
}

/// The three timestamp slots of a timing packet, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingStamps {
    /// Reference time.
    pub reference_ms: f64,
    /// When the sender received the probe it is answering.
    pub received_ms: f64,
    /// When the sender transmitted this packet.
    pub send_ms: f64,
}

/// Byte length of a timing packet: header, 4 bytes padding, 3 timestamps.
pub const TIMING_PACKET_LEN: usize = RtpHeader::SIZE + 4 + 3 * 8;

/// Parse the timestamp slots of a timing packet. The stamps sit after the
/// header plus four padding bytes.
pub fn parse_timing(packet: &[u8]) -> Option<TimingStamps> {
    if packet.len() < TIMING_PACKET_LEN {
        return None;
    }
    Some(TimingStamps {
        reference_ms: parse_ntp(&packet[8..16])?,
        received_ms: parse_ntp(&packet[16..24])?,
        send_ms: parse_ntp(&packet[24..32])?,
    })
}

/// Encode a timing packet with the given header and stamps.
pub fn encode_timing(header: RtpHeader, stamps: &TimingStamps) -> Vec<u8> {
    let mut packet = Vec::with_capacity(TIMING_PACKET_LEN);
    packet.extend_from_slice(&header.encode());
    packet.extend_from_slice(&[0u8; 4]);
    packet.extend_from_slice(&encode_ntp(stamps.reference_ms));
    packet.extend_from_slice(&encode_ntp(stamps.received_ms));
    packet.extend_from_slice(&encode_ntp(stamps.send_ms));
    packet
}

/// A device's request for retransmission of a sequence range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendRange {
    /// First missed sequence number.
    pub missed_seq: u16,
    /// How many consecutive packets are missing.
    pub missed_count: u16,
}

/// Parse the body of a range-resend packet.
pub fn parse_resend(packet: &[u8]) -> Option<ResendRange> {
    if packet.len() < RtpHeader::SIZE + 4 {
        return None;
    }
    Some(ResendRange {
        missed_seq: u16::from_be_bytes([packet[4], packet[5]]),
        missed_count: u16::from_be_bytes([packet[6], packet[7]]),
    })
}
