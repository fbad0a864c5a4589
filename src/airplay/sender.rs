// ABOUTME: Outbound AirPlay packets: audio frames, sync beacons, resend replay
// ABOUTME: Keeps a bounded history of sent packets keyed by sequence number

use crate::airplay::rtp::{self, payload_type, ResendRange, RtpHeader};
use crate::airplay::socket::AirplaySocket;
use crate::error::Error;
use crate::time::Clock;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Per-stream session parameters.
///
/// The cipher fields are carried through but not yet applied; payloads
/// currently ship unencrypted.
#[derive(Debug, Clone, Default)]
pub struct AirplaySession {
    /// Session id echoed in every audio packet.
    pub client_session_id: u32,
    /// AES key negotiated for this session, if any.
    pub aes_key: Option<[u8; 16]>,
    /// AES IV negotiated for this session, if any.
    pub aes_iv: Option<[u8; 16]>,
}

struct SenderState {
    first_audio_sent: bool,
    first_sync_sent: bool,
    history: VecDeque<(u16, Vec<u8>)>,
}

/// Outbound half of the AirPlay transport.
///
/// Refuses to send until the device's address has been established (by
/// timing traffic or explicit session setup).
pub struct AirplaySender {
    socket: Arc<UdpSocket>,
    client_addr: Arc<Mutex<Option<SocketAddr>>>,
    session: AirplaySession,
    clock: Clock,
    frames_per_packet: u32,
    history_limit: usize,
    state: Mutex<SenderState>,
}

impl AirplaySender {
    /// Create a sender over an established socket.
    pub fn new(
        socket: &AirplaySocket,
        session: AirplaySession,
        clock: Clock,
        frames_per_packet: u32,
        history_limit: usize,
    ) -> Self {
        Self {
            socket: socket.socket(),
            client_addr: socket.client_addr(),
            session,
            clock,
            frames_per_packet,
            history_limit,
            state: Mutex::new(SenderState {
                first_audio_sent: false,
                first_sync_sent: false,
                history: VecDeque::new(),
            }),
        }
    }

    fn target(&self) -> Result<SocketAddr, Error> {
        (*self.client_addr.lock()).ok_or(Error::NoRemotePort)
    }

    /// Send one packet of encoded audio at the given RTP timestamp.
    ///
    /// The sequence number is derived from the timestamp so both sides
    /// agree on numbering without extra state. Returns the sequence number
    /// used.
    pub async fn send_audio(&self, timestamp: u32, payload: &[u8]) -> Result<u16, Error> {
        let target = self.target()?;
        let seqnum = (timestamp / self.frames_per_packet) as u16;

        let is_first = {
            let mut state = self.state.lock();
            let first = !state.first_audio_sent;
            state.first_audio_sent = true;
            first
        };
        let header = RtpHeader {
            extension: true,
            source: 0,
            marker: is_first,
            payload_type: payload_type::AUDIO_DATA,
            seqnum,
        };

        let mut packet = Vec::with_capacity(RtpHeader::SIZE + 8 + payload.len());
        packet.extend_from_slice(&header.encode());
        packet.extend_from_slice(&timestamp.to_be_bytes());
        packet.extend_from_slice(&self.session.client_session_id.to_be_bytes());
        // TODO: AES-CBC encrypt the payload with the session key/iv once
        // key negotiation is wired through session setup.
        packet.extend_from_slice(payload);

        self.socket
            .send_to(&packet, target)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        trace!("audio packet seq={seqnum} ts={timestamp} ({} bytes)", packet.len());

        let mut state = self.state.lock();
        state.history.push_back((seqnum, packet));
        while state.history.len() > self.history_limit {
            state.history.pop_front();
        }
        Ok(seqnum)
    }

    /// Send a sync beacon pinning the next chunk's RTP time to our clock.
    ///
    /// `latency` is subtracted from the beacon's play-out slot so the
    /// device schedules against its own buffer depth.
    pub async fn send_sync(&self, next_chunk_ts: u32, latency: u32) -> Result<(), Error> {
        let target = self.target()?;
        let is_first = {
            let mut state = self.state.lock();
            let first = !state.first_sync_sent;
            state.first_sync_sent = true;
            first
        };
        let header = RtpHeader {
            extension: is_first,
            source: 0,
            marker: true,
            payload_type: payload_type::SYNC,
            seqnum: 7,
        };

        let mut packet = Vec::with_capacity(RtpHeader::SIZE + 16);
        packet.extend_from_slice(&header.encode());
        packet.extend_from_slice(&next_chunk_ts.wrapping_sub(latency).to_be_bytes());
        packet.extend_from_slice(&rtp::encode_ntp(self.clock.now().max(0.0)));
        packet.extend_from_slice(&next_chunk_ts.to_be_bytes());

        self.socket
            .send_to(&packet, target)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(())
    }

    /// Replay packets the device reported missing. Sequence numbers that
    /// have already left the history are skipped. Returns how many packets
    /// went out.
    pub async fn resend(&self, range: ResendRange) -> Result<usize, Error> {
        let target = self.target()?;
        let mut replayed = 0;
        for offset in 0..range.missed_count {
            let seqnum = range.missed_seq.wrapping_add(offset);
            let packet = {
                let state = self.state.lock();
                state
                    .history
                    .iter()
                    .find(|(seq, _)| *seq == seqnum)
                    .map(|(_, bytes)| bytes.clone())
            };
            match packet {
                Some(bytes) => {
                    self.socket
                        .send_to(&bytes, target)
                        .await
                        .map_err(|e| Error::Transport(e.to_string()))?;
                    replayed += 1;
                }
                None => warn!("resend for seq {seqnum} outside retained history"),
            }
        }
        debug!(
            "resend request seq={} count={}: replayed {replayed}",
            range.missed_seq, range.missed_count
        );
        Ok(replayed)
    }

    /// Drop stream state so the next packets are marked as stream starts.
    pub fn reset_stream(&self) {
        let mut state = self.state.lock();
        state.first_audio_sent = false;
        state.first_sync_sent = false;
        state.history.clear();
    }
}

impl std::fmt::Debug for AirplaySender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AirplaySender")
            .field("session", &self.session.client_session_id)
            .field("frames_per_packet", &self.frames_per_packet)
            .finish()
    }
}
