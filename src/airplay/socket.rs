// ABOUTME: UDP side of the AirPlay transport: bind-with-retry and inbound dispatch
// ABOUTME: Reflects timing probes in place, surfaces resend requests upward

use crate::airplay::rtp::{
    self, payload_type, ResendRange, RtpHeader, TimingStamps,
};
use crate::error::Error;
use crate::time::Clock;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events the socket surfaces to the streaming layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AirplayEvent {
    /// The device reported missing packets and wants them again.
    ResendRequested(ResendRange),
}

/// Bind a UDP socket starting at `base_port`, walking upward past ports
/// that are already taken. Any error other than address-in-use is fatal.
pub async fn bind_from(base_port: u16) -> Result<(UdpSocket, u16), Error> {
    let mut port = base_port;
    loop {
        match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(socket) => {
                let bound = socket.local_addr().map(|addr| addr.port()).unwrap_or(port);
                debug!("airplay socket bound to port {bound}");
                return Ok((socket, bound));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                port = port.checked_add(1).ok_or_else(|| {
                    Error::Transport("ran out of ports while binding".to_string())
                })?;
            }
            Err(err) => return Err(Error::Bind(err)),
        }
    }
}

/// Build the reflection for an inbound timing probe: the device's send
/// time comes back in the reference slot, our clock fills the other two.
pub fn timing_reflection(request: RtpHeader, stamps: &TimingStamps, now_ms: f64) -> Vec<u8> {
    let header = RtpHeader {
        extension: false,
        source: request.source,
        marker: true,
        payload_type: payload_type::TIMING_RESPONSE,
        seqnum: request.seqnum,
    };
    rtp::encode_timing(
        header,
        &TimingStamps {
            reference_ms: stamps.send_ms,
            received_ms: now_ms,
            send_ms: now_ms,
        },
    )
}

/// One bound AirPlay transport socket.
///
/// Owns the receive loop; timing requests are answered inline, resend
/// requests flow out through [`AirplaySocket::take_events`]. Malformed or
/// unknown packets are dropped without ceremony.
pub struct AirplaySocket {
    socket: Arc<UdpSocket>,
    port: u16,
    client_addr: Arc<Mutex<Option<SocketAddr>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<AirplayEvent>>>,
    recv_task: JoinHandle<()>,
}

impl AirplaySocket {
    /// Bind starting at `base_port` and start the receive loop.
    pub async fn bind(base_port: u16, clock: Clock) -> Result<Self, Error> {
        let (socket, port) = bind_from(base_port).await?;
        let socket = Arc::new(socket);
        let client_addr = Arc::new(Mutex::new(None));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let recv_task = tokio::spawn(run_receiver(
            Arc::clone(&socket),
            Arc::clone(&client_addr),
            clock,
            events_tx,
        ));
        Ok(Self {
            socket,
            port,
            client_addr,
            events_rx: Mutex::new(Some(events_rx)),
            recv_task,
        })
    }

    /// The port the socket ended up on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The raw socket, shared with senders.
    pub(crate) fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Shared slot holding the device's address once established.
    pub(crate) fn client_addr(&self) -> Arc<Mutex<Option<SocketAddr>>> {
        Arc::clone(&self.client_addr)
    }

    /// Record the device's address explicitly (e.g. from session setup).
    pub fn set_client_addr(&self, addr: SocketAddr) {
        *self.client_addr.lock() = Some(addr);
    }

    /// Take the event stream. Yields `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AirplayEvent>> {
        self.events_rx.lock().take()
    }
}

impl Drop for AirplaySocket {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

impl std::fmt::Debug for AirplaySocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AirplaySocket")
            .field("port", &self.port)
            .field("client_addr", &*self.client_addr.lock())
            .finish()
    }
}

async fn run_receiver(
    socket: Arc<UdpSocket>,
    client_addr: Arc<Mutex<Option<SocketAddr>>>,
    clock: Clock,
    events: mpsc::UnboundedSender<AirplayEvent>,
) {
    let mut buf = [0u8; 2048];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!("airplay receive failed: {err}");
                return;
            }
        };
        let packet = &buf[..len];
        let Some(header) = RtpHeader::parse(packet) else {
            continue;
        };
        match header.payload_type {
            payload_type::TIMING_REQUEST => {
                // Timing traffic doubles as client-port discovery.
                *client_addr.lock() = Some(from);
                let Some(stamps) = rtp::parse_timing(packet) else {
                    trace!("short timing request dropped");
                    continue;
                };
                let response = timing_reflection(header, &stamps, clock.now());
                if let Err(err) = socket.send_to(&response, from).await {
                    warn!("failed to reflect timing request: {err}");
                }
            }
            payload_type::RANGE_RESEND => {
                if let Some(range) = rtp::parse_resend(packet) {
                    let _ = events.send(AirplayEvent::ResendRequested(range));
                }
            }
            // Unknown payload types are dropped silently.
            _ => {}
        }
    }
}
