// ABOUTME: Bootstrap signalling interface: payload limits, envelope codec, loopback
// ABOUTME: The relay itself lives outside the core; only its contract lives here

use crate::error::Error;
use crate::peer::link::PeerTransport;
use crate::peer::messages::ControlMessage;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Conversation ids must stay strictly under this length.
pub const MAX_CONVERSATION_ID_LEN: usize = 64;

/// Relay messages are capped at this many bytes.
pub const MAX_MESSAGE_LEN: usize = 1024;

/// Check a rendezvous conversation id before it goes on the wire.
pub fn validate_conversation_id(id: &str) -> Result<(), Error> {
    if id.is_empty() {
        return Err(Error::InvalidArgument(
            "conversation id must not be empty".to_string(),
        ));
    }
    if id.len() >= MAX_CONVERSATION_ID_LEN {
        return Err(Error::InvalidArgument(format!(
            "conversation id too long: {} chars (limit {})",
            id.len(),
            MAX_CONVERSATION_ID_LEN
        )));
    }
    Ok(())
}

/// Check a relay message body against the relay's size cap.
pub fn validate_message(body: &str) -> Result<(), Error> {
    if body.len() > MAX_MESSAGE_LEN {
        return Err(Error::InvalidArgument(format!(
            "relay message too large: {} bytes (limit {})",
            body.len(),
            MAX_MESSAGE_LEN
        )));
    }
    Ok(())
}

/// Serialize a control message into a relay string body.
pub fn encode_relay_message(message: &ControlMessage) -> Result<String, Error> {
    let body =
        serde_json::to_string(message).map_err(|e| Error::Protocol(e.to_string()))?;
    validate_message(&body)?;
    Ok(body)
}

/// Parse a control message out of a relay string body. A body that is not
/// a well-formed envelope is a protocol error.
pub fn decode_relay_message(body: &str) -> Result<ControlMessage, Error> {
    serde_json::from_str(body).map_err(|e| Error::Protocol(e.to_string()))
}

/// In-process message channel implementing [`PeerTransport`].
///
/// Stands in for a real rendezvous-established transport in tests and
/// demos: two halves, each sending into the other's inbound queue.
pub struct LoopbackTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<ControlMessage>>>,
}

impl PeerTransport for LoopbackTransport {
    fn send(&self, message: ControlMessage) -> Result<(), Error> {
        match &*self.tx.lock() {
            Some(tx) => tx
                .send(message)
                .map_err(|_| Error::Transport("loopback peer hung up".to_string())),
            None => Err(Error::LinkClosed),
        }
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

/// One end of a loopback link: the transport to hand to the peer manager
/// plus the inbound stream of messages the other side sent us.
pub struct LoopbackEnd {
    /// Transport half; messages sent here arrive at the other end.
    pub transport: Box<LoopbackTransport>,
    /// Messages the other end sent to us.
    pub inbound: mpsc::UnboundedReceiver<ControlMessage>,
}

/// Build a connected pair of loopback ends.
pub fn loopback_pair() -> (LoopbackEnd, LoopbackEnd) {
    let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel();
    let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel();
    (
        LoopbackEnd {
            transport: Box::new(LoopbackTransport {
                tx: Mutex::new(Some(a_to_b_tx)),
            }),
            inbound: b_to_a_rx,
        },
        LoopbackEnd {
            transport: Box::new(LoopbackTransport {
                tx: Mutex::new(Some(b_to_a_tx)),
            }),
            inbound: a_to_b_rx,
        },
    )
}
