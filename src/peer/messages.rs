// ABOUTME: Typed control-channel messages exchanged between peers
// ABOUTME: Tagged envelope with timing probes, identity exchange, and RPC correlation

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Optional feature a peer advertises participation in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capacity {
    /// Spotify Connect source endpoint
    Librespot,
    /// AirPlay source endpoint
    Shairport,
    /// Reachable over plain HTTP
    HttpServerAccessible,
    /// Philips Hue light sync
    Hue,
    /// Chromecast control
    ChromecastInteraction,
    /// Holds the replicated shared state
    SharedStateKeeper,
    /// Can render audio to an AirPlay device
    AirplaySink,
}

/// Identity and feature set of a peer.
///
/// `uuid` is stable across restarts; `instance_uuid` is minted per process
/// and distinguishes a restart from a duplicate connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// Stable identity, survives restarts.
    pub uuid: Uuid,
    /// Per-process identity.
    pub instance_uuid: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Software version string.
    pub version: String,
    /// Advertised capacities.
    #[serde(default)]
    pub capacities: Vec<Capacity>,
}

/// Correlated request/response envelope carried inside the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelope {
    /// Correlation id, echoed verbatim in the response.
    pub uuid: String,
    /// Name of the remote operation.
    pub rpc_type: String,
    /// False for requests, true for responses.
    pub is_response: bool,
    /// Set on responses when the handler failed; `body` then carries the
    /// error text.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    /// Request arguments or response value.
    pub body: serde_json::Value,
}

/// Control messages carried by the per-peer channel.
///
/// The envelope is tagged by `type`; payload fields sit alongside the tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Ask the peer to reflect a timing probe.
    #[serde(rename = "timekeepRequest")]
    TimekeepRequest {
        /// Sender's clock at transmission, in ms.
        sent_at: f64,
    },
    /// Reflected timing probe.
    #[serde(rename = "timekeepResponse")]
    TimekeepResponse {
        /// Echoed from the request.
        sent_at: f64,
        /// Responder's clock when the reflection was produced, in ms.
        responded_at: f64,
    },
    /// Handshake and identity refresh.
    #[serde(rename = "peerInfo")]
    PeerInfo {
        /// The sender's descriptor.
        peer: PeerDescriptor,
        /// Opaque replicated-state blob, transported untouched.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shared_state: Option<serde_json::Value>,
    },
    /// Graceful teardown notice.
    #[serde(rename = "disconnect")]
    Disconnect,
    /// Correlated RPC envelope.
    #[serde(rename = "rpc")]
    Rpc(RpcEnvelope),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timekeep_request_wire_shape() {
        let msg = ControlMessage::TimekeepRequest { sent_at: 1234.5 };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"timekeepRequest\""));
        assert!(json.contains("\"sent_at\":1234.5"));
    }

    #[test]
    fn test_timekeep_response_roundtrip() {
        let json = r#"{"type":"timekeepResponse","sent_at":100.0,"responded_at":250.25}"#;
        let msg: ControlMessage = serde_json::from_str(json).unwrap();
        match msg {
            ControlMessage::TimekeepResponse {
                sent_at,
                responded_at,
            } => {
                assert_eq!(sent_at, 100.0);
                assert_eq!(responded_at, 250.25);
            }
            other => panic!("expected timekeepResponse, got {other:?}"),
        }
    }

    #[test]
    fn test_peer_info_without_shared_state_omits_field() {
        let msg = ControlMessage::PeerInfo {
            peer: PeerDescriptor {
                uuid: Uuid::nil(),
                instance_uuid: Uuid::nil(),
                name: "node".to_string(),
                version: "0.1.0".to_string(),
                capacities: vec![Capacity::AirplaySink],
            },
            shared_state: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"peerInfo\""));
        assert!(json.contains("\"AirplaySink\""));
        assert!(!json.contains("shared_state"));
    }

    #[test]
    fn test_rpc_error_flag_defaults_false() {
        let json = r#"{
            "type": "rpc",
            "uuid": "abc-123",
            "rpc_type": "setVolume",
            "is_response": false,
            "body": {"volume": 40}
        }"#;
        let msg: ControlMessage = serde_json::from_str(json).unwrap();
        match msg {
            ControlMessage::Rpc(envelope) => {
                assert_eq!(envelope.uuid, "abc-123");
                assert_eq!(envelope.rpc_type, "setVolume");
                assert!(!envelope.is_response);
                assert!(!envelope.is_error);
                assert_eq!(envelope.body["volume"], 40);
            }
            other => panic!("expected rpc, got {other:?}"),
        }
    }

    #[test]
    fn test_disconnect_is_bare_tag() {
        let msg: ControlMessage = serde_json::from_str(r#"{"type":"disconnect"}"#).unwrap();
        assert!(matches!(msg, ControlMessage::Disconnect));
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"disconnect"}"#
        );
    }
}
