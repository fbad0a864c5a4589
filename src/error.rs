// ABOUTME: Error types for unison operations
// ABOUTME: One variant per failure domain, built on thiserror

use thiserror::Error;

/// Error types for unison operations
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure while sending a control message
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol violation or malformed message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer link was destroyed before the operation completed
    #[error("Peer link closed")]
    LinkClosed,

    /// A remote RPC handler reported a failure
    #[error("Remote call failed: {0}")]
    Rpc(String),

    /// No handler is registered for the requested call type
    #[error("Unknown call type: {0}")]
    UnknownRpcType(String),

    /// Audio output error
    #[error("Audio output error: {0}")]
    Output(String),

    /// Socket bind failed with a non-recoverable error
    #[error("Bind error: {0}")]
    Bind(#[from] std::io::Error),

    /// The remote endpoint's port is not known yet
    #[error("Remote port not established")]
    NoRemotePort,

    /// Rejected input (bad identifier, oversized payload)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
