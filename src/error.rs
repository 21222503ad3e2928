//! Error taxonomy for the presence core
//!
//! Nothing here is fatal to a running client: background tasks log these and
//! keep going. Connection loss is a state transition, not an error value.

use thiserror::Error;

/// Errors produced by the codec, transport and presence layers
#[derive(Error, Debug)]
pub enum PresenceError {
    /// Wire message could not be decoded into a canonical event
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    /// No async runtime to host the transport; the proxy stays inert
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    /// Snapshot fetch failed or timed out; retried by the next refresh
    #[error("snapshot fetch failed for room {room}: {reason}")]
    SnapshotFetchFailed { room: String, reason: String },
    /// Presence push could not be queued
    #[error("presence push failed: {0}")]
    PushFailed(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PresenceError> = std::result::Result<T, E>;
