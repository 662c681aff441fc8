//! Error types for the waypost ingestion server.

use std::net::SocketAddr;
use thiserror::Error;

/// Server lifecycle errors.
///
/// Only `start`-time failures are surfaced to the caller. Everything that
/// happens after a successful bind (unexpected closure, rebind failures,
/// shutdown hiccups) is handled internally and reported through logs.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `start` was called while the server was already running
    #[error("server already running")]
    AlreadyRunning,

    /// Binding the UDP socket failed
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the bind was attempted on
        addr: SocketAddr,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Decoder stage errors.
///
/// A decode failure never propagates out of the pipeline: the offending
/// datagram is logged and dropped, the server keeps running.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Datagram could not be turned into an envelope
    #[error("malformed datagram from {source_addr}: {reason}")]
    Malformed {
        /// Sender of the offending datagram
        source_addr: SocketAddr,
        /// What the decoder objected to
        reason: String,
    },
}
