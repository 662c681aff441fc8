//! Decoded packet envelope.

use std::net::SocketAddr;

/// The unit of data delivered to subscribers: a datagram payload together
/// with the address it arrived from.
///
/// The server treats the payload as opaque bytes; interpreting it is the
/// job of whatever protocol state machine subscribes to the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Address the datagram was received from
    pub source: SocketAddr,
    /// Raw payload bytes, after any handler-stage mutation
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Create an envelope from a source address and payload.
    #[must_use]
    pub fn new(source: SocketAddr, payload: Vec<u8>) -> Self {
        Self { source, payload }
    }
}
