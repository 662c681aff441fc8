//! Datagram decoding.
//!
//! The decoder is the seam between the transport-agnostic pipeline and the
//! discovery protocol proper: everything before it works on raw bytes,
//! everything after it sees [`Envelope`]s. Protocol crates inject their own
//! decoder through [`DiscoveryServer::set_decoder`](crate::DiscoveryServer::set_decoder).

use crate::envelope::Envelope;
use crate::error::DecodeError;
use std::net::SocketAddr;

/// Converts a raw datagram into an [`Envelope`].
pub trait Decoder: Send + Sync {
    /// Decode one datagram.
    ///
    /// Errors are logged and the datagram dropped; they never reach the
    /// subscribers or stop the server.
    fn decode(&self, payload: &[u8], source: SocketAddr) -> Result<Envelope, DecodeError>;
}

/// Default decoder: wraps the datagram verbatim, no interpretation.
#[derive(Debug, Default)]
pub struct EnvelopeDecoder;

impl Decoder for EnvelopeDecoder {
    fn decode(&self, payload: &[u8], source: SocketAddr) -> Result<Envelope, DecodeError> {
        Ok(Envelope::new(source, payload.to_vec()))
    }
}
