//! Handler stages applied to raw datagrams before decoding.

use std::net::SocketAddr;

/// A raw datagram as seen by handler stages, before the decoder turns it
/// into an [`Envelope`](crate::Envelope).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Address the datagram was received from
    pub source: SocketAddr,
    /// Payload bytes; handlers may mutate these in place
    pub payload: Vec<u8>,
}

/// What a handler stage decided about the datagram it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Pass the datagram on to the next stage
    Continue,
    /// Short-circuit the chain and discard the datagram
    Drop,
}

/// A packet-processing stage in the ingestion pipeline.
///
/// Handlers run one after another on the ingest task, in registration
/// order, after traffic shaping and before decoding. A handler may inspect
/// the datagram, mutate its payload, or drop it entirely. Handlers must not
/// block; long-running work belongs on the subscriber side.
pub trait PacketHandler: Send + Sync {
    /// Stage name, used in logs and chain inspection.
    fn name(&self) -> &str;

    /// Process one datagram.
    fn handle(&self, datagram: &mut Datagram) -> Verdict;
}

/// Diagnostic stage logging every inbound datagram at `trace` level.
///
/// Always present at the front of the handler list, mirroring the wire-level
/// logging most transport stacks hang ahead of application handlers.
pub(crate) struct TraceHandler;

impl PacketHandler for TraceHandler {
    fn name(&self) -> &str {
        "trace"
    }

    fn handle(&self, datagram: &mut Datagram) -> Verdict {
        tracing::trace!(
            "Datagram from {}: {} bytes",
            datagram.source,
            datagram.payload.len()
        );
        Verdict::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(payload: &[u8]) -> Datagram {
        Datagram {
            source: "127.0.0.1:9000".parse().unwrap(),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn trace_handler_passes_everything_through() {
        let handler = TraceHandler;
        let mut d = datagram(b"ping");
        assert_eq!(handler.handle(&mut d), Verdict::Continue);
        assert_eq!(d.payload, b"ping");
    }

    #[test]
    fn handlers_can_mutate_in_place() {
        struct Reverser;
        impl PacketHandler for Reverser {
            fn name(&self) -> &str {
                "reverser"
            }
            fn handle(&self, datagram: &mut Datagram) -> Verdict {
                datagram.payload.reverse();
                Verdict::Continue
            }
        }

        let mut d = datagram(&[1, 2, 3]);
        assert_eq!(Reverser.handle(&mut d), Verdict::Continue);
        assert_eq!(d.payload, vec![3, 2, 1]);
    }
}
