//! Pipeline assembly.
//!
//! The stage chain is recomputed as a pure function of the configuration
//! and the registered handlers on every bind and rebind. Nothing is
//! inserted into a live chain; a restart simply builds a new one.

use crate::bus::PacketBus;
use crate::config::ServerConfig;
use crate::decode::Decoder;
use crate::handler::{Datagram, PacketHandler, TraceHandler, Verdict};
use crate::shaper::TrafficShaper;
use std::sync::Arc;

/// Kind of a pipeline stage, in chain order. Used to make the assembled
/// chain inspectable without timing-sensitive tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StageKind {
    /// Inbound byte-rate throttle, present only with a nonzero limit
    TrafficShaping,
    /// Diagnostic trace logging
    Trace,
    /// Caller-registered handler, by name
    Custom(String),
    /// Datagram-to-envelope decoding
    Decode,
    /// Publication to the packet bus
    Publish,
}

/// The ordered processing chain for one bound channel.
///
/// Fixed order: traffic shaping (if limited), trace logging, caller
/// handlers in registration order, decode, publish. Shaping comes first so
/// the rate limit sees every inbound byte before any other stage spends
/// cycles on it; decoding comes last among the byte-level stages so caller
/// handlers can inspect raw datagrams.
pub(crate) struct Pipeline {
    shaper: Option<TrafficShaper>,
    stages: Vec<Arc<dyn PacketHandler>>,
    decoder: Arc<dyn Decoder>,
}

impl Pipeline {
    /// Assemble a fresh chain for one bind attempt.
    pub(crate) fn build(
        config: &ServerConfig,
        handlers: &[Arc<dyn PacketHandler>],
        decoder: Arc<dyn Decoder>,
    ) -> Self {
        let shaper = match config.traffic_read_limit {
            0 => None,
            limit => Some(TrafficShaper::new(limit)),
        };

        let mut stages: Vec<Arc<dyn PacketHandler>> = Vec::with_capacity(handlers.len() + 1);
        stages.push(Arc::new(TraceHandler));
        stages.extend(handlers.iter().cloned());

        Self {
            shaper,
            stages,
            decoder,
        }
    }

    /// The chain's stage kinds in execution order.
    pub(crate) fn stage_kinds(&self) -> Vec<StageKind> {
        let mut kinds = Vec::with_capacity(self.stages.len() + 3);
        if self.shaper.is_some() {
            kinds.push(StageKind::TrafficShaping);
        }
        kinds.push(StageKind::Trace);
        for stage in self.stages.iter().skip(1) {
            kinds.push(StageKind::Custom(stage.name().to_string()));
        }
        kinds.push(StageKind::Decode);
        kinds.push(StageKind::Publish);
        kinds
    }

    /// Run one datagram through the chain to completion.
    ///
    /// A `Drop` verdict or a decode failure discards the datagram and
    /// nothing else; the caller keeps receiving.
    pub(crate) async fn process(&mut self, mut datagram: Datagram, bus: &PacketBus) {
        if let Some(shaper) = self.shaper.as_mut() {
            shaper.throttle(datagram.payload.len()).await;
        }

        for stage in &self.stages {
            if stage.handle(&mut datagram) == Verdict::Drop {
                tracing::trace!(
                    "Datagram from {} dropped by stage '{}'",
                    datagram.source,
                    stage.name()
                );
                return;
            }
        }

        match self.decoder.decode(&datagram.payload, datagram.source) {
            Ok(envelope) => bus.publish(envelope),
            Err(e) => tracing::debug!("Dropping undecodable datagram: {}", e),
        }
    }
}
