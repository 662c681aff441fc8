//! Discovery server lifecycle.
//!
//! Owns one UDP socket at a time and keeps it alive: while the server is
//! running, either a bound channel exists or the ingest task is in the
//! middle of re-establishing one. The running flag is the single
//! synchronization point for start/stop; everything else follows from
//! which task owns the socket.
//!
//! # Packet Flow
//!
//! ```text
//! UDP socket → ingest task → [shaper] → trace → handlers → decode → bus
//!                                                                    │
//!                                              subscribers ←─────────┘
//! ```

use crate::bus::{PacketBus, PacketStream};
use crate::channel::{BoundChannel, ChannelStats};
use crate::config::ServerConfig;
use crate::decode::{Decoder, EnvelopeDecoder};
use crate::error::ServerError;
use crate::handler::{Datagram, PacketHandler};
use crate::pipeline::Pipeline;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::{error, info, warn};

struct ServerInner {
    config: ServerConfig,
    handlers: Mutex<Vec<Arc<dyn PacketHandler>>>,
    decoder: Mutex<Arc<dyn Decoder>>,
    /// True between a winning `start` and the matching `stop`
    running: AtomicBool,
    /// Current bound channel; replaced on every rebind, cleared on shutdown
    channel: Mutex<Option<BoundChannel>>,
    bus: PacketBus,
    /// True while the ingest task is alive
    ingest_active: AtomicBool,
    ingest_done: Notify,
}

/// Restartable UDP ingestion server for a peer-discovery protocol.
///
/// The server moves bytes from the network into the processing pipeline and
/// republishes the pipeline's output; it never interprets packet contents.
/// If the bound channel closes while the server is running, the ingest task
/// waits out the configured restart delay, rebuilds the chain, and rebinds -
/// indefinitely, until `stop` is called.
///
/// # Example
///
/// ```no_run
/// use waypost::{DiscoveryServer, ServerConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ServerConfig::new("0.0.0.0:30303".parse()?);
///     let server = DiscoveryServer::new(config)?;
///
///     let channel = server.start().await?;
///     tracing::info!("Listening on {}", channel.local_addr());
///
///     let mut packets = server.incoming_packets();
///     while let Some(envelope) = packets.recv().await {
///         tracing::info!("{} bytes from {}", envelope.payload.len(), envelope.source);
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct DiscoveryServer {
    inner: Arc<ServerInner>,
}

impl DiscoveryServer {
    /// Create a server from a validated configuration.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                handlers: Mutex::new(Vec::new()),
                decoder: Mutex::new(Arc::new(EnvelopeDecoder)),
                running: AtomicBool::new(false),
                channel: Mutex::new(None),
                bus: PacketBus::new(),
                ingest_active: AtomicBool::new(false),
                ingest_done: Notify::new(),
            }),
        })
    }

    /// Append a handler stage to the chain.
    ///
    /// Must be called before the first `start` to take effect on the first
    /// bind; a handler registered later only joins the chain at the next
    /// rebind. Live chains are never mutated.
    pub fn add_handler(&self, handler: Arc<dyn PacketHandler>) {
        if self.is_running() {
            warn!(
                "Handler '{}' registered while running; it takes effect on the next rebind",
                handler.name()
            );
        }
        lock(&self.inner.handlers).push(handler);
    }

    /// Replace the decoder stage. Same precondition as [`add_handler`](Self::add_handler).
    pub fn set_decoder(&self, decoder: Arc<dyn Decoder>) {
        if self.is_running() {
            warn!("Decoder replaced while running; it takes effect on the next rebind");
        }
        *lock(&self.inner.decoder) = decoder;
    }

    /// Start the server.
    ///
    /// Exactly one of any number of racing `start` calls wins; the rest fail
    /// with [`ServerError::AlreadyRunning`] and have no side effects. On a
    /// successful bind the ingest task is spawned and the bound channel
    /// handle is returned. On a bind failure the server returns to idle so
    /// the caller may retry; bind failures are never retried internally.
    pub async fn start(&self) -> Result<BoundChannel, ServerError> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ServerError::AlreadyRunning);
        }

        let addr = self.inner.config.listen_addr;
        info!("Starting discovery server on UDP port {}", addr.port());

        let pipeline = self.build_pipeline();
        let channel = match BoundChannel::bind(addr, self.inner.config.recv_buffer_size).await {
            Ok(channel) => channel,
            Err(source) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(ServerError::Bind { addr, source });
            }
        };
        *lock(&self.inner.channel) = Some(channel.clone());

        self.inner.ingest_active.store(true, Ordering::SeqCst);
        let server = self.clone();
        let ingest_channel = channel.clone();
        tokio::spawn(async move {
            server.ingest_loop(ingest_channel, pipeline).await;
        });

        Ok(channel)
    }

    /// Stop the server.
    ///
    /// Idempotent: stopping a server that is not running logs a warning and
    /// returns. Otherwise the running flag is flipped *before* the channel
    /// is closed, so the ingest task can tell this closure apart from an
    /// unexpected one, and the call waits for the ingest task to finish.
    /// Nothing on this path is surfaced as an error.
    pub async fn stop(&self) {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Attempted to stop a discovery server that is not running");
            return;
        }

        info!("Stopping discovery server");
        let channel = lock(&self.inner.channel).clone();
        if let Some(channel) = channel {
            channel.close();
        }

        let done = self.inner.ingest_done.notified();
        tokio::pin!(done);
        done.as_mut().enable();
        if self.inner.ingest_active.load(Ordering::SeqCst) {
            done.await;
        }
    }

    /// Subscribe to the stream of decoded envelopes.
    ///
    /// Callable in any state; a subscriber simply receives nothing until
    /// packets flow. A late subscriber starts from the most recent envelope.
    pub fn incoming_packets(&self) -> PacketStream {
        self.inner.bus.subscribe()
    }

    /// Whether the server is between a winning `start` and a `stop`.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Address of the currently bound channel, if one exists.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.channel)
            .as_ref()
            .map(BoundChannel::local_addr)
    }

    /// Receive statistics of the currently bound channel, if one exists.
    pub fn channel_stats(&self) -> Option<ChannelStats> {
        lock(&self.inner.channel)
            .as_ref()
            .map(BoundChannel::stats)
    }

    fn build_pipeline(&self) -> Pipeline {
        let handlers = lock(&self.inner.handlers).clone();
        let decoder = lock(&self.inner.decoder).clone();
        Pipeline::build(&self.inner.config, &handlers, decoder)
    }

    /// Ingest task body: drain the channel, and on closure either shut down
    /// or wait out the restart delay and rebind, forever, while running.
    async fn ingest_loop(self, mut channel: BoundChannel, mut pipeline: Pipeline) {
        let mut buf = vec![0u8; self.inner.config.max_datagram_size];
        let delay = self.inner.config.restart_delay;

        // A stop that raced the tail of start() may have flipped the flag
        // before this task existed; make sure the socket still gets closed.
        if !self.is_running() {
            channel.close();
        }

        'server: loop {
            self.drain_channel(&channel, &mut pipeline, &mut buf).await;

            if !self.is_running() {
                info!("Shutting down discovery server");
                break 'server;
            }
            *lock(&self.inner.channel) = None;
            error!(
                "Discovery channel closed unexpectedly; rebinding in {:?}",
                delay
            );

            loop {
                tokio::time::sleep(delay).await;
                if !self.is_running() {
                    info!("Shutting down discovery server");
                    break 'server;
                }

                pipeline = self.build_pipeline();
                match BoundChannel::bind(
                    self.inner.config.listen_addr,
                    self.inner.config.recv_buffer_size,
                )
                .await
                {
                    Ok(rebound) => {
                        info!(
                            "Discovery channel re-established on UDP port {}",
                            rebound.local_addr().port()
                        );
                        *lock(&self.inner.channel) = Some(rebound.clone());
                        channel = rebound;
                        continue 'server;
                    }
                    Err(e) => {
                        error!("Rebind failed: {}; retrying in {:?}", e, delay);
                    }
                }
            }
        }

        *lock(&self.inner.channel) = None;
        self.inner.ingest_active.store(false, Ordering::SeqCst);
        self.inner.ingest_done.notify_waiters();
    }

    /// Receive datagrams on one channel until it closes. Each datagram runs
    /// the whole chain to completion before the next is read, so subscribers
    /// observe envelopes in arrival order.
    async fn drain_channel(
        &self,
        channel: &BoundChannel,
        pipeline: &mut Pipeline,
        buf: &mut [u8],
    ) {
        loop {
            tokio::select! {
                _ = channel.wait_closed() => return,
                result = channel.recv_from(buf) => match result {
                    Ok((size, source)) => {
                        let datagram = Datagram {
                            source,
                            payload: buf[..size].to_vec(),
                        };
                        pipeline.process(datagram, &self.inner.bus).await;
                    }
                    Err(e) => {
                        if channel.is_closed() {
                            return;
                        }
                        warn!("Error receiving datagram: {}", e);
                    }
                },
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    fn local_config() -> ServerConfig {
        ServerConfig {
            restart_delay: Duration::from_millis(100),
            ..ServerConfig::new("127.0.0.1:0".parse().unwrap())
        }
    }

    #[tokio::test]
    async fn start_twice_fails_without_side_effects() {
        let server = DiscoveryServer::new(local_config()).unwrap();
        let channel = server.start().await.unwrap();

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ServerError::AlreadyRunning));
        // The original channel is untouched by the failed start.
        assert!(!channel.is_closed());
        assert_eq!(server.local_addr(), Some(channel.local_addr()));

        server.stop().await;
    }

    #[tokio::test]
    async fn bind_failure_returns_server_to_idle() {
        let occupant = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            listen_addr: occupant.local_addr().unwrap(),
            ..local_config()
        };
        let server = DiscoveryServer::new(config).unwrap();

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert!(!server.is_running());

        // Once the address frees up, start succeeds again.
        drop(occupant);
        let channel = server.start().await.unwrap();
        assert!(!channel.is_closed());
        server.stop().await;
    }

    #[tokio::test]
    async fn stop_flips_state_before_closing_the_channel() {
        let server = DiscoveryServer::new(local_config()).unwrap();
        let channel = server.start().await.unwrap();

        server.stop().await;
        assert!(!server.is_running());
        assert!(channel.is_closed());
        assert!(server.local_addr().is_none());

        // No rebind happens after a deliberate stop.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn stop_when_not_running_is_a_silent_noop() {
        let server = DiscoveryServer::new(local_config()).unwrap();
        server.stop().await;

        server.start().await.unwrap();
        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn unexpected_closure_triggers_one_rebind_after_the_delay() {
        let server = DiscoveryServer::new(local_config()).unwrap();
        let channel = server.start().await.unwrap();
        let first_addr = channel.local_addr();

        // External closure while the server is still supposed to run.
        channel.close();

        // Within the delay window there is no channel yet.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(server.local_addr().is_none());
        assert!(server.is_running());

        let rebound = timeout(Duration::from_secs(2), async {
            loop {
                if let Some(addr) = server.local_addr() {
                    return addr;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server never rebound");

        // Ephemeral listen address, so the rebound port may differ; what
        // matters is that a live channel exists again and packets flow.
        let mut packets = server.incoming_packets();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"after restart", rebound).await.unwrap();

        let envelope = timeout(Duration::from_secs(2), packets.recv())
            .await
            .expect("no envelope after rebind")
            .unwrap();
        assert_eq!(envelope.payload, b"after restart");
        assert_eq!(rebound.ip(), first_addr.ip());

        server.stop().await;
    }

    #[tokio::test]
    async fn fixed_port_rebinds_after_unexpected_closure() {
        // Pick a concrete free port the way an operator's config would.
        let reserved = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let config = ServerConfig {
            listen_addr: addr,
            ..local_config()
        };
        let server = DiscoveryServer::new(config).unwrap();
        let channel = server.start().await.unwrap();
        assert_eq!(channel.local_addr(), addr);

        // The caller keeps its channel handle alive across the closure; the
        // rebind must still get the port back.
        channel.close();

        let rebound = timeout(Duration::from_secs(2), async {
            loop {
                if let Some(addr) = server.local_addr() {
                    return addr;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server never rebound on its fixed port");
        assert_eq!(rebound, addr);

        let mut packets = server.incoming_packets();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"same port", addr).await.unwrap();
        let envelope = timeout(Duration::from_secs(2), packets.recv())
            .await
            .expect("no envelope after fixed-port rebind")
            .unwrap();
        assert_eq!(envelope.payload, b"same port");

        server.stop().await;
        drop(channel);
    }

    #[tokio::test]
    async fn stop_during_restart_delay_shuts_down_cleanly() {
        let config = ServerConfig {
            restart_delay: Duration::from_millis(500),
            ..local_config()
        };
        let server = DiscoveryServer::new(config).unwrap();
        let channel = server.start().await.unwrap();

        channel.close();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // stop() must return even though no channel is currently bound.
        timeout(Duration::from_secs(2), server.stop())
            .await
            .expect("stop hung during restart delay");
        assert!(!server.is_running());

        // And the pending rebind never happens.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn channel_stats_track_received_datagrams() {
        let server = DiscoveryServer::new(local_config()).unwrap();
        let channel = server.start().await.unwrap();
        let addr = channel.local_addr();

        let mut packets = server.incoming_packets();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"12345", addr).await.unwrap();
        timeout(Duration::from_secs(2), packets.recv())
            .await
            .expect("no envelope")
            .unwrap();

        let stats = server.channel_stats().unwrap();
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.bytes_received, 5);

        server.stop().await;
    }
}
