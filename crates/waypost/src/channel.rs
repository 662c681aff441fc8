//! Bound UDP channel.
//!
//! Thin ownership wrapper around the listening socket. The server creates a
//! fresh channel on every bind and replaces (never reuses) it across
//! restarts. `close` releases the OS socket immediately, so a handle held by
//! the `start` caller never pins the port across a rebind; only an in-flight
//! receive keeps the socket alive for the instant it takes the ingest loop
//! to observe the closure.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// Receive-side statistics for one bound channel.
///
/// Counters reset with every rebind because the channel itself is replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Datagrams received on this channel
    pub packets_received: u64,
    /// Payload bytes received on this channel
    pub bytes_received: u64,
    /// Receive errors observed on this channel
    pub recv_errors: u64,
}

#[derive(Debug)]
struct ChannelShared {
    /// Present until the channel closes; taken on close so the port is
    /// free again before any rebind attempt
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    closed: AtomicBool,
    close_signal: Notify,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    recv_errors: AtomicU64,
}

/// Handle to the bound UDP socket.
///
/// Clones share the same socket; closing any clone closes the channel for
/// all of them. The server hands one clone to the `start` caller, which is
/// also how tests provoke an unexpected closure.
#[derive(Clone, Debug)]
pub struct BoundChannel {
    shared: Arc<ChannelShared>,
}

impl BoundChannel {
    /// Bind a UDP socket on `addr` with the requested kernel receive buffer.
    pub(crate) async fn bind(addr: SocketAddr, recv_buffer_size: usize) -> io::Result<Self> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket = socket2::Socket::new(
            domain,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_recv_buffer_size(recv_buffer_size)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            shared: Arc::new(ChannelShared {
                socket: Mutex::new(Some(Arc::new(socket))),
                local_addr,
                closed: AtomicBool::new(false),
                close_signal: Notify::new(),
                packets_received: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                recv_errors: AtomicU64::new(0),
            }),
        })
    }

    /// Receive one datagram, recording statistics.
    pub(crate) async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let socket = {
            let guard = lock(&self.shared.socket);
            match guard.as_ref() {
                Some(socket) => Arc::clone(socket),
                None => {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "channel closed"));
                }
            }
        };
        match socket.recv_from(buf).await {
            Ok((size, from)) => {
                self.shared.packets_received.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .bytes_received
                    .fetch_add(size as u64, Ordering::Relaxed);
                Ok((size, from))
            }
            Err(e) => {
                self.shared.recv_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Address the socket was bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Close the channel, releasing the OS socket and waking the ingest loop.
    ///
    /// Idempotent. Whether this counts as a normal shutdown or an
    /// unexpected closure is decided by whoever observes it, not here.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        lock(&self.shared.socket).take();
        self.shared.close_signal.notify_waiters();
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Wait until the channel is closed.
    pub(crate) async fn wait_closed(&self) {
        let notified = self.shared.close_signal.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Snapshot of this channel's receive statistics.
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            packets_received: self.shared.packets_received.load(Ordering::Relaxed),
            bytes_received: self.shared.bytes_received.load(Ordering::Relaxed),
            recv_errors: self.shared.recv_errors.load(Ordering::Relaxed),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
