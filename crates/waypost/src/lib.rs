//! # waypost
//!
//! Restartable UDP packet ingestion server used as the transport layer for
//! a peer-discovery protocol.
//!
//! This crate provides:
//! - Server lifecycle with an atomic single-start guarantee
//! - An ordered, per-bind handler chain over raw datagrams
//! - Optional inbound traffic shaping (token bucket, throttle not drop)
//! - A replay-latest broadcast stream of decoded envelopes
//! - Automatic rebind after an unexpected channel closure
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                       DiscoveryServer                          │
//! │        (start/stop lifecycle, rebind-on-closure loop)          │
//! ├────────────────────────────────────────────────────────────────┤
//! │                          Pipeline                              │
//! │   shaper? → trace → caller handlers → decoder → packet bus     │
//! ├────────────────────────────────────────────────────────────────┤
//! │                        BoundChannel                            │
//! │          (one UDP socket, replaced on every rebind)            │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The server moves bytes; it never interprets them. Protocol logic lives
//! behind the [`Decoder`] seam and in whatever subscribes to
//! [`DiscoveryServer::incoming_packets`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod channel;
pub mod config;
pub mod decode;
pub mod envelope;
pub mod error;
pub mod handler;
mod pipeline;
pub mod server;
mod shaper;

pub use bus::{PacketBus, PacketStream};
pub use channel::{BoundChannel, ChannelStats};
pub use config::ServerConfig;
pub use decode::{Decoder, EnvelopeDecoder};
pub use envelope::Envelope;
pub use error::{DecodeError, ServerError};
pub use handler::{Datagram, PacketHandler, Verdict};
pub use server::DiscoveryServer;
