//! Inbound traffic shaping.
//!
//! Token-bucket throttle over raw inbound bytes. Unlike a drop-based rate
//! limiter, the shaper never discards datagrams - when the bucket runs dry
//! the ingest task sleeps until enough tokens have accumulated, which
//! back-pressures the socket through the kernel receive buffer.

use std::time::Duration;
use tokio::time::Instant;

/// Token bucket throttling inbound bytes to a configured rate.
///
/// Burst capacity is one second's worth of the configured rate. Owned
/// exclusively by the ingest task, so no interior locking is needed.
#[derive(Debug)]
pub(crate) struct TrafficShaper {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TrafficShaper {
    /// Create a shaper for the given rate in bytes per second.
    pub(crate) fn new(bytes_per_sec: u64) -> Self {
        let capacity = bytes_per_sec as f64;
        Self {
            tokens: capacity,
            max_tokens: capacity,
            refill_rate: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + self.refill_rate * elapsed.as_secs_f64()).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Cost of a datagram, clamped to the bucket capacity so that a single
    /// oversized datagram cannot stall the loop forever.
    fn cost(&self, bytes: usize) -> f64 {
        (bytes as f64).min(self.max_tokens)
    }

    /// Consume tokens for `bytes`, sleeping until the bucket can cover them.
    pub(crate) async fn throttle(&mut self, bytes: usize) {
        let cost = self.cost(bytes);
        loop {
            self.refill(Instant::now());
            if self.tokens >= cost {
                self.tokens -= cost;
                return;
            }
            let deficit = cost - self.tokens;
            let wait = Duration::from_secs_f64(deficit / self.refill_rate);
            tokio::time::sleep(wait).await;
        }
    }

    #[cfg(test)]
    fn available(&self) -> f64 {
        self.tokens
    }
}
