//! Server configuration.

use crate::error::ServerError;
use std::net::SocketAddr;
use std::time::Duration;

/// Default delay before rebinding after an unexpected channel closure.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(5000);

/// Default kernel receive-buffer size requested for the UDP socket.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Default maximum datagram size accepted from the wire.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65_536;

/// Ingestion server configuration.
///
/// Fixed at construction; the server never mutates it. The restart delay is
/// deliberately a flat value with no backoff and no retry ceiling - the
/// server retries forever while it is supposed to be running. Operators who
/// need a gentler failure mode can raise the delay, but retrying is not
/// optional.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Local address the UDP socket binds to
    pub listen_addr: SocketAddr,
    /// Inbound byte-rate limit in bytes per second (0 = unlimited)
    pub traffic_read_limit: u64,
    /// Delay between an unexpected closure and the rebind attempt
    pub restart_delay: Duration,
    /// Kernel receive-buffer size requested at bind time
    pub recv_buffer_size: usize,
    /// Largest datagram the receive loop will accept
    pub max_datagram_size: usize,
}

impl ServerConfig {
    /// Create a configuration for the given listen address with defaults
    /// for everything else.
    #[must_use]
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            traffic_read_limit: 0,
            restart_delay: DEFAULT_RESTART_DELAY,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_datagram_size == 0 {
            return Err(ServerError::InvalidConfig(
                "max_datagram_size must be nonzero".into(),
            ));
        }
        if self.restart_delay.is_zero() {
            return Err(ServerError::InvalidConfig(
                "restart_delay must be nonzero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::new(addr());
        assert!(config.validate().is_ok());
        assert_eq!(config.traffic_read_limit, 0);
        assert_eq!(config.restart_delay, DEFAULT_RESTART_DELAY);
    }

    #[test]
    fn zero_max_datagram_size_rejected() {
        let config = ServerConfig {
            max_datagram_size: 0,
            ..ServerConfig::new(addr())
        };
        assert!(matches!(
            config.validate(),
            Err(ServerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn zero_restart_delay_rejected() {
        let config = ServerConfig {
            restart_delay: Duration::ZERO,
            ..ServerConfig::new(addr())
        };
        assert!(matches!(
            config.validate(),
            Err(ServerError::InvalidConfig(_))
        ));
    }
}
