use std::net::{Ipv4Addr, SocketAddr};

use serde::Deserialize;

use crate::error::Result;
use crate::protocol::TypeId;

/// Configuration for [`TcpServer`](super::TcpServer).
///
/// ## Socket options
///
/// - `no_delay`: disables Nagle's algorithm on accepted sockets (default on)
///
/// ## Limits
///
/// - `buffer_size`: size of the pooled scratch buffer used for each read
/// - `max_connections`: connections beyond this are accepted and closed
///   immediately (`None` for unlimited)
/// - `read_rate_bps`: per-connection inbound byte rate; reads pause and are
///   retried every `throttle_retry_ms` while the budget is exhausted
/// - `forbidden_protocols`: registered types this server refuses
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: SocketAddr,
    pub buffer_size: usize,
    pub max_connections: Option<usize>,
    pub no_delay: bool,
    pub read_rate_bps: Option<u64>,
    pub throttle_retry_ms: u64,
    pub forbidden_protocols: Vec<TypeId>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            buffer_size: 8192,
            max_connections: None,
            no_delay: true,
            read_rate_bps: None,
            throttle_retry_ms: 50,
            forbidden_protocols: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }
}

/// Builder for [`ServerConfig`]. Unset fields keep their defaults.
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.config.address = address;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = Some(max);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.config.no_delay = enabled;
        self
    }

    pub fn read_rate_bps(mut self, rate: u64) -> Self {
        self.config.read_rate_bps = Some(rate);
        self
    }

    pub fn throttle_retry_ms(mut self, retry: u64) -> Self {
        self.config.throttle_retry_ms = retry;
        self
    }

    pub fn forbid(mut self, type_id: TypeId) -> Self {
        self.config.forbidden_protocols.push(type_id);
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml() {
        let config = ServerConfig::from_toml_str(
            r#"
            address = "0.0.0.0:9000"
            max_connections = 10
            read_rate_bps = 4096
            forbidden_protocols = [3, 4]
            "#,
        )
        .unwrap();

        assert_eq!(config.address.port(), 9000);
        assert_eq!(config.max_connections, Some(10));
        assert_eq!(config.read_rate_bps, Some(4096));
        assert_eq!(config.forbidden_protocols, vec![3, 4]);
        assert_eq!(config.buffer_size, 8192);
        assert!(config.no_delay);
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::builder()
            .buffer_size(1024)
            .no_delay(false)
            .forbid(9)
            .build();

        assert_eq!(config.buffer_size, 1024);
        assert!(!config.no_delay);
        assert_eq!(config.forbidden_protocols, vec![9]);
        assert_eq!(config.max_connections, None);
    }
}
