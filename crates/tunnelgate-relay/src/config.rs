//! Relay configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tunnelgate_link::PumpConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("control and data port must differ (both are {0})")]
    SamePort(u16),

    #[error("read buffer size must be greater than zero")]
    ZeroBufferSize,

    #[error("{0} read timeout must be greater than zero")]
    ZeroTimeout(&'static str),
}

/// Listening ports and link tuning for one relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address both listeners bind to
    pub bind_ip: IpAddr,
    /// Port agents dial in on. 0 picks an ephemeral port.
    pub control_port: u16,
    /// Port users dial in on. 0 picks a fresh ephemeral port per agent.
    pub data_port: u16,
    /// Read deadline on the control link; heartbeats must arrive sooner
    pub control_read_timeout: Duration,
    /// Read deadline on the data link
    pub data_read_timeout: Duration,
    /// Largest chunk a single read delivers
    pub read_buffer_size: usize,
    /// Lifecycle events buffered per subscriber
    pub event_capacity: usize,
}

impl RelayConfig {
    pub const DEFAULT_CONTROL_PORT: u16 = 3333;
    pub const DEFAULT_DATA_PORT: u16 = 5200;

    pub fn new(control_port: u16, data_port: u16) -> Self {
        Self {
            control_port,
            data_port,
            ..Self::default()
        }
    }

    pub fn with_bind_ip(mut self, bind_ip: IpAddr) -> Self {
        self.bind_ip = bind_ip;
        self
    }

    pub fn with_control_read_timeout(mut self, timeout: Duration) -> Self {
        self.control_read_timeout = timeout;
        self
    }

    pub fn with_data_read_timeout(mut self, timeout: Duration) -> Self {
        self.data_read_timeout = timeout;
        self
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.control_port)
    }

    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.data_port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control_port != 0 && self.control_port == self.data_port {
            return Err(ConfigError::SamePort(self.control_port));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if self.control_read_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("control"));
        }
        if self.data_read_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("data"));
        }
        Ok(())
    }

    pub(crate) fn control_pump(&self) -> PumpConfig {
        PumpConfig::control()
            .with_read_timeout(self.control_read_timeout)
            .with_buffer_size(self.read_buffer_size)
    }

    pub(crate) fn data_pump(&self) -> PumpConfig {
        PumpConfig::data()
            .with_read_timeout(self.data_read_timeout)
            .with_buffer_size(self.read_buffer_size)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_port: Self::DEFAULT_CONTROL_PORT,
            data_port: Self::DEFAULT_DATA_PORT,
            control_read_timeout: Duration::from_secs(60),
            data_read_timeout: Duration::from_secs(200),
            read_buffer_size: PumpConfig::DEFAULT_BUFFER_SIZE,
            event_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.control_port, 3333);
        assert_eq!(config.data_port, 5200);
        assert_eq!(config.control_read_timeout, Duration::from_secs(60));
        assert_eq!(config.data_read_timeout, Duration::from_secs(200));
        assert_eq!(config.read_buffer_size, 10240);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_same_port_rejected() {
        let config = RelayConfig::new(4000, 4000);
        assert_eq!(config.validate(), Err(ConfigError::SamePort(4000)));
    }

    #[test]
    fn test_ephemeral_ports_allowed() {
        let config = RelayConfig::new(0, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = RelayConfig::default().with_data_read_timeout(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::ZeroTimeout("data")));
    }

    #[test]
    fn test_pump_configs_follow_relay_config() {
        let config = RelayConfig::default()
            .with_control_read_timeout(Duration::from_secs(5))
            .with_data_read_timeout(Duration::from_secs(7));

        let control = config.control_pump();
        assert!(control.answer_heartbeats);
        assert_eq!(control.read_timeout, Duration::from_secs(5));

        let data = config.data_pump();
        assert!(!data.answer_heartbeats);
        assert_eq!(data.read_timeout, Duration::from_secs(7));
    }

    #[test]
    fn test_addresses() {
        let config = RelayConfig::new(3000, 3001).with_bind_ip("127.0.0.1".parse().unwrap());
        assert_eq!(config.control_addr().to_string(), "127.0.0.1:3000");
        assert_eq!(config.data_addr().to_string(), "127.0.0.1:3001");
    }
}
