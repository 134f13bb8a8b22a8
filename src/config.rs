//! Discovery configuration and startup validation.

use std::net::IpAddr;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default port to listen on.
pub const DFLT_PORT: u16 = 47500;
/// Default local port range.
pub const DFLT_PORT_RANGE: u16 = 100;
/// Default timeout for joining topology (0 = unlimited).
pub const DFLT_JOIN_TIMEOUT_MS: u64 = 0;
/// Default network timeout.
pub const DFLT_NETWORK_TIMEOUT_MS: u64 = 5_000;
/// Default heartbeat issuing frequency.
pub const DFLT_HEARTBEAT_FREQUENCY_MS: u64 = 100;
/// Default socket operation timeout for server nodes.
pub const DFLT_SOCK_TIMEOUT_MS: u64 = 200;
/// Default message acknowledgement timeout for server nodes.
pub const DFLT_ACK_TIMEOUT_MS: u64 = 50;
/// Default socket operation timeout for client nodes.
pub const DFLT_SOCK_TIMEOUT_CLIENT_MS: u64 = 700;
/// Default message acknowledgement timeout for client nodes.
pub const DFLT_ACK_TIMEOUT_CLIENT_MS: u64 = 700;
/// Default maximum acknowledgement timeout.
pub const DFLT_MAX_ACK_TIMEOUT_MS: u64 = 10 * 60 * 1_000;
/// Default reconnect attempts count.
pub const DFLT_RECONNECT_COUNT: u32 = 10;
/// Default heartbeats a node can miss before a status check is issued.
pub const DFLT_MAX_MISSED_HEARTBEATS: u32 = 1;
/// Default heartbeats a client can miss before it is failed.
pub const DFLT_MAX_MISSED_CLIENT_HEARTBEATS: u32 = 5;
/// Default address-book clean frequency.
pub const DFLT_ADDRESS_CLEAN_FREQUENCY_MS: u64 = 60 * 1_000;
/// Default statistics print frequency (0 = disabled).
pub const DFLT_STATS_PRINT_FREQUENCY_MS: u64 = 0;
/// Default and minimum size of the topology snapshot history.
pub const DFLT_TOPOLOGY_HISTORY_SIZE: usize = 1_000;
/// Default thread priority hint.
pub const DFLT_THREAD_PRIORITY: u32 = 10;
/// Default upper bound on a single wire frame.
pub const DFLT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
/// Default bound on retained ensure-delivery messages.
pub const DFLT_PENDING_MESSAGES_LIMIT: usize = 1_024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration option {option}: {reason}")]
    Invalid {
        option: &'static str,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(option: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            option,
            reason: reason.into(),
        }
    }
}

/// Discovery runtime configuration.
///
/// All durations are milliseconds. `socket_timeout_ms` and `ack_timeout_ms`
/// left at zero resolve to per-mode defaults at startup (client nodes get
/// the larger client defaults).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Local bind address; `None` selects the first non-loopback interface,
    /// falling back to loopback.
    pub local_address: Option<IpAddr>,
    pub local_port: u16,
    pub local_port_range: u16,
    /// Externally resolvable addresses advertised through the
    /// `disc.tcp.ext-addrs` node attribute.
    pub external_addresses: Vec<SocketAddr>,
    pub heartbeat_frequency_ms: u64,
    pub max_missed_heartbeats: u32,
    pub max_missed_client_heartbeats: u32,
    pub network_timeout_ms: u64,
    pub socket_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub max_ack_timeout_ms: u64,
    pub reconnect_count: u32,
    pub join_timeout_ms: u64,
    /// OS scheduling hint for worker threads; validated and recorded.
    pub thread_priority: u32,
    pub address_clean_frequency_ms: u64,
    pub statistics_print_frequency_ms: u64,
    pub topology_history_size: usize,
    /// Start as a ring member even when the outer configuration asked for
    /// client mode.
    pub force_server_mode: bool,
    /// Client-mode selection handed down from the outer configuration.
    pub client_mode: bool,
    pub max_frame_bytes: usize,
    pub pending_messages_limit: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            local_address: None,
            local_port: DFLT_PORT,
            local_port_range: DFLT_PORT_RANGE,
            external_addresses: Vec::new(),
            heartbeat_frequency_ms: DFLT_HEARTBEAT_FREQUENCY_MS,
            max_missed_heartbeats: DFLT_MAX_MISSED_HEARTBEATS,
            max_missed_client_heartbeats: DFLT_MAX_MISSED_CLIENT_HEARTBEATS,
            network_timeout_ms: DFLT_NETWORK_TIMEOUT_MS,
            socket_timeout_ms: 0,
            ack_timeout_ms: 0,
            max_ack_timeout_ms: DFLT_MAX_ACK_TIMEOUT_MS,
            reconnect_count: DFLT_RECONNECT_COUNT,
            join_timeout_ms: DFLT_JOIN_TIMEOUT_MS,
            thread_priority: DFLT_THREAD_PRIORITY,
            address_clean_frequency_ms: DFLT_ADDRESS_CLEAN_FREQUENCY_MS,
            statistics_print_frequency_ms: DFLT_STATS_PRINT_FREQUENCY_MS,
            topology_history_size: DFLT_TOPOLOGY_HISTORY_SIZE,
            force_server_mode: false,
            client_mode: false,
            max_frame_bytes: DFLT_MAX_FRAME_BYTES,
            pending_messages_limit: DFLT_PENDING_MESSAGES_LIMIT,
        }
    }
}

impl DiscoveryConfig {
    /// Whether this node attaches as a client instead of taking a ring
    /// position.
    pub fn starts_as_client(&self) -> bool {
        self.client_mode && !self.force_server_mode
    }

    /// Resolves the zero-means-default socket timeout for the startup mode.
    pub fn effective_socket_timeout(&self) -> Duration {
        let ms = match (self.socket_timeout_ms, self.starts_as_client()) {
            (0, false) => DFLT_SOCK_TIMEOUT_MS,
            (0, true) => DFLT_SOCK_TIMEOUT_CLIENT_MS,
            (ms, _) => ms,
        };
        Duration::from_millis(ms)
    }

    /// Resolves the zero-means-default ack timeout for the startup mode.
    pub fn effective_ack_timeout(&self) -> Duration {
        let ms = match (self.ack_timeout_ms, self.starts_as_client()) {
            (0, false) => DFLT_ACK_TIMEOUT_MS,
            (0, true) => DFLT_ACK_TIMEOUT_CLIENT_MS,
            (ms, _) => ms,
        };
        Duration::from_millis(ms)
    }

    pub fn heartbeat_frequency(&self) -> Duration {
        Duration::from_millis(self.heartbeat_frequency_ms)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn max_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.max_ack_timeout_ms)
    }

    pub fn join_timeout(&self) -> Option<Duration> {
        match self.join_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_frequency_ms == 0 {
            return Err(ConfigError::invalid("heartbeat_frequency_ms", "must be > 0"));
        }
        if self.network_timeout_ms == 0 {
            return Err(ConfigError::invalid("network_timeout_ms", "must be > 0"));
        }
        if self.local_port <= 1023 {
            return Err(ConfigError::invalid("local_port", "must be > 1023"));
        }
        if u32::from(self.local_port) + u32::from(self.local_port_range) > 0xffff {
            return Err(ConfigError::invalid(
                "local_port_range",
                "local_port + local_port_range must fit in a port number",
            ));
        }
        let ack = self.effective_ack_timeout().as_millis() as u64;
        if self.max_ack_timeout_ms <= ack {
            return Err(ConfigError::invalid(
                "max_ack_timeout_ms",
                format!("must exceed the ack timeout of {ack} ms"),
            ));
        }
        if self.reconnect_count == 0 {
            return Err(ConfigError::invalid("reconnect_count", "must be > 0"));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(ConfigError::invalid("max_missed_heartbeats", "must be > 0"));
        }
        if self.max_missed_client_heartbeats == 0 {
            return Err(ConfigError::invalid(
                "max_missed_client_heartbeats",
                "must be > 0",
            ));
        }
        if self.thread_priority == 0 {
            return Err(ConfigError::invalid("thread_priority", "must be > 0"));
        }
        if self.address_clean_frequency_ms == 0 {
            return Err(ConfigError::invalid(
                "address_clean_frequency_ms",
                "must be > 0",
            ));
        }
        if self.topology_history_size < DFLT_TOPOLOGY_HISTORY_SIZE {
            return Err(ConfigError::invalid(
                "topology_history_size",
                format!("must be >= {DFLT_TOPOLOGY_HISTORY_SIZE}"),
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::invalid("max_frame_bytes", "must be > 0"));
        }
        if self.pending_messages_limit == 0 {
            return Err(ConfigError::invalid("pending_messages_limit", "must be > 0"));
        }

        if self.network_timeout_ms < 3_000 {
            tracing::warn!(
                "network timeout is low (at least 3000 ms recommended): {} ms",
                self.network_timeout_ms
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        DiscoveryConfig::default().validate().unwrap();
    }

    #[test]
    fn client_mode_gets_client_timeouts() {
        let config = DiscoveryConfig {
            client_mode: true,
            ..DiscoveryConfig::default()
        };
        assert_eq!(
            config.effective_ack_timeout(),
            Duration::from_millis(DFLT_ACK_TIMEOUT_CLIENT_MS)
        );
        assert_eq!(
            config.effective_socket_timeout(),
            Duration::from_millis(DFLT_SOCK_TIMEOUT_CLIENT_MS)
        );
    }

    #[test]
    fn force_server_mode_overrides_client_mode() {
        let config = DiscoveryConfig {
            client_mode: true,
            force_server_mode: true,
            ..DiscoveryConfig::default()
        };
        assert!(!config.starts_as_client());
        assert_eq!(
            config.effective_ack_timeout(),
            Duration::from_millis(DFLT_ACK_TIMEOUT_MS)
        );
    }

    #[test]
    fn explicit_timeouts_are_kept() {
        let config = DiscoveryConfig {
            socket_timeout_ms: 450,
            ack_timeout_ms: 90,
            ..DiscoveryConfig::default()
        };
        assert_eq!(config.effective_socket_timeout(), Duration::from_millis(450));
        assert_eq!(config.effective_ack_timeout(), Duration::from_millis(90));
    }

    #[test]
    fn privileged_port_is_rejected() {
        let config = DiscoveryConfig {
            local_port: 80,
            ..DiscoveryConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn port_range_overflow_is_rejected() {
        let config = DiscoveryConfig {
            local_port: 65_000,
            local_port_range: 1_000,
            ..DiscoveryConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn short_history_is_rejected() {
        let config = DiscoveryConfig {
            topology_history_size: 10,
            ..DiscoveryConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn max_ack_timeout_must_exceed_ack() {
        let config = DiscoveryConfig {
            ack_timeout_ms: 500,
            max_ack_timeout_ms: 500,
            ..DiscoveryConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_join_timeout_means_unlimited() {
        assert!(DiscoveryConfig::default().join_timeout().is_none());
        let config = DiscoveryConfig {
            join_timeout_ms: 1_000,
            ..DiscoveryConfig::default()
        };
        assert_eq!(config.join_timeout(), Some(Duration::from_secs(1)));
    }
}
