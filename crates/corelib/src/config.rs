//! Hub configuration and per-connection settings.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// First port tried when no port is pinned.
pub const DEFAULT_PORT: u16 = 8080;

/// How many ports above [`DEFAULT_PORT`] are tried before giving up.
pub const MAX_PORT_RETRIES: u16 = 99;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default frame payload ceiling in bytes.
pub const DEFAULT_SIZE: usize = 256;

/// Default number of buffered messages per channel.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default number of distinct channels buffered per connection.
pub const DEFAULT_MAX_CHANNELS: usize = 64;

/// Configuration for a [`Hub`](crate::Hub).
///
/// Deserializable so it can be embedded in a larger application config:
///
/// ```json
/// { "port": 9000, "timeout_ms": 500, "size": 64 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Pinned listening port. `None` walks upward from [`DEFAULT_PORT`].
    pub port: Option<u16>,
    /// Address the listener binds to.
    pub bind_address: IpAddr,
    /// Connect, handshake, write and `get` bound, in milliseconds.
    pub timeout_ms: u64,
    /// Frame payload ceiling in bytes.
    pub size: usize,
    /// Per-channel buffer bound; the oldest message is dropped on overflow.
    pub queue_capacity: usize,
    /// Distinct channels a connection buffers at once; frames on further
    /// channels are dropped.
    pub max_channels: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: None,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            timeout_ms: duration_to_millis(DEFAULT_TIMEOUT),
            size: DEFAULT_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_channels: DEFAULT_MAX_CHANNELS,
        }
    }
}

impl HubConfig {
    /// Config with a pinned port and defaults elsewhere.
    pub fn with_port(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Self::default()
        }
    }

    /// Configured timeout, never shorter than one millisecond.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout_ms = duration_to_millis(timeout);
    }

    /// Ports to try when binding, in order.
    pub fn candidate_ports(&self) -> Vec<u16> {
        match self.port {
            Some(port) => vec![port],
            None => (0..=MAX_PORT_RETRIES)
                .filter_map(|offset| DEFAULT_PORT.checked_add(offset))
                .collect(),
        }
    }

    /// Settings a newly created connection would get.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            timeout: self.timeout(),
            size: self.size,
            queue_capacity: self.queue_capacity,
            max_channels: self.max_channels,
        }
    }
}

/// Whole milliseconds in `duration`, rounded up and saturating at
/// `u64::MAX`. Zero stays zero; [`HubConfig::timeout`] applies the floor.
fn duration_to_millis(duration: Duration) -> u64 {
    let millis = duration.as_nanos().div_ceil(1_000_000);
    u64::try_from(millis).unwrap_or(u64::MAX)
}

/// Tuning copied into each connection when it is created.
///
/// Later changes to the hub defaults do not reach existing connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Bound for connect, handshake, writes and `get`.
    pub timeout: Duration,
    /// Maximum payload bytes per data frame.
    pub size: usize,
    /// Per-channel buffer bound.
    pub queue_capacity: usize,
    /// Distinct channels buffered at once.
    pub max_channels: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        HubConfig::default().connection_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = HubConfig::default();
        assert_eq!(config.port, None);
        assert_eq!(config.timeout(), Duration::from_secs(1));
        assert_eq!(config.size, 256);
        assert_eq!(config.queue_capacity, 1024);
    }

    #[test]
    fn pinned_port_has_single_candidate() {
        assert_eq!(HubConfig::with_port(9000).candidate_ports(), vec![9000]);
    }

    #[test]
    fn unpinned_port_walks_upward() {
        let ports = HubConfig::default().candidate_ports();
        assert_eq!(ports.len(), MAX_PORT_RETRIES as usize + 1);
        assert_eq!(ports[0], DEFAULT_PORT);
        assert_eq!(*ports.last().unwrap(), DEFAULT_PORT + MAX_PORT_RETRIES);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: HubConfig =
            serde_json::from_str(r#"{ "port": 9000, "size": 64 }"#).unwrap();
        assert_eq!(config.port, Some(9000));
        assert_eq!(config.size, 64);
        assert_eq!(config.timeout_ms, 1000);
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn settings_snapshot_the_config() {
        let config = HubConfig {
            timeout_ms: 250,
            size: 64,
            ..HubConfig::default()
        };
        let settings = config.connection_settings();
        assert_eq!(settings.timeout, Duration::from_millis(250));
        assert_eq!(settings.size, 64);
        assert_eq!(settings.max_channels, DEFAULT_MAX_CHANNELS);
    }

    #[test]
    fn sub_millisecond_timeout_rounds_up() {
        let mut config = HubConfig::default();
        config.set_timeout(Duration::from_micros(500));
        assert_eq!(config.timeout_ms, 1);
        assert_eq!(config.timeout(), Duration::from_millis(1));

        config.set_timeout(Duration::from_micros(1_500));
        assert_eq!(config.timeout(), Duration::from_millis(2));
    }

    #[test]
    fn huge_timeout_saturates() {
        let mut config = HubConfig::default();
        config.set_timeout(Duration::MAX);
        assert_eq!(config.timeout_ms, u64::MAX);
        assert_eq!(config.timeout(), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn zero_timeout_is_floored() {
        let config = HubConfig {
            timeout_ms: 0,
            ..HubConfig::default()
        };
        assert_eq!(config.timeout(), Duration::from_millis(1));
        assert_eq!(config.connection_settings().timeout, Duration::from_millis(1));
    }
}
