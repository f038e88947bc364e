//! Node and pool configuration types.
//!
//! The host bot framework constructs these directly; there is no config-file
//! loading in this library. Validated constructors catch the configuration
//! errors that must be fatal at startup (bad port, empty password) rather
//! than surfacing later as mysterious connect failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MaestroError, MaestroResult};
use crate::region::region_coordinates;

/// Default session-resume window in seconds.
const DEFAULT_RESUME_TIMEOUT_SECS: u64 = 60;

/// Default node health-check interval in seconds.
const DEFAULT_HEALTH_CHECK_SECS: u64 = 5;

/// Connection parameters and runtime flags for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Hostname or IP of the node.
    pub host: String,
    /// Port the node listens on.
    pub port: u16,
    /// Shared secret sent in the `Authorization` header.
    pub password: String,
    /// Use wss/https instead of ws/http.
    #[serde(default)]
    pub ssl: bool,
    /// Human-readable name; falls back to `host:port` as the identifier.
    #[serde(default)]
    pub name: Option<String>,
    /// Voice region this node is closest to, for region-aware selection.
    #[serde(default)]
    pub region: Option<String>,
    /// Explicit coordinates; override the region table when set.
    #[serde(default)]
    pub coordinates: Option<(f64, f64)>,
    /// Whether this node's process is supervised by the operator.
    ///
    /// Only a managed node is trusted with local filesystem access, and only
    /// a managed node gets a process-restart request when unhealthy.
    #[serde(default)]
    pub managed: bool,
    /// Whether this node is used only for track lookups, never playback.
    #[serde(default)]
    pub search_only: bool,
    /// Sources explicitly disabled for this node.
    #[serde(default)]
    pub disabled_sources: Vec<String>,
    /// Session-resume key; enables resume when set.
    #[serde(default)]
    pub resume_key: Option<String>,
    /// How long the node should retain session state on disconnect.
    #[serde(default = "default_resume_timeout")]
    pub resume_timeout_secs: u64,
    /// Maximum websocket reconnect attempts; -1 = unlimited.
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: i32,
}

fn default_resume_timeout() -> u64 {
    DEFAULT_RESUME_TIMEOUT_SECS
}

fn default_reconnect_attempts() -> i32 {
    -1
}

impl NodeConfig {
    /// Creates a configuration with defaults for everything but the
    /// connection essentials.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
            ssl: false,
            name: None,
            region: None,
            coordinates: None,
            managed: false,
            search_only: false,
            disabled_sources: Vec::new(),
            resume_key: None,
            resume_timeout_secs: DEFAULT_RESUME_TIMEOUT_SECS,
            reconnect_attempts: -1,
        }
    }

    /// Stable identifier for this node within the pool.
    #[must_use]
    pub fn identifier(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }

    /// WebSocket URL for the node connection.
    #[must_use]
    pub fn ws_url(&self) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        format!("{scheme}://{}:{}/", self.host, self.port)
    }

    /// Base URL for the node's REST endpoints.
    #[must_use]
    pub fn rest_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Approximate node coordinates: explicit override first, then the
    /// region table.
    #[must_use]
    pub fn resolved_coordinates(&self) -> Option<(f64, f64)> {
        self.coordinates
            .or_else(|| self.region.as_deref().and_then(region_coordinates))
    }

    /// Validates connection essentials. Fatal at startup when violated.
    pub fn validate(&self) -> MaestroResult<()> {
        if self.host.is_empty() {
            return Err(MaestroError::InvalidConfig("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(MaestroError::InvalidConfig("port must not be 0".into()));
        }
        if self.password.is_empty() {
            return Err(MaestroError::InvalidConfig(
                "password must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Pool-wide configuration shared by every node connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Discord user id of the bot, sent in the `User-Id` handshake header.
    pub user_id: u64,
    /// Value of the `Client-Name` handshake header.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Return players to their original node when it recovers.
    #[serde(default)]
    pub connect_back: bool,
    /// Node health-check interval in seconds.
    #[serde(default = "default_health_check")]
    pub health_check_secs: u64,
    /// Load-result cache capacity (entries).
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Load-result cache TTL in seconds.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

fn default_client_name() -> String {
    concat!("maestro-core/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_health_check() -> u64 {
    DEFAULT_HEALTH_CHECK_SECS
}

fn default_cache_capacity() -> usize {
    512
}

fn default_cache_ttl() -> u64 {
    600
}

impl PoolConfig {
    /// Creates a pool configuration for the given bot user id.
    #[must_use]
    pub fn new(user_id: u64) -> Self {
        Self {
            user_id,
            client_name: default_client_name(),
            connect_back: false,
            health_check_secs: DEFAULT_HEALTH_CHECK_SECS,
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }

    /// Health-check interval as a [`Duration`].
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_prefers_name_over_host_port() {
        let mut config = NodeConfig::new("10.0.0.5", 2333, "secret");
        assert_eq!(config.identifier(), "10.0.0.5:2333");
        config.name = Some("primary".into());
        assert_eq!(config.identifier(), "primary");
    }

    #[test]
    fn urls_respect_ssl_flag() {
        let mut config = NodeConfig::new("node.example", 443, "secret");
        assert_eq!(config.ws_url(), "ws://node.example:443/");
        config.ssl = true;
        assert_eq!(config.ws_url(), "wss://node.example:443/");
        assert_eq!(config.rest_url(), "https://node.example:443");
    }

    #[test]
    fn explicit_coordinates_override_region() {
        let mut config = NodeConfig::new("node.example", 2333, "secret");
        config.region = Some("us-east".into());
        assert!(config.resolved_coordinates().is_some());
        config.coordinates = Some((1.0, 2.0));
        assert_eq!(config.resolved_coordinates(), Some((1.0, 2.0)));
    }

    #[test]
    fn validation_rejects_empty_password() {
        let config = NodeConfig::new("node.example", 2333, "");
        assert!(config.validate().is_err());
        let config = NodeConfig::new("node.example", 0, "secret");
        assert!(config.validate().is_err());
    }
}
