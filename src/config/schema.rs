//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default number of connections allowed per route when none is configured.
pub const DEFAULT_MAX_PER_ROUTE: usize = 200;

/// Root configuration for the client.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// Connection pool limits and timeouts.
    pub pool: PoolConfig,

    /// Socket-level options for new connections.
    pub transport: TransportConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Per-route connection limits keyed by `"host:port"`.
    pub max_per_route: HashMap<String, usize>,

    /// Limit applied to routes absent from `max_per_route`.
    pub default_max_per_route: usize,

    /// Max time to wait for a pooled connection, also bounds TCP connect.
    pub connect_timeout_ms: u64,

    /// Max idle time for a connection before it is closed.
    pub idle_timeout_ms: u64,

    /// When true, an exhausted route fails instead of forcing an extra connection.
    pub forbid_force_connect: bool,
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_route: HashMap::new(),
            default_max_per_route: DEFAULT_MAX_PER_ROUTE,
            connect_timeout_ms: 5_000,
            idle_timeout_ms: 60_000,
            forbid_force_connect: false,
        }
    }
}

/// Transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Set `TCP_NODELAY` on new sockets.
    pub tcp_nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { tcp_nodelay: true }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
