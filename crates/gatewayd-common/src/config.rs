//! Configuration model for GatewayD
//!
//! Every section has serde defaults, so a bare `gatewayd` run works against
//! a local PostgreSQL without any file. Values load from an optional YAML
//! file plus `GATEWAYD__*` environment overrides (`__` separates nesting,
//! e.g. `GATEWAYD__CLIENT__ADDRESS=db:5432`).

use crate::error::{ErrorKind, GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Network family for listeners and upstream clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Udp,
    Unix,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
            Network::Unix => write!(f, "unix"),
        }
    }
}

impl FromStr for Network {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "udp" => Ok(Network::Udp),
            "unix" => Ok(Network::Unix),
            other => Err(GatewayError::new(ErrorKind::CastFailed)
                .with_message(format!("unknown network family: {other}"))),
        }
    }
}

/// How the hook chain reacts to a handler whose output fails verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VerificationPolicy {
    /// Log, keep the previous payload, continue with the next handler
    Ignore,
    /// Log and stop the chain, returning the last valid payload
    Abort,
    /// Log, evict the handler from the registry, continue
    Remove,
    /// Accept the handler output as-is, extra or missing keys included
    #[default]
    PassDown,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Listener network family (tcp or unix; udp is client-only)
    pub network: Network,
    /// Bind address
    pub address: String,
    /// Connection count that triggers a warning (0 disables)
    pub soft_limit: u64,
    /// Connection count that refuses new connections (0 disables)
    pub hard_limit: u64,
    /// Seconds between OnTick hook rounds (0 disables)
    pub tick_interval_secs: u64,
    /// TCP keepalive time for accepted connections, in seconds
    pub tcp_keepalive_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            address: "0.0.0.0:15432".to_string(),
            soft_limit: 0,
            hard_limit: 0,
            tick_interval_secs: 5,
            tcp_keepalive_secs: 30,
        }
    }
}

impl ServerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// Hook chain settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HookSettings {
    /// Verification policy applied to plugin outputs
    pub verification: VerificationPolicy,
    /// Per-hook-invocation deadline in seconds
    pub plugin_timeout_secs: u64,
}

impl Default for HookSettings {
    fn default() -> Self {
        Self {
            verification: VerificationPolicy::PassDown,
            plugin_timeout_secs: 30,
        }
    }
}

impl HookSettings {
    pub fn plugin_timeout(&self) -> Duration {
        Duration::from_secs(self.plugin_timeout_secs)
    }
}

/// Upstream pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of upstream connections established at startup
    pub size: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { size: 10 }
    }
}

/// Proxy settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProxySettings {
    /// Create overflow upstreams on demand when the pool is empty
    pub elastic: bool,
    /// Return overflow upstreams to the pool on close instead of dropping them
    pub reuse_elastic_clients: bool,
}

/// Upstream client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Upstream network family
    pub network: Network,
    /// Upstream address
    pub address: String,
    /// Receive buffer size in bytes
    pub receive_buffer_size: usize,
    /// Write deadline in seconds
    pub send_deadline_secs: u64,
    /// Read deadline in seconds
    pub receive_deadline_secs: u64,
    /// Dial timeout in seconds
    pub dial_timeout_secs: u64,
    /// TCP keepalive time in seconds
    pub tcp_keepalive_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            address: "localhost:5432".to_string(),
            receive_buffer_size: 16 * 1024,
            send_deadline_secs: 10,
            receive_deadline_secs: 10,
            dial_timeout_secs: 10,
            tcp_keepalive_secs: 30,
        }
    }
}

impl ClientSettings {
    pub fn send_deadline(&self) -> Duration {
        Duration::from_secs(self.send_deadline_secs)
    }

    pub fn receive_deadline(&self) -> Duration {
        Duration::from_secs(self.receive_deadline_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

/// TLS settings for the inbound listener upgrade capability
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Upgrade accepted TCP connections to TLS
    pub enabled: bool,
    /// Path to certificate file (PEM)
    pub cert_path: Option<String>,
    /// Path to private key file (PEM)
    pub key_path: Option<String>,
    /// Generate a self-signed certificate when no paths are given
    pub auto_generate: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: None,
            key_path: None,
            auto_generate: true,
        }
    }
}

/// Telemetry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON-formatted logs
    pub json_logs: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Health/metrics HTTP endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Bind address for /health, /ready and /metrics
    pub address: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// A single hook subscription inside a plugin manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookSubscription {
    /// Hook name, e.g. `OnTraffic`
    pub name: String,
    /// Chain rank; lower runs first
    pub priority: i32,
}

/// Declares one out-of-process plugin and the hooks it subscribes to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin name, used in logs
    pub name: String,
    /// gRPC endpoint, e.g. `http://127.0.0.1:9091`
    pub endpoint: String,
    /// Hook subscriptions
    #[serde(default)]
    pub hooks: Vec<HookSubscription>,
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GatewaydConfig {
    pub server: ServerSettings,
    pub hooks: HookSettings,
    pub pool: PoolSettings,
    pub proxy: ProxySettings,
    pub client: ClientSettings,
    pub tls: TlsSettings,
    pub telemetry: TelemetrySettings,
    pub http: HttpSettings,
    pub plugins: Vec<PluginManifest>,
}

impl GatewaydConfig {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(config::Environment::with_prefix("GATEWAYD").separator("__"))
            .build()
            .and_then(|cfg| cfg.try_deserialize())
            .map_err(|err| {
                GatewayError::new(ErrorKind::CastFailed)
                    .with_message(format!("invalid configuration: {err}"))
                    .wrap(err)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewaydConfig::default();
        assert_eq!(config.server.network, Network::Tcp);
        assert_eq!(config.pool.size, 10);
        assert!(!config.proxy.elastic);
        assert_eq!(config.hooks.verification, VerificationPolicy::PassDown);
        assert_eq!(config.client.receive_buffer_size, 16 * 1024);
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn test_network_parse() {
        assert_eq!("tcp".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("UNIX".parse::<Network>().unwrap(), Network::Unix);
        assert!("quic".parse::<Network>().is_err());
    }

    #[test]
    fn test_policy_from_json() {
        let policy: VerificationPolicy = serde_json::from_str("\"Abort\"").unwrap();
        assert_eq!(policy, VerificationPolicy::Abort);
        let policy: VerificationPolicy = serde_json::from_str("\"PassDown\"").unwrap();
        assert_eq!(policy, VerificationPolicy::PassDown);
    }

    #[test]
    fn test_manifest_deserialize() {
        let manifest: PluginManifest = serde_json::from_str(
            r#"{"name": "auditor", "endpoint": "http://127.0.0.1:9091",
                "hooks": [{"name": "OnTraffic", "priority": 10}]}"#,
        )
        .unwrap();
        assert_eq!(manifest.hooks.len(), 1);
        assert_eq!(manifest.hooks[0].priority, 10);
    }
}
