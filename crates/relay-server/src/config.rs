//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`relay.toml`, `/etc/relay/relay.toml`, `~/.config/relay/relay.toml`)
//! - Environment variables (`RELAY_PORT`, `RELAY_UPSTREAM__URL`, `RELAY_AUTH__JWT_SECRET`, ...)
//!
//! Environment variables override the file.

use anyhow::{bail, Context, Result};
use relay_protocol::FeedDialect;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tenvis_relay_core::{LinkConfig, RouterConfig};

/// Environment variable prefix.
const ENV_PREFIX: &str = "RELAY";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Upstream feed configuration.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Archive configuration.
    #[serde(default)]
    pub archive: ArchiveConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent sessions.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum subscriptions per session.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_session: usize,

    /// Maximum inbound client message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound frames buffered per session before new ones are dropped.
    #[serde(default = "default_session_queue_capacity")]
    pub session_queue_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Recommended client heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// How often router statistics are published, in milliseconds.
    #[serde(default = "default_report_interval")]
    pub report_interval_ms: u64,
}

/// Upstream feed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Feed WebSocket URL.
    #[serde(default = "default_upstream_url")]
    pub url: String,

    /// Feed wire dialect.
    #[serde(default)]
    pub dialect: FeedDialect,

    /// Channels requested for every instrument.
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,

    /// Connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Replacement links opened after an unexpected loss.
    #[serde(default = "default_reopen_attempts")]
    pub reopen_attempts: u32,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret for session tokens.
    #[serde(default)]
    pub jwt_secret: String,

    /// Lifetime of issued tokens in seconds.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

/// Archive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Write archivable feed messages to disk.
    #[serde(default)]
    pub enabled: bool,

    /// JSON-lines output file.
    #[serde(default = "default_archive_path")]
    pub path: PathBuf,

    /// Records buffered ahead of the writer.
    #[serde(default = "default_archive_queue")]
    pub queue_capacity: usize,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_session_queue_capacity() -> usize {
    1024
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_report_interval() -> u64 {
    5_000
}

fn default_upstream_url() -> String {
    "wss://ws-feed-public.sandbox.exchange.coinbase.com".to_string()
}

fn default_channels() -> Vec<String> {
    vec!["level2".to_string(), "matches".to_string()]
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_reopen_attempts() -> u32 {
    1
}

fn default_token_ttl() -> u64 {
    3600 // 1 hour
}

fn default_archive_path() -> PathBuf {
    PathBuf::from("relay-archive.jsonl")
}

fn default_archive_queue() -> usize {
    4096
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            upstream: UpstreamConfig::default(),
            auth: AuthConfig::default(),
            archive: ArchiveConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_subscriptions_per_session: default_max_subscriptions(),
            max_message_size: default_max_message_size(),
            session_queue_capacity: default_session_queue_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            report_interval_ms: default_report_interval(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            dialect: FeedDialect::default(),
            channels: default_channels(),
            connect_timeout_ms: default_connect_timeout(),
            reopen_attempts: default_reopen_attempts(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_secs: default_token_ttl(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_archive_path(),
            queue_capacity: default_archive_queue(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, layered with
    /// `RELAY_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment variable has the wrong type.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        let file = config_paths
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        Self::load_layered(file.as_deref())
    }

    /// Load configuration from an optional file plus the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the sources cannot be read or deserialized.
    pub fn load_layered(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(config::File::new(
                &path.to_string_lossy(),
                config::FileFormat::Toml,
            ));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("upstream.channels"),
        );

        let config: Config = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        if let Some(path) = file {
            tracing::info!("Loaded configuration from {}", path.display());
        }
        Ok(config)
    }

    /// Reject settings the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            bail!("auth.jwt_secret must be set (RELAY_AUTH__JWT_SECRET)");
        }
        if self.limits.session_queue_capacity == 0 {
            bail!("limits.session_queue_capacity must be greater than zero");
        }
        if self.archive.enabled && self.archive.queue_capacity == 0 {
            bail!("archive.queue_capacity must be greater than zero");
        }
        if self.upstream.url.is_empty() {
            bail!("upstream.url must be set");
        }
        if !self.transport.websocket_path.starts_with('/') {
            bail!("transport.websocket_path must start with '/'");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Router settings derived from this configuration.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            max_subscriptions_per_session: self.limits.max_subscriptions_per_session,
            reopen_attempts: self.upstream.reopen_attempts,
            link: LinkConfig {
                dialect: self.upstream.dialect,
                channels: self.upstream.channels.clone(),
                connect_timeout: Duration::from_millis(self.upstream.connect_timeout_ms),
            },
            ..RouterConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> Config {
        let mut config = Config::default();
        config.auth.jwt_secret = "secret".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.upstream.dialect, FeedDialect::Coinbase);
        assert_eq!(config.upstream.channels, vec!["level2", "matches"]);
        assert_eq!(config.upstream.reopen_attempts, 1);
        assert!(!config.archive.enabled);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 3000);

        let config = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 50000

            [upstream]
            url = "ws://localhost:7000"
            dialect = "generic"
            channels = ["trades"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.session_queue_capacity, 1024);
        assert_eq!(config.upstream.dialect, FeedDialect::Generic);
        assert_eq!(config.upstream.connect_timeout_ms, 10_000);
    }

    #[test]
    fn test_load_layered_reads_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "port = 4100\n[auth]\njwt_secret = \"from-file\"\n[archive]\nenabled = true"
        )
        .unwrap();

        let config = Config::load_layered(Some(file.path())).unwrap();
        assert_eq!(config.port, 4100);
        assert_eq!(config.auth.jwt_secret, "from-file");
        assert!(config.archive.enabled);
        assert_eq!(config.heartbeat.interval_ms, 30_000);

        let direct: Config =
            toml::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(direct.port, config.port);
        assert_eq!(direct.auth.jwt_secret, config.auth.jwt_secret);
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());
        assert!(Config::default().validate().is_err());

        let mut config = valid();
        config.limits.session_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.archive.enabled = true;
        config.archive.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.transport.websocket_path = "ws".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_router_config_mapping() {
        let mut config = valid();
        config.limits.max_subscriptions_per_session = 7;
        config.upstream.connect_timeout_ms = 250;
        config.upstream.reopen_attempts = 3;

        let router = config.router_config();
        assert_eq!(router.max_subscriptions_per_session, 7);
        assert_eq!(router.reopen_attempts, 3);
        assert_eq!(router.link.connect_timeout, Duration::from_millis(250));
        assert_eq!(router.link.channels, vec!["level2", "matches"]);
    }
}
