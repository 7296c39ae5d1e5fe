//! Configuration loading for the Burrow edge gateway.
//!
//! Kept dependency-light so every crate in the workspace can import it
//! without dragging the server stack along.
//!
//! # Load order (later wins)
//!
//! 1. Compiled defaults
//! 2. `/etc/burrow/config.toml` (system)
//! 3. `~/.config/burrow/config.toml` (user)
//! 4. `./burrow.toml` (local, or the `--config` path)
//! 5. Environment variables (`HOST`, `PORT`, `STORE_HOST`, ...)
//!
//! The environment names are the gateway's public knobs and are applied
//! through [`overlay_env_from`] so they can be exercised in tests without
//! mutating process state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Where config values came from, for startup logging.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order).
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values.
    pub env_overrides: Vec<String>,
}

/// Public HTTP/WebSocket bind address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    /// Default: 0.0.0.0
    #[serde(default = "BindConfig::default_host")]
    pub host: String,

    /// Default: 8080
    #[serde(default = "BindConfig::default_port")]
    pub port: u16,
}

impl BindConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        8080
    }

    /// `host:port` string suitable for a listener bind.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
        }
    }
}

/// Tunnel protocol limits and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Largest text frame accepted or produced, in UTF-8 bytes.
    /// Default: 65536 (64 KiB)
    #[serde(default = "TunnelConfig::default_max_ws_payload_bytes")]
    pub max_ws_payload_bytes: usize,

    /// Hard deadline for one forwarded request, end to end.
    /// Default: 30
    #[serde(default = "TunnelConfig::default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// Interval between application-level pings to an agent.
    /// Default: 10
    #[serde(default = "TunnelConfig::default_ws_ping_interval_seconds")]
    pub ws_ping_interval_seconds: u64,

    /// Grace period after a ping before the pong deadline is checked.
    /// Default: 5
    #[serde(default = "TunnelConfig::default_ws_pong_timeout_seconds")]
    pub ws_pong_timeout_seconds: u64,

    /// TTL on `tunnel:{id}` ownership records in the shared store.
    /// Default: 300
    #[serde(default = "TunnelConfig::default_registry_ttl_seconds")]
    pub registry_ttl_seconds: u64,

    /// TTL on cached `slug:{slug}` resolutions.
    /// Default: 60
    #[serde(default = "TunnelConfig::default_slug_cache_ttl_seconds")]
    pub slug_cache_ttl_seconds: u64,
}

impl TunnelConfig {
    fn default_max_ws_payload_bytes() -> usize {
        64 * 1024
    }

    fn default_request_timeout_seconds() -> u64 {
        30
    }

    fn default_ws_ping_interval_seconds() -> u64 {
        10
    }

    fn default_ws_pong_timeout_seconds() -> u64 {
        5
    }

    fn default_registry_ttl_seconds() -> u64 {
        300
    }

    fn default_slug_cache_ttl_seconds() -> u64 {
        60
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ws_ping_interval_seconds)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_pong_timeout_seconds)
    }

    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.registry_ttl_seconds)
    }

    pub fn slug_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.slug_cache_ttl_seconds)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_ws_payload_bytes: Self::default_max_ws_payload_bytes(),
            request_timeout_seconds: Self::default_request_timeout_seconds(),
            ws_ping_interval_seconds: Self::default_ws_ping_interval_seconds(),
            ws_pong_timeout_seconds: Self::default_ws_pong_timeout_seconds(),
            registry_ttl_seconds: Self::default_registry_ttl_seconds(),
            slug_cache_ttl_seconds: Self::default_slug_cache_ttl_seconds(),
        }
    }
}

/// Shared key-value store (Redis) connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Default: localhost
    #[serde(default = "StoreConfig::default_host")]
    pub host: String,

    /// Default: 6379
    #[serde(default = "StoreConfig::default_port")]
    pub port: u16,

    /// Default: 0
    #[serde(default)]
    pub db: u32,

    /// No default; unauthenticated when absent.
    #[serde(default)]
    pub password: Option<String>,
}

impl StoreConfig {
    fn default_host() -> String {
        "localhost".to_string()
    }

    fn default_port() -> u16 {
        6379
    }

    /// Connection URL in the form `redis://[:password@]host:port/db`.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            db: 0,
            password: None,
        }
    }
}

/// Control Plane endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Base URL of the Control Plane API.
    /// Default: http://localhost:8000
    #[serde(default = "ControlPlaneConfig::default_url")]
    pub url: String,

    /// Per-request timeout. The client never retries; callers decide.
    /// Default: 10
    #[serde(default = "ControlPlaneConfig::default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl ControlPlaneConfig {
    fn default_url() -> String {
        "http://localhost:8000".to_string()
    }

    fn default_timeout_seconds() -> u64 {
        10
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            timeout_seconds: Self::default_timeout_seconds(),
        }
    }
}

/// Logging and trace export settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (trace, debug, info, warn, error).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,

    /// OTLP gRPC endpoint for trace export. Plain fmt logging when unset.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            otlp_endpoint: None,
        }
    }
}

/// Complete edge gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub control_plane: ControlPlaneConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl EdgeConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, optionally pinning the local file to `config_path`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report where values came from.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in discover_config_files(config_path) {
            let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileRead {
                path: path.clone(),
                source: e,
            })?;
            let table: toml::Table =
                contents
                    .parse()
                    .map_err(|e: toml::de::Error| ConfigError::Parse {
                        path: path.clone(),
                        message: e.to_string(),
                    })?;
            merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config: EdgeConfig =
            merged
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::Parse {
                    path: sources
                        .files
                        .last()
                        .cloned()
                        .unwrap_or_else(|| PathBuf::from("burrow.toml")),
                    message: e.to_string(),
                })?;

        overlay_env_from(&mut config, &mut sources.env_overrides, |name| {
            std::env::var(name).ok()
        });

        Ok((config, sources))
    }

    /// Serialize the effective configuration back to TOML.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

/// Discover config files in standard locations, in load order.
///
/// Only returns files that exist. A CLI path replaces the local override.
fn discover_config_files(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/burrow/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("burrow/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("burrow.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Recursively merge `overlay` into `base`; overlay values win.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply the gateway's environment knobs on top of `config`.
///
/// `lookup` abstracts `std::env::var` so the overlay is testable. Names
/// that were applied are recorded in `applied`. Unparseable numeric values
/// are ignored rather than failing startup.
pub fn overlay_env_from<F>(config: &mut EdgeConfig, applied: &mut Vec<String>, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    fn take<F: Fn(&str) -> Option<String>>(
        lookup: &F,
        applied: &mut Vec<String>,
        name: &str,
    ) -> Option<String> {
        let value = lookup(name)?;
        applied.push(name.to_string());
        Some(value)
    }

    fn take_parsed<T: std::str::FromStr, F: Fn(&str) -> Option<String>>(
        lookup: &F,
        applied: &mut Vec<String>,
        name: &str,
    ) -> Option<T> {
        let value = lookup(name)?.parse().ok()?;
        applied.push(name.to_string());
        Some(value)
    }

    if let Some(v) = take(&lookup, applied, "HOST") {
        config.bind.host = v;
    }
    if let Some(v) = take_parsed(&lookup, applied, "PORT") {
        config.bind.port = v;
    }

    if let Some(v) = take_parsed(&lookup, applied, "MAX_WS_PAYLOAD_BYTES") {
        config.tunnel.max_ws_payload_bytes = v;
    }
    if let Some(v) = take_parsed(&lookup, applied, "REQUEST_TIMEOUT_SECONDS") {
        config.tunnel.request_timeout_seconds = v;
    }
    if let Some(v) = take_parsed(&lookup, applied, "WS_PING_INTERVAL_SECONDS") {
        config.tunnel.ws_ping_interval_seconds = v;
    }
    if let Some(v) = take_parsed(&lookup, applied, "WS_PONG_TIMEOUT_SECONDS") {
        config.tunnel.ws_pong_timeout_seconds = v;
    }
    if let Some(v) = take_parsed(&lookup, applied, "TUNNEL_REGISTRY_TTL") {
        config.tunnel.registry_ttl_seconds = v;
    }
    if let Some(v) = take_parsed(&lookup, applied, "SLUG_CACHE_TTL") {
        config.tunnel.slug_cache_ttl_seconds = v;
    }

    if let Some(v) = take(&lookup, applied, "STORE_HOST") {
        config.store.host = v;
    }
    if let Some(v) = take_parsed(&lookup, applied, "STORE_PORT") {
        config.store.port = v;
    }
    if let Some(v) = take_parsed(&lookup, applied, "STORE_DB") {
        config.store.db = v;
    }
    if let Some(v) = take(&lookup, applied, "STORE_PASSWORD") {
        config.store.password = Some(v);
    }

    if let Some(v) = take(&lookup, applied, "CONTROL_PLANE_URL") {
        config.control_plane.url = v;
    }

    if let Some(v) = take(&lookup, applied, "LOG_LEVEL") {
        config.telemetry.log_level = v;
    }
    // Standard names also honored
    if let Some(v) = take(&lookup, applied, "RUST_LOG") {
        config.telemetry.log_level = v;
    }
    if let Some(v) = take(&lookup, applied, "OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
    }
}
