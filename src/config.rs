// src/config.rs

//! Manages server configuration: loading, resolving dynamic values, and validation.
//!
//! Mirrors the teacher's `RawConfig` staging-struct pattern: a permissive
//! `serde` shape is deserialized from TOML first, then lowered into the
//! `Config` the rest of the crate consumes, with defaults filled in and
//! cross-field validation applied once, in `from_file`.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::admin::AdminCredentials;
use crate::core::proxy::config_doc::PoolDefaults;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8878
}

/// The admin user's credentials, if an admin surface is configured.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AdminConfig {
    pub username: String,
    pub password: String,
}

/// Front cache / downstream tuning shared across every bootstrap pool,
/// resolved into `core::proxy::config_doc::PoolDefaults` at startup. Kept
/// as a distinct serde shape since `PoolDefaults` carries `Duration`s the
/// wire format expresses as plain milliseconds.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PoolDefaultsConfig {
    #[serde(default = "default_front_cache_size")]
    pub front_cache_size: usize,
    #[serde(default)]
    pub admission_spec: String,
    #[serde(default)]
    pub admission_unspec: String,
    /// Comma-separated prefixes eligible for SET-optimization (§4.E): a
    /// matching SET replies STORED to the upstream immediately while the
    /// downstream write proceeds asynchronously.
    #[serde(default)]
    pub optimize_set_spec: String,
    #[serde(default)]
    pub optimize_set_unspec: String,
    #[serde(default)]
    pub honor_flush_delay: bool,
    #[serde(default = "default_max_concurrent_downstream")]
    pub max_concurrent_downstream: usize,
    #[serde(default = "default_key_stats_capacity")]
    pub key_stats_capacity: usize,
    #[serde(default = "default_wait_queue_timeout_ms")]
    pub wait_queue_timeout_ms: u64,
    #[serde(default = "default_downstream_timeout_ms")]
    pub downstream_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_connect_max_errors")]
    pub connect_max_errors: u32,
    #[serde(default = "default_connect_retry_interval_ms")]
    pub connect_retry_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// How long a front-cache entry stays live after insertion (§8 scenario
    /// 4 relies on this being configurable down to the low hundreds of ms).
    #[serde(default = "default_front_cache_lifespan_ms")]
    pub front_cache_lifespan_ms: u64,
}

fn default_front_cache_size() -> usize {
    4096
}
fn default_front_cache_lifespan_ms() -> u64 {
    30_000
}
fn default_max_concurrent_downstream() -> usize {
    64
}
fn default_key_stats_capacity() -> usize {
    1024
}
fn default_wait_queue_timeout_ms() -> u64 {
    2500
}
fn default_downstream_timeout_ms() -> u64 {
    2500
}
fn default_connect_timeout_ms() -> u64 {
    1000
}
fn default_connect_max_errors() -> u32 {
    3
}
fn default_connect_retry_interval_ms() -> u64 {
    1000
}
fn default_max_retries() -> u32 {
    2
}

impl Default for PoolDefaultsConfig {
    fn default() -> Self {
        Self {
            front_cache_size: default_front_cache_size(),
            admission_spec: String::new(),
            admission_unspec: String::new(),
            optimize_set_spec: String::new(),
            optimize_set_unspec: String::new(),
            honor_flush_delay: false,
            max_concurrent_downstream: default_max_concurrent_downstream(),
            key_stats_capacity: default_key_stats_capacity(),
            wait_queue_timeout_ms: default_wait_queue_timeout_ms(),
            downstream_timeout_ms: default_downstream_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_max_errors: default_connect_max_errors(),
            connect_retry_interval_ms: default_connect_retry_interval_ms(),
            max_retries: default_max_retries(),
            front_cache_lifespan_ms: default_front_cache_lifespan_ms(),
        }
    }
}

impl PoolDefaultsConfig {
    pub fn resolve(&self) -> PoolDefaults {
        PoolDefaults {
            front_cache_size: self.front_cache_size,
            admission_spec: self.admission_spec.clone(),
            admission_unspec: self.admission_unspec.clone(),
            optimize_set_spec: self.optimize_set_spec.clone(),
            optimize_set_unspec: self.optimize_set_unspec.clone(),
            honor_flush_delay: self.honor_flush_delay,
            max_concurrent_downstream: self.max_concurrent_downstream,
            key_stats_capacity: self.key_stats_capacity,
            wait_queue_timeout: Duration::from_millis(self.wait_queue_timeout_ms),
            downstream_timeout: Duration::from_millis(self.downstream_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            connect_max_errors: self.connect_max_errors,
            connect_retry_interval: Duration::from_millis(self.connect_retry_interval_ms),
            max_retries: self.max_retries,
            front_cache_lifespan: Duration::from_millis(self.front_cache_lifespan_ms),
        }
    }
}

/// Raw, permissive deserialization target for the TOML config file. Lowered
/// into `Config` (with validation) by `Config::from_file`.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_worker_count")]
    worker_count: usize,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    admin: Option<AdminConfig>,
    #[serde(default = "default_engine_module_path")]
    engine_module_path: PathBuf,
    #[serde(default)]
    metrics: MetricsConfig,
    #[serde(default)]
    pool_defaults: PoolDefaultsConfig,
    /// The flat `pools`/`pool-<name>`/`svr-<name>` bootstrap form (spec.md
    /// §6's kv-config alternative), applied once at startup via
    /// `ReconfigPipeline::apply_kv_config`.
    #[serde(default)]
    bootstrap: HashMap<String, String>,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            worker_count: default_worker_count(),
            log_level: default_log_level(),
            admin: None,
            engine_module_path: default_engine_module_path(),
            metrics: MetricsConfig::default(),
            pool_defaults: PoolDefaultsConfig::default(),
            bootstrap: HashMap::new(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    11211
}
fn default_worker_count() -> usize {
    4
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_engine_module_path() -> PathBuf {
    PathBuf::from("./engines")
}

/// Represents the final, validated, and resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host the base listener binds to. Also used as the bind host for every
    /// bootstrap pool's own listener.
    pub host: String,
    /// The base listener's port: binary admin opcodes and bucket
    /// pass-through data commands are served here.
    pub port: u16,
    pub worker_count: usize,
    pub log_level: String,
    pub admin: Option<AdminConfig>,
    pub engine_module_path: PathBuf,
    pub metrics: MetricsConfig,
    pub pool_defaults: PoolDefaultsConfig,
    pub bootstrap: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        RawConfig::default().into()
    }
}

impl From<RawConfig> for Config {
    fn from(raw: RawConfig) -> Self {
        Self {
            host: raw.host,
            port: raw.port,
            worker_count: raw.worker_count,
            log_level: raw.log_level,
            admin: raw.admin,
            engine_module_path: raw.engine_module_path,
            metrics: raw.metrics,
            pool_defaults: raw.pool_defaults,
            bootstrap: raw.bootstrap,
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        let config: Config = raw.into();
        config.validate()?;
        Ok(config)
    }

    /// Builds a `Config` straight from defaults, used by tests and by
    /// `--port`-only invocations that skip a config file entirely.
    pub fn bootstrap_default() -> Self {
        Config::default()
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.worker_count == 0 {
            return Err(anyhow!("worker_count cannot be 0"));
        }
        if let Some(admin) = &self.admin
            && admin.username.trim().is_empty()
        {
            return Err(anyhow!("admin.username cannot be empty when [admin] is set"));
        }
        if self.metrics.enabled && self.metrics.port == self.port {
            warn!("metrics port is the same as the base listener port; this is almost certainly a misconfiguration");
        }
        Ok(())
    }

    pub fn admin_credentials(&self) -> Option<AdminCredentials> {
        self.admin.as_ref().map(|a| AdminCredentials {
            username: a.username.clone(),
            password: a.password.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut config = Config::default();
        config.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_resolves_admin_and_bootstrap_pools() {
        let raw = r#"
            host = "0.0.0.0"
            port = 12000
            worker_count = 2

            [admin]
            username = "ops"
            password = "secret"

            [bootstrap]
            pools = "a"
            pool-a = "11311 ketama"
            svr-a = "127.0.0.1:11211"
        "#;
        let raw_config: RawConfig = toml::from_str(raw).unwrap();
        let config: Config = raw_config.into();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 12000);
        assert_eq!(config.admin_credentials().unwrap().username, "ops");
        assert_eq!(config.bootstrap.get("pools"), Some(&"a".to_string()));
    }

    #[test]
    fn from_file_reads_and_validates_a_toml_config_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hivecache.toml");
        std::fs::write(&path, "host = \"127.0.0.1\"\nport = 11311\nworker_count = 3\n").unwrap();

        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.port, 11311);
        assert_eq!(config.worker_count, 3);
    }

    #[test]
    fn from_file_rejects_a_config_that_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hivecache.toml");
        std::fs::write(&path, "port = 0\n").unwrap();

        assert!(Config::from_file(path.to_str().unwrap()).is_err());
    }
}
