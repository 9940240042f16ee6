//! Configuration for the ingest worker

use crate::retry::RetryPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default config file, read when present
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Worker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote platform API
    pub platform: PlatformConfig,

    /// Supervisor and consumer settings
    pub worker: WorkerConfig,

    /// Prometheus exporter
    pub telemetry: TelemetryConfig,

    /// Retry policy
    pub retry: RetryPolicy,
}

/// Remote platform API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Base URL
    pub url: String,

    /// API token
    pub token: String,

    /// Verify TLS certificates
    pub ssl_verify: bool,

    /// Per-request timeout (seconds)
    pub request_timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:4000".to_string(),
            token: String::new(),
            ssl_verify: false,
            request_timeout_secs: 300,
        }
    }
}

/// Supervisor and consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Log level used when RUST_LOG is unset
    pub log_level: String,

    /// Emit JSON log lines
    pub json_logging: bool,

    /// Registry polling interval (seconds)
    pub poll_interval_secs: u64,

    /// Sleep after a failed registry fetch (seconds)
    pub registry_backoff_secs: u64,

    /// Liveness probe interval per consumer (seconds)
    pub liveness_interval_secs: u64,

    /// Time granted to in-flight messages on shutdown (seconds)
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: true,
            poll_interval_secs: 60,
            registry_backoff_secs: 60,
            liveness_interval_secs: 30,
            shutdown_grace_secs: 30,
        }
    }
}

impl WorkerConfig {
    /// Registry polling interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Backoff after a failed registry fetch
    pub fn registry_backoff(&self) -> Duration {
        Duration::from_secs(self.registry_backoff_secs)
    }

    /// Liveness probe interval
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    /// Shutdown grace period
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Serve /metrics
    pub enabled: bool,

    /// Listen host
    pub prometheus_host: String,

    /// Listen port
    pub prometheus_port: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prometheus_host: "0.0.0.0".to_string(),
            prometheus_port: 14270,
        }
    }
}

impl TelemetryConfig {
    /// Listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.prometheus_host, self.prometheus_port)
    }
}

impl Config {
    /// Load `.env`, the config file (if any) and environment overrides
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = std::env::var("WORKER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        let mut config = if Path::new(&path).is_file() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply overrides from a variable lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("PLATFORM_URL") {
            self.platform.url = url;
        }
        if let Some(token) = lookup("PLATFORM_TOKEN") {
            self.platform.token = token;
        }
        if let Some(value) = lookup("PLATFORM_SSL_VERIFY") {
            self.platform.ssl_verify = parse_bool("PLATFORM_SSL_VERIFY", &value)?;
        }
        if let Some(level) = lookup("WORKER_LOG_LEVEL") {
            self.worker.log_level = level;
        }
        if let Some(value) = lookup("WORKER_JSON_LOGGING") {
            self.worker.json_logging = parse_bool("WORKER_JSON_LOGGING", &value)?;
        }
        if let Some(value) = lookup("WORKER_TELEMETRY_ENABLED") {
            self.telemetry.enabled = parse_bool("WORKER_TELEMETRY_ENABLED", &value)?;
        }
        if let Some(host) = lookup("WORKER_PROMETHEUS_TELEMETRY_HOST") {
            self.telemetry.prometheus_host = host;
        }
        if let Some(value) = lookup("WORKER_PROMETHEUS_TELEMETRY_PORT") {
            self.telemetry.prometheus_port = value.parse().map_err(|_| {
                Error::Config(format!("WORKER_PROMETHEUS_TELEMETRY_PORT: invalid port {}", value))
            })?;
        }
        Ok(())
    }

    /// Reject configurations the worker cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.platform.url.trim().is_empty() {
            return Err(Error::Config("platform url is required".to_string()));
        }
        if self.platform.token.trim().is_empty() {
            return Err(Error::Config("platform token is required".to_string()));
        }
        if self.worker.poll_interval_secs == 0 {
            return Err(Error::Config("poll interval must be positive".to_string()));
        }
        if self.worker.liveness_interval_secs == 0 {
            return Err(Error::Config("liveness interval must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{}: expected a boolean, got {}", key, value))),
    }
}
