//! Configuration management.
//!
//! Configuration comes from a TOML file plus a handful of environment
//! overrides (`LEXBRIDGE_*`) for the values that differ per deployment:
//! service URLs, credentials and the database path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connectors::RetryPolicy;
use crate::engine::RateLimitConfig;
use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "ServiceConfig::paperless_defaults")]
    pub paperless: ServiceConfig,
    #[serde(default = "ServiceConfig::lexoffice_defaults")]
    pub lexoffice: ServiceConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            paperless: ServiceConfig::paperless_defaults(),
            lexoffice: ServiceConfig::lexoffice_defaults(),
            engine: EngineConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database; defaults to `lexbridge.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("lexbridge.db"))
    }
}

/// Per-service connection and rate-limit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_token: String,
    /// Sustained outbound request rate. 0 means effectively unconstrained.
    #[serde(default)]
    pub requests_per_second: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_burst() -> u32 {
    2
}

impl ServiceConfig {
    /// Paperless is self-hosted and effectively unconstrained.
    pub fn paperless_defaults() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_token: String::new(),
            requests_per_second: 0,
            burst: default_burst(),
        }
    }

    /// Lexoffice enforces 2 requests per second.
    pub fn lexoffice_defaults() -> Self {
        Self {
            base_url: "https://api.lexware.io".to_string(),
            api_token: String::new(),
            requests_per_second: 2,
            burst: 2,
        }
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        if self.requests_per_second == 0 {
            RateLimitConfig::unconstrained()
        } else {
            RateLimitConfig::per_second(self.requests_per_second, self.burst)
        }
    }
}

/// Executor and dispatch-layer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Overall deadline for one execution attempt.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_seconds: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    /// Wait budget for rate-limiter token acquisition per call attempt.
    #[serde(default = "default_acquire_timeout")]
    pub rate_acquire_timeout_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_timeout_seconds: default_execution_timeout(),
            retry_max_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            rate_acquire_timeout_seconds: default_acquire_timeout(),
        }
    }
}

fn default_execution_timeout() -> u64 {
    300
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    500
}

fn default_retry_max_delay() -> u64 {
    30_000
}

fn default_acquire_timeout() -> u64 {
    30
}

impl EngineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_seconds.max(1))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.rate_acquire_timeout_seconds.max(1))
    }
}

/// Contact reconciliation cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_enabled")]
    pub enabled: bool,
    /// Cron expression; defaults to hourly.
    #[serde(default = "default_sync_schedule")]
    pub schedule: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_sync_enabled(),
            schedule: default_sync_schedule(),
        }
    }
}

fn default_sync_enabled() -> bool {
    true
}

fn default_sync_schedule() -> String {
    "0 0 * * * *".to_string()
}

impl Config {
    /// Load configuration from an optional TOML file, then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)
                    .map_err(|e| Error::Config(format!("invalid config file: {e}")))?
            }
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("LEXBRIDGE_PAPERLESS_URL") {
            self.paperless.base_url = url;
        }
        if let Ok(token) = std::env::var("LEXBRIDGE_PAPERLESS_TOKEN") {
            self.paperless.api_token = token;
        }
        if let Ok(url) = std::env::var("LEXBRIDGE_LEXOFFICE_URL") {
            self.lexoffice.base_url = url;
        }
        if let Ok(key) = std::env::var("LEXBRIDGE_LEXOFFICE_API_KEY") {
            self.lexoffice.api_token = key;
        }
        if let Ok(path) = std::env::var("LEXBRIDGE_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_the_lexoffice_rate_limit() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.lexoffice.requests_per_second, 2);
        assert_eq!(config.paperless.requests_per_second, 0);
        assert_eq!(config.engine.retry_max_attempts, 3);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let raw = r#"
            [server]
            port = 9090

            [lexoffice]
            base_url = "https://api.example.test"
            api_token = "key"
            requests_per_second = 5
            burst = 10

            [engine]
            execution_timeout_seconds = 60
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.lexoffice.requests_per_second, 5);
        assert_eq!(config.engine.execution_timeout_seconds, 60);
        // Sections not present keep their defaults.
        assert_eq!(config.paperless.base_url, "http://localhost:8000");
        assert_eq!(config.sync.schedule, "0 0 * * * *");
    }

    #[test]
    fn zero_rate_means_unconstrained() {
        let config = ServiceConfig::paperless_defaults();
        let limit = config.rate_limit();
        assert!(limit.requests_per_window >= 1000);
    }
}
