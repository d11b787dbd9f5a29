//! Structured configuration, loaded from a single TOML file.
//!
//! Extracts named tables with `toml::Value::get` and falls back to
//! section defaults when a table or file is missing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::RouterError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub webhook_secret: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            webhook_secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// "memory" or "postgres".
    pub kind: String,
    pub database_url: Option<String>,
    pub master_encryption_secret: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: "memory".to_string(),
            database_url: None,
            master_encryption_secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// "memory" is the only adapter required to be shipped.
    pub kind: String,
    pub max_retries: u32,
    pub visibility_timeout_ms: u64,
    pub retention_period_secs: u64,
    pub dead_letter_threshold: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            kind: "memory".to_string(),
            max_retries: 5,
            visibility_timeout_ms: 30_000,
            retention_period_secs: 14 * 24 * 3600,
            dead_letter_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Timeout (ms) per transport kind; keys are `TransportKind::as_str()`.
    pub timeouts_ms: HashMap<String, u64>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        let mut timeouts_ms = HashMap::new();
        timeouts_ms.insert("http-webhook".to_string(), 10_000);
        Self { timeouts_ms }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// "linear" or "exponential".
    pub backoff_strategy: String,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_strategy: "exponential".to_string(),
            initial_delay_ms: 500,
            max_delay_ms: 60_000,
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504, 0],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub rate_limiting_enabled: bool,
    pub requests_per_minute: u32,
    pub payload_size_limit_mb: u32,
    pub ip_allowlist: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limiting_enabled: true,
            requests_per_minute: 600,
            payload_size_limit_mb: 5,
            ip_allowlist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub batch_size: usize,
    pub processing_interval_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            processing_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub failed_delivery_alerts: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            failed_delivery_alerts: false,
        }
    }
}

/// The full router configuration, threaded through constructors rather
/// than held as a mutable singleton.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub server: ServerConfig,
    pub ingest: IngestConfig,
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub delivery: DeliveryConfig,
    pub retry: RetryConfig,
    pub security: SecurityConfig,
    pub processing: ProcessingConfig,
    pub monitoring: MonitoringConfig,
}

impl RouterConfig {
    /// Load configuration from a TOML file on disk, falling back to
    /// per-section defaults for anything unspecified.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RouterError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| RouterError::config(format!("reading config file: {e}")))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, RouterError> {
        toml::from_str(raw).map_err(|e| RouterError::config(format!("parsing config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RouterConfig::default();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.queue.kind, "memory");
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg = RouterConfig::parse(
            r#"
            [server]
            port = 9000

            [retry]
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.backoff_strategy, "exponential");
    }

    #[test]
    fn retryable_status_codes_match_spec_default() {
        let cfg = RouterConfig::default();
        assert_eq!(
            cfg.retry.retryable_status_codes,
            vec![408, 429, 500, 502, 503, 504, 0]
        );
    }
}
