//! Configuration management.
//!
//! Values come from `TRANSMUTE__`-prefixed environment variables (after `.env`
//! is loaded by the binaries), optionally layered over a config file.
//! `TRANSMUTE__WORKER__HARD_TIME_LIMIT=10m` sets `worker.hard_time_limit`.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{ErrorCode, Result, TransmuteError};
use crate::jobs::WorkerSettings;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Redis configuration (broker and result backend)
    #[serde(default)]
    pub redis: RedisConfig,

    /// Result store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Broker queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Batch orchestration limits
    #[serde(default)]
    pub batch: BatchConfig,

    /// External converter configuration
    #[serde(default)]
    pub converter: ConverterConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest accepted upload per file
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Origins allowed by CORS
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Run a worker pool inside the server process
    #[serde(default = "default_true")]
    pub embedded_workers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_upload_bytes: default_max_upload_bytes(),
            cors_origins: default_cors_origins(),
            embedded_workers: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL; the in-memory backends are used when unset
    pub url: Option<String>,

    /// Prefix applied to every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Connection timeout
    #[serde(default = "default_connection_timeout", with = "humantime_serde")]
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
            connection_timeout: default_connection_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// How long terminal records stay readable
    #[serde(default = "default_result_ttl", with = "humantime_serde")]
    pub result_ttl: Duration,

    /// Sweep interval for the in-memory store
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            result_ttl: default_result_ttl(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Queue name
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Time an unacknowledged delivery stays invisible before redelivery
    #[serde(default = "default_visibility_timeout", with = "humantime_serde")]
    pub visibility_timeout: Duration,

    /// Idle poll interval for workers
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            visibility_timeout: default_visibility_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent worker loops
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Jobs a worker completes before it is recycled
    #[serde(default = "default_max_jobs_per_worker")]
    pub max_jobs_per_worker: u64,

    #[serde(default = "default_soft_time_limit", with = "humantime_serde")]
    pub soft_time_limit: Duration,

    #[serde(default = "default_hard_time_limit", with = "humantime_serde")]
    pub hard_time_limit: Duration,

    /// Retries after the first attempt for transient faults
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_base", with = "humantime_serde")]
    pub retry_backoff_base: Duration,

    #[serde(default = "default_retry_backoff_max", with = "humantime_serde")]
    pub retry_backoff_max: Duration,

    /// Grace period for in-flight jobs at shutdown
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_jobs_per_worker: default_max_jobs_per_worker(),
            soft_time_limit: default_soft_time_limit(),
            hard_time_limit: default_hard_time_limit(),
            max_retries: default_max_retries(),
            retry_backoff_base: default_retry_backoff_base(),
            retry_backoff_max: default_retry_backoff_max(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Maximum files per batch request
    #[serde(default = "default_max_items")]
    pub max_items: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_items: default_max_items(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConverterConfig {
    /// External image tool invoked for conversions
    #[serde(default = "default_program")]
    pub program: String,

    /// Quality used when a request does not give one
    #[serde(default = "default_quality")]
    pub default_quality: u8,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            default_quality: default_quality(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Service name reported in traces
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// OpenTelemetry OTLP endpoint
    pub otlp_endpoint: Option<String>,

    /// Enable JSON logging
    #[serde(default = "default_true")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            otlp_endpoint: None,
            json_logging: true,
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8000 }
fn default_max_upload_bytes() -> usize { 200 * 1024 * 1024 }
fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(),
        "http://127.0.0.1:5173".to_string(),
        "http://localhost:3000".to_string(),
    ]
}
fn default_true() -> bool { true }
fn default_key_prefix() -> String { "transmute:".to_string() }
fn default_connection_timeout() -> Duration { Duration::from_secs(5) }
fn default_result_ttl() -> Duration { Duration::from_secs(3600) }
fn default_cleanup_interval() -> Duration { Duration::from_secs(60) }
fn default_queue_name() -> String { "conversions".to_string() }
fn default_visibility_timeout() -> Duration { Duration::from_secs(3600) }
fn default_poll_interval() -> Duration { Duration::from_millis(250) }
fn default_concurrency() -> usize { 2 }
fn default_max_jobs_per_worker() -> u64 { 50 }
fn default_soft_time_limit() -> Duration { Duration::from_secs(540) }
fn default_hard_time_limit() -> Duration { Duration::from_secs(600) }
fn default_max_retries() -> u32 { 3 }
fn default_retry_backoff_base() -> Duration { Duration::from_secs(1) }
fn default_retry_backoff_max() -> Duration { Duration::from_secs(600) }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(30) }
fn default_max_items() -> usize { 50 }
fn default_program() -> String { "magick".to_string() }
fn default_quality() -> u8 { 85 }
fn default_service_name() -> String { "transmute".to_string() }

const ENV_PREFIX: &str = "TRANSMUTE";

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject combinations the worker envelope cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.worker.soft_time_limit >= self.worker.hard_time_limit {
            return Err(invalid("worker.soft_time_limit must be shorter than worker.hard_time_limit"));
        }
        if self.worker.concurrency == 0 {
            return Err(invalid("worker.concurrency must be at least 1"));
        }
        if self.worker.max_jobs_per_worker == 0 {
            return Err(invalid("worker.max_jobs_per_worker must be at least 1"));
        }
        if self.batch.max_items == 0 {
            return Err(invalid("batch.max_items must be at least 1"));
        }
        if self.converter.default_quality > 100 {
            return Err(invalid("converter.default_quality must be between 0 and 100"));
        }

        // A claim must outlive the delivery it covers, or the reaper hands a
        // running job to a second worker.
        let worst_case = WorkerSettings::from_config(&self.worker, &self.queue).worst_case_run();
        if self.queue.visibility_timeout <= worst_case {
            return Err(TransmuteError::new(
                ErrorCode::ConfigurationError,
                format!(
                    "queue.visibility_timeout ({:?}) must exceed the longest run of one job ({:?}): \
                     {} attempts at worker.hard_time_limit plus retry backoff",
                    self.queue.visibility_timeout,
                    worst_case,
                    self.worker.max_retries + 1,
                ),
            ));
        }
        Ok(())
    }
}

fn invalid(message: &'static str) -> TransmuteError {
    TransmuteError::new(ErrorCode::ConfigurationError, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployment() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.store.result_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.worker.hard_time_limit, Duration::from_secs(600));
        assert_eq!(cfg.worker.soft_time_limit, Duration::from_secs(540));
        assert_eq!(cfg.worker.max_retries, 3);
        assert_eq!(cfg.worker.max_jobs_per_worker, 50);
        assert_eq!(cfg.batch.max_items, 50);
        assert!(cfg.redis.url.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_soft_limit_must_be_below_hard_limit() {
        let mut cfg = Config::default();
        cfg.worker.soft_time_limit = Duration::from_secs(600);
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[test]
    fn test_visibility_timeout_must_outlive_a_full_run() {
        let mut cfg = Config::default();
        cfg.worker.soft_time_limit = Duration::from_secs(20);
        cfg.worker.hard_time_limit = Duration::from_secs(30);
        cfg.queue.visibility_timeout = Duration::from_millis(50);
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
        assert!(err.user_message().contains("queue.visibility_timeout"));

        // 4 runs of 30s plus 1s + 2s + 4s of backoff.
        cfg.queue.visibility_timeout = Duration::from_secs(127);
        assert!(cfg.validate().is_err());
        cfg.queue.visibility_timeout = Duration::from_secs(128);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_humantime_durations_deserialize() {
        let cfg: WorkerConfig =
            serde_json::from_str(r#"{"hard_time_limit": "2m", "soft_time_limit": "90s"}"#).unwrap();
        assert_eq!(cfg.hard_time_limit, Duration::from_secs(120));
        assert_eq!(cfg.soft_time_limit, Duration::from_secs(90));
        assert_eq!(cfg.concurrency, 2);
    }
}
