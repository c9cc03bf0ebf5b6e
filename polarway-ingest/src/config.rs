//! Collector configuration
//!
//! Every knob has a default suitable for a rate-limited third-party API; callers
//! override per endpoint in code, or per deployment through `POLARWAY_INGEST_*`
//! environment variables.

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per interval, shared by all workers of a run
    pub requests_per_interval: u32,
    /// Interval length (milliseconds)
    pub interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_interval: 10,
            interval_ms: 1000,
        }
    }
}

impl RateLimitConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    /// Delay before the first retry (milliseconds)
    pub initial_backoff_ms: u64,
    /// Upper bound for a single backoff delay (milliseconds)
    pub max_backoff_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Timeout for each request attempt (seconds); a timeout counts as transient
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            request_timeout_secs: 30,
        }
    }
}

impl RetryConfig {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Items requested per page
    pub page_size: usize,
    /// Maximum pages in flight at once
    pub concurrency: usize,
    /// Resume from the last successful run when possible
    pub incremental: bool,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    /// Overall run deadline (seconds), none by default
    pub run_timeout_secs: Option<u64>,
    /// Maximum pages per input (0 = unlimited)
    pub max_pages: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            incremental: true,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            run_timeout_secs: None,
            max_pages: 0,
        }
    }
}

impl CollectorConfig {
    /// Defaults overlaid with `POLARWAY_INGEST_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("POLARWAY_INGEST_PAGE_SIZE") {
            config.page_size = parse_var("POLARWAY_INGEST_PAGE_SIZE", &v)?;
        }
        if let Some(v) = lookup("POLARWAY_INGEST_CONCURRENCY") {
            config.concurrency = parse_var("POLARWAY_INGEST_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("POLARWAY_INGEST_INCREMENTAL") {
            config.incremental = parse_var("POLARWAY_INGEST_INCREMENTAL", &v)?;
        }
        if let Some(v) = lookup("POLARWAY_INGEST_RATE_LIMIT") {
            config.rate_limit.requests_per_interval = parse_var("POLARWAY_INGEST_RATE_LIMIT", &v)?;
        }
        if let Some(v) = lookup("POLARWAY_INGEST_RATE_INTERVAL_MS") {
            config.rate_limit.interval_ms = parse_var("POLARWAY_INGEST_RATE_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("POLARWAY_INGEST_MAX_RETRIES") {
            config.retry.max_retries = parse_var("POLARWAY_INGEST_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("POLARWAY_INGEST_REQUEST_TIMEOUT_SECS") {
            config.retry.request_timeout_secs =
                parse_var("POLARWAY_INGEST_REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("POLARWAY_INGEST_RUN_TIMEOUT_SECS") {
            config.run_timeout_secs = Some(parse_var("POLARWAY_INGEST_RUN_TIMEOUT_SECS", &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn with_rate_limit(mut self, requests: u32, interval: Duration) -> Self {
        self.rate_limit = RateLimitConfig {
            requests_per_interval: requests,
            interval_ms: interval.as_millis() as u64,
        };
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(IngestError::Config("page_size must be > 0".to_string()));
        }
        if self.concurrency == 0 {
            return Err(IngestError::Config("concurrency must be > 0".to_string()));
        }
        if self.rate_limit.requests_per_interval == 0 {
            return Err(IngestError::Config(
                "rate_limit.requests_per_interval must be > 0".to_string(),
            ));
        }
        if self.rate_limit.interval_ms == 0 {
            return Err(IngestError::Config(
                "rate_limit.interval_ms must be > 0".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(IngestError::Config(
                "retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| IngestError::Config(format!("Invalid value for {}: {:?}", key, value)))
}
