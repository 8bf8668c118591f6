//! Configuration loading and representation.
//!
//! | variable                              | default       |
//! |---------------------------------------|---------------|
//! | `TRADEFLOW_DLQ_MAX_ATTEMPTS`          | 5             |
//! | `TRADEFLOW_DLQ_BASE_RETRY_DELAY_MS`   | 1000          |
//! | `TRADEFLOW_DLQ_MAX_RETRY_DELAY_MS`    | 300000        |
//! | `TRADEFLOW_DLQ_BACKOFF_STRATEGY`      | `exponential` |
//! | `TRADEFLOW_DLQ_BACKOFF_MULTIPLIER`    | 2.0           |
//! | `TRADEFLOW_DLQ_MAX_QUEUE_SIZE`        | 10000         |
//!
//! The strategy is one of `exponential`, `linear` or `fixed`. The multiplier
//! only applies to `exponential`; `fixed` waits the base delay every time.
//!
//! Logging is configured separately by `tradeflow-observability`
//! (`RUST_LOG`, `TRADEFLOW_LOG_FORMAT`).

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dlq::{BackoffPolicy, BackoffStrategy};

pub const MAX_ATTEMPTS_ENV: &str = "TRADEFLOW_DLQ_MAX_ATTEMPTS";
pub const BASE_RETRY_DELAY_ENV: &str = "TRADEFLOW_DLQ_BASE_RETRY_DELAY_MS";
pub const MAX_RETRY_DELAY_ENV: &str = "TRADEFLOW_DLQ_MAX_RETRY_DELAY_MS";
pub const BACKOFF_STRATEGY_ENV: &str = "TRADEFLOW_DLQ_BACKOFF_STRATEGY";
pub const BACKOFF_MULTIPLIER_ENV: &str = "TRADEFLOW_DLQ_BACKOFF_MULTIPLIER";
pub const MAX_QUEUE_SIZE_ENV: &str = "TRADEFLOW_DLQ_MAX_QUEUE_SIZE";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Parse { key: &'static str, value: String },
    #[error("{key}: {reason}")]
    OutOfRange { key: &'static str, reason: &'static str },
}

/// Dead letter queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// Attempts per entry, counting the failure that dead-lettered it
    pub max_attempts: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff_strategy: BackoffStrategy,
    pub backoff_multiplier: f64,
    pub max_queue_size: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 300_000,
            backoff_strategy: BackoffStrategy::Exponential,
            backoff_multiplier: 2.0,
            max_queue_size: 10_000,
        }
    }
}

impl DlqConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_retry_delay(mut self, delay: Duration) -> Self {
        self.base_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_backoff_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        let base = Duration::from_millis(self.base_retry_delay_ms);
        let max = Duration::from_millis(self.max_retry_delay_ms);
        match self.backoff_strategy {
            BackoffStrategy::Exponential => {
                BackoffPolicy::exponential(base, self.backoff_multiplier, max)
            }
            BackoffStrategy::Linear => BackoffPolicy::linear(base, max),
            BackoffStrategy::Fixed => BackoffPolicy::fixed(base),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                key: MAX_ATTEMPTS_ENV,
                reason: "must be at least 1",
            });
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::OutOfRange {
                key: MAX_QUEUE_SIZE_ENV,
                reason: "must be at least 1",
            });
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::OutOfRange {
                key: BACKOFF_MULTIPLIER_ENV,
                reason: "must be a finite number >= 1.0",
            });
        }
        if self.max_retry_delay_ms < self.base_retry_delay_ms {
            return Err(ConfigError::OutOfRange {
                key: MAX_RETRY_DELAY_ENV,
                reason: "must not be below the base retry delay",
            });
        }
        Ok(())
    }

    /// Read overrides from the process environment on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = parse(&lookup, MAX_ATTEMPTS_ENV)? {
            config.max_attempts = v;
        }
        if let Some(v) = parse(&lookup, BASE_RETRY_DELAY_ENV)? {
            config.base_retry_delay_ms = v;
        }
        if let Some(v) = parse(&lookup, MAX_RETRY_DELAY_ENV)? {
            config.max_retry_delay_ms = v;
        }
        if let Some(v) = parse(&lookup, BACKOFF_STRATEGY_ENV)? {
            config.backoff_strategy = v;
        }
        if let Some(v) = parse(&lookup, BACKOFF_MULTIPLIER_ENV)? {
            config.backoff_multiplier = v;
        }
        if let Some(v) = parse(&lookup, MAX_QUEUE_SIZE_ENV)? {
            config.max_queue_size = v;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse { key, value: raw }),
    }
}
