//! Backoff scheduling for dead-letter retries.
//!
//! ```text
//! attempt   delay (base=1s, multiplier=2, max=300s)
//! ──────────────────────────────────────────────
//!    1        1s
//!    2        2s
//!    3        4s
//!    ...
//!    9      256s
//!   10+     300s (capped)
//! ```
//!
//! `attempt` is the number of the attempt about to be scheduled; the first
//! retry after a failure is attempt 1. No jitter is applied, so delays never
//! decrease from one attempt to the next.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * multiplier^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl BackoffStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Exponential => "exponential",
            Self::Linear => "linear",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown backoff strategy {0:?}")]
pub struct UnknownStrategy(pub String);

impl FromStr for BackoffStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

/// Delay policy: pure function of the attempt number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    /// Delay before attempt 1
    pub base_delay: Duration,
    /// Growth factor for `Exponential`; values below 1.0 are treated as 1.0
    pub multiplier: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(300))
    }
}

impl BackoffPolicy {
    pub fn exponential(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay,
            multiplier,
            max_delay,
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            base_delay,
            multiplier: 1.0,
            max_delay,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let multiplier = if self.multiplier.is_finite() {
                    self.multiplier.max(1.0)
                } else {
                    1.0
                };
                // Clamp the exponent: anything past this is far above any sane cap anyway.
                let exp = (attempt - 1).min(1_000) as i32;
                base_ms * multiplier.powi(exp)
            }
            BackoffStrategy::Linear => base_ms * f64::from(attempt),
        };

        Duration::from_millis(delay_ms.min(max_ms).max(0.0).round() as u64)
    }

    /// Wall-clock time at which `attempt` should run, counting from `now`.
    pub fn next_retry_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Whether another attempt may be scheduled after `attempts` have been made.
pub fn should_retry(attempts: u32, max_attempts: u32) -> bool {
    attempts < max_attempts
}
