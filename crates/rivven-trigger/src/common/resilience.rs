//! Retry policy for the polling loop
//!
//! Bounded exponential backoff shared by two paths in the scheduler:
//! re-dispatching a batch after a retryable handler failure, and backing
//! off after consecutive transient store errors.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `max_retries` value meaning "never give up"
pub const UNLIMITED_RETRIES: i32 = -1;

/// Backoff policy.
///
/// Attempt `n` (zero-based) waits `retry_delay * 2^n`, capped at `max_delay`,
/// then spread by up to `±jitter` of that value so that workers failing on
/// the same outage do not retry in lockstep.
///
/// ```rust
/// use rivven_trigger::common::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig::builder()
///     .max_retries(3)
///     .retry_delay(Duration::from_millis(200))
///     .max_delay(Duration::from_secs(5))
///     .jitter(0.0)
///     .build();
///
/// assert!(config.should_retry(2));
/// assert!(!config.should_retry(3));
/// assert_eq!(config.delay_for_attempt(1), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; `-1` for unlimited, `0` for none
    max_retries: i32,
    #[serde(with = "millis", rename = "retry_delay_ms")]
    retry_delay: Duration,
    #[serde(with = "millis", rename = "max_delay_ms")]
    max_delay: Duration,
    /// Fraction of the delay used as spread, in `[0, 1]`
    jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder {
            config: Self::default(),
        }
    }

    /// Fail on the first error.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Retry forever with the default curve.
    pub fn infinite() -> Self {
        Self {
            max_retries: UNLIMITED_RETRIES,
            ..Self::default()
        }
    }

    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn is_enabled(&self) -> bool {
        self.max_retries != 0
    }

    /// Whether another attempt is allowed after `retries_so_far` retries.
    pub fn should_retry(&self, retries_so_far: u32) -> bool {
        match self.max_retries {
            UNLIMITED_RETRIES => true,
            limit => u32::try_from(limit).is_ok_and(|limit| retries_so_far < limit),
        }
    }

    /// Wait before retry number `attempt + 1`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self.retry_delay.saturating_mul(factor).min(self.max_delay);
        spread(capped, self.jitter, attempt)
    }
}

/// Offset `delay` by a fraction of `jitter` that depends only on `attempt`.
///
/// The golden-ratio sequence covers `[-1, 1)` evenly without a random
/// source, which keeps delays reproducible in tests.
fn spread(delay: Duration, jitter: f64, attempt: u32) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    const GOLDEN_RATIO_CONJUGATE: f64 = 0.618_033_988_749_895;
    let position = (f64::from(attempt) * GOLDEN_RATIO_CONJUGATE).fract() * 2.0 - 1.0;
    let secs = delay.as_secs_f64() * (1.0 + jitter * position);
    Duration::from_secs_f64(secs.max(0.0))
}

/// Builder for [`RetryConfig`]
#[derive(Debug, Clone)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn max_retries(mut self, value: i32) -> Self {
        self.config.max_retries = value.max(UNLIMITED_RETRIES);
        self
    }

    pub fn retry_delay(mut self, value: Duration) -> Self {
        self.config.retry_delay = value;
        self
    }

    pub fn max_delay(mut self, value: Duration) -> Self {
        self.config.max_delay = value;
        self
    }

    /// Clamped to `[0, 1]`.
    pub fn jitter(mut self, value: f64) -> Self {
        self.config.jitter = value.clamp(0.0, 1.0);
        self
    }

    pub fn build(self) -> RetryConfig {
        self.config
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
