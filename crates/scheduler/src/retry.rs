use chrono::{DateTime, Duration, Utc};
use mailflow_core::config::SchedulerConfig;

/// Longest wait between two attempts, whatever the exponent says.
const MAX_BACKOFF_MS: i64 = 7 * 24 * 3600 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back in the queue.
    Retry { attempts: u32, at: DateTime<Utc> },
    /// Out of attempts; the job becomes `failed`.
    GiveUp { attempts: u32 },
}

/// Exponential backoff: after a transient failure that brings the counter to
/// `n`, the job waits `base_delay * 2^n`. A job may be retried while
/// `n <= max_retries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2i64.checked_pow(attempts).unwrap_or(i64::MAX);
        let ms = self
            .base_delay
            .num_milliseconds()
            .saturating_mul(factor)
            .min(MAX_BACKOFF_MS);
        Duration::milliseconds(ms)
    }

    /// Decide what happens after a failed attempt. `attempts` is the counter
    /// before the failure is recorded.
    pub fn next_attempt(&self, attempts: u32, now: DateTime<Utc>) -> RetryDecision {
        let attempts = attempts.saturating_add(1);
        if attempts <= self.max_retries {
            RetryDecision::Retry {
                attempts,
                at: now + self.backoff(attempts),
            }
        } else {
            RetryDecision::GiveUp { attempts }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for RetryPolicy {
    fn from(config: &SchedulerConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::seconds(config.base_delay_secs.min(i64::MAX as u64 / 1000) as i64),
        )
    }
}
