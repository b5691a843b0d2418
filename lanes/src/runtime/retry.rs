use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Retry and backoff for messages whose handler failed with a retryable error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total deliveries allowed, including the first, before dead-lettering.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_backoff_ms: 300_000, // 5 minutes
        }
    }
}

/// What to do with a message after a retryable failure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// Re-send with this redelivery attempt number after the delay.
    Retry { attempt: u32, delay_ms: u64 },
    DeadLetter,
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    /// `base_delay * 2^(attempt - 1)`, capped at `max_backoff`.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::milliseconds(0);
        }

        let exp = attempt.saturating_sub(1).min(62) as i32;
        let scaled = (self.base_delay_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.max_backoff_ms as f64);
        Duration::milliseconds(capped.max(0.0) as i64)
    }

    pub fn should_dead_letter(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Decide for a message that has already been re-sent
    /// `previous_redeliveries` times.
    pub fn decide(&self, previous_redeliveries: u32) -> RetryDecision {
        let attempt = previous_redeliveries.saturating_add(1);
        if self.should_dead_letter(attempt) {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Retry {
                attempt,
                delay_ms: self.compute_delay(attempt).num_milliseconds() as u64,
            }
        }
    }
}
