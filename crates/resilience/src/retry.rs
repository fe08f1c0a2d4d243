//! Retry policy with exponential backoff for device calls.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = single attempt).
    pub max_retries: u32,
    /// Base of the exponential backoff, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub base_delay: Duration,
    /// Upper bound for a single backoff sleep, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub max_delay: Duration,
    /// Apply ±10% jitter so concurrent retries don't line up.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Sleep before retrying after failed attempt `attempt` (0-indexed):
    /// `base * 2^attempt`, capped at `max_delay`, then ±10% jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_secs_f64() * 1000.0;
        let exponential = base_ms * 2f64.powi(attempt.min(30) as i32);
        let capped = exponential.min(self.max_delay.as_secs_f64() * 1000.0);

        let delay_ms = if self.jitter {
            // uniform in [0.9, 1.1]
            capped * (0.9 + fastrand::f64() * 0.2)
        } else {
            capped
        };

        Duration::from_secs_f64(delay_ms.max(0.0) / 1000.0)
    }
}

/// Heuristic classification of opaque error messages.
///
/// Network trouble and 408/429/5xx retry; auth, not-found and malformed input
/// don't. Unknown messages default to retryable.
pub fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("reset")
        || error_lower.contains("refused")
        || error_lower.contains("unreachable")
        || error_lower.contains("temporarily")
        || error_lower.contains("unavailable")
    {
        return true;
    }

    if error_lower.contains("503") // Service Unavailable
        || error_lower.contains("502") // Bad Gateway
        || error_lower.contains("504") // Gateway Timeout
        || error_lower.contains("429") // Too Many Requests
        || error_lower.contains("408") // Request Timeout
        || error_lower.contains("500")
    {
        return true;
    }

    if error_lower.contains("400")
        || error_lower.contains("401")
        || error_lower.contains("403")
        || error_lower.contains("404")
        || error_lower.contains("422")
        || error_lower.contains("invalid")
        || error_lower.contains("not found")
        || error_lower.contains("out of memory")
    {
        return false;
    }

    true
}
