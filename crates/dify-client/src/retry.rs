use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Status codes treated as transient.
pub const RETRYABLE_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];

/// Fixed-delay retry policy applied to every request before its body is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first request.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Sleep between attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: Duration,
}

const fn default_max_retries() -> u32 {
    2
}

const fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(default_max_retries(), default_retry_delay())
    }
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            retry_delay: Duration::ZERO,
        }
    }

    pub const fn fixed(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    pub fn can_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Total number of attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn is_retryable_status(status: u16) -> bool {
        RETRYABLE_STATUS_CODES.contains(&status)
    }

    pub(crate) fn wait(&self) {
        if !self.retry_delay.is_zero() {
            std::thread::sleep(self.retry_delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RetryPolicy;
    use std::time::Duration;

    #[test]
    fn default_policy_retries_twice_with_one_second_delay() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_retries, 2);
        assert_eq!(p.retry_delay, Duration::from_secs(1));
        assert_eq!(p.max_attempts(), 3);
        assert!(p.can_retry(1));
        assert!(!p.can_retry(2));
    }

    #[test]
    fn none_policy_has_zero_retries() {
        let p = RetryPolicy::none();
        assert_eq!(p.max_attempts(), 1);
        assert!(!p.can_retry(0));
    }

    #[test]
    fn only_rate_limit_and_gateway_statuses_are_retryable() {
        for status in [429, 500, 502, 503, 504] {
            assert!(RetryPolicy::is_retryable_status(status), "{status}");
        }
        for status in [400, 401, 403, 404, 422, 501] {
            assert!(!RetryPolicy::is_retryable_status(status), "{status}");
        }
    }
}
