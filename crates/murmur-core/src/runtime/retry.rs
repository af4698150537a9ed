use std::time::Duration;

use crate::runtime::types::ErrorKind;

/// Bounded exponential backoff for retryable backend failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total synthesis attempts per task, including the first. Minimum 1.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each later attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue the task, not eligible before `delay` has elapsed.
    Retry { delay: Duration },
    /// Move the task to `failed`.
    Fail,
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failed attempt (1-based):
    /// `min(base_delay * 2^(attempt-1), max_delay)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide what happens after attempt number `attempts_made` failed with
    /// an error of `kind`.
    pub fn decide(&self, kind: ErrorKind, attempts_made: u32) -> RetryDecision {
        if !kind.is_retryable() || attempts_made >= self.max_attempts.max(1) {
            return RetryDecision::Fail;
        }
        RetryDecision::Retry {
            delay: self.backoff(attempts_made),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(250));
        assert_eq!(p.backoff(200), Duration::from_millis(250));
    }

    #[test]
    fn permanent_errors_fail_immediately() {
        assert_eq!(policy().decide(ErrorKind::Permanent, 1), RetryDecision::Fail);
    }

    #[test]
    fn retryable_errors_stop_at_max_attempts() {
        let p = policy();
        assert_eq!(
            p.decide(ErrorKind::Transient, 1),
            RetryDecision::Retry {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            p.decide(ErrorKind::ResourceExhausted, 2),
            RetryDecision::Retry {
                delay: Duration::from_millis(200)
            }
        );
        assert_eq!(p.decide(ErrorKind::Transient, 3), RetryDecision::Fail);
    }

    #[test]
    fn zero_max_attempts_behaves_like_one() {
        let p = RetryPolicy {
            max_attempts: 0,
            ..policy()
        };
        assert_eq!(p.decide(ErrorKind::Transient, 1), RetryDecision::Fail);
    }
}
