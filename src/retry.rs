//! Decides whether a failed completion attempt is reissued

use crate::config::RequestConfig;
use crate::llm::RemoteError;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    GiveUp,
}

/// Fixed-backoff policy that only reissues overloaded rejections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

impl From<&RequestConfig> for RetryPolicy {
    fn from(config: &RequestConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config.retry_backoff(),
        }
    }
}

impl RetryPolicy {
    /// `retries_done` counts reissues already made for the current submission.
    pub fn decide(&self, error: &RemoteError, retries_done: u32) -> RetryDecision {
        if error.is_overloaded() && retries_done < self.max_retries {
            RetryDecision::Retry {
                after: self.backoff,
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_retries_with_fixed_backoff_until_cap() {
        let policy = RetryPolicy::default();
        let overloaded = RemoteError::overloaded("The model is overloaded.");

        for retries_done in 0..3 {
            assert_eq!(
                policy.decide(&overloaded, retries_done),
                RetryDecision::Retry {
                    after: Duration::from_secs(2)
                }
            );
        }
        assert_eq!(policy.decide(&overloaded, 3), RetryDecision::GiveUp);
    }

    #[test]
    fn other_failures_give_up_immediately() {
        let policy = RetryPolicy::default();
        let terminal = [
            RemoteError::Timeout,
            RemoteError::Cancelled,
            RemoteError::NetworkFailure("connection reset".to_string()),
            RemoteError::rejected("Internal error"),
        ];

        for error in terminal {
            assert_eq!(policy.decide(&error, 0), RetryDecision::GiveUp, "{error:?}");
        }
    }

    #[test]
    fn built_from_request_config() {
        let config = RequestConfig {
            timeout_secs: 10,
            max_retries: 1,
            retry_backoff_secs: 5,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.backoff, Duration::from_secs(5));
    }
}
