use std::time;

/// The retry policy applied to transient persistence failures: a fixed
/// back-off between a bounded number of attempts. Schema and
/// classification failures bypass this entirely and go straight to the
/// dead-letter topic.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Number of attempts after the initial one.
    max_retries: u32,
    /// The fixed interval slept between attempts.
    backoff: time::Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: time::Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Whether another attempt may be made after `attempt` failed ones.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    pub fn backoff(&self) -> time::Duration {
        self.backoff
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: time::Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_retries() {
        let policy = RetryPolicy::new(3, time::Duration::from_millis(10));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn default_matches_reference_configuration() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
        assert_eq!(policy.backoff(), time::Duration::from_secs(1));
    }
}
