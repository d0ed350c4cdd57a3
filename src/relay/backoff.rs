use std::time::Duration;

/// Exponential reconnect policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

/// Tracks consecutive failures against a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, or `None` once the policy is exhausted.
    /// Doubles on every call until capped at `max`.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts
            && self.attempts >= max
        {
            return None;
        }
        let shift = self.attempts.min(31);
        let delay = self
            .policy
            .initial
            .checked_mul(1u32 << shift)
            .unwrap_or(self.policy.max)
            .min(self.policy.max);
        self.attempts += 1;
        Some(delay)
    }

    /// Called after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_and_cap() {
        let mut backoff = Backoff::new(RetryPolicy {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(5),
            max_attempts: None,
        });
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay().unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
    }

    #[test]
    fn test_delays_never_decrease() {
        let mut backoff = Backoff::new(RetryPolicy::default());
        let mut prev = Duration::ZERO;
        for _ in 0..100 {
            let d = backoff.next_delay().unwrap();
            assert!(d >= prev);
            assert!(d <= Duration::from_secs(30));
            prev = d;
        }
    }

    #[test]
    fn test_attempt_limit_and_reset() {
        let mut backoff = Backoff::new(RetryPolicy {
            max_attempts: Some(2),
            ..Default::default()
        });
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }
}
