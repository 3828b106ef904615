//! Bounded retry schedules for remote calls

use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub enum RetryStrategy {
    Linear,
    Exponential,
}

/// A retry schedule: `max_attempts` total tries with a strategy-derived
/// delay before each retry.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
}

impl RetryPolicy {
    pub fn linear(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Linear, max_attempts, base_delay)
    }

    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Exponential, max_attempts, base_delay)
    }

    fn new(strategy: RetryStrategy, max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            strategy,
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = if max_delay.is_zero() {
            None
        } else {
            Some(max_delay)
        };
        self
    }

    pub fn handle(&self) -> RetryHandle {
        RetryHandle {
            policy: self.clone(),
            attempts: 0,
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let raw = match self.strategy {
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt as u32),
            RetryStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(31) as u32;
                self.base_delay.saturating_mul(1u32 << shift)
            }
        };
        match self.max_delay {
            Some(max) => raw.min(max),
            None => raw,
        }
    }
}

/// Mutable cursor over one retry sequence
pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
}

impl RetryHandle {
    /// Delay to wait before the next attempt, or `None` once the attempt
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts + 1 >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay_for_attempt(self.attempts))
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_schedule() {
        let mut handle = RetryPolicy::exponential(4, Duration::from_millis(200)).handle();
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(800)));
        assert_eq!(handle.next_delay(), None);
        assert_eq!(handle.attempts(), 3);
    }

    #[test]
    fn test_linear_schedule_with_cap() {
        let policy = RetryPolicy::linear(4, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(150));
        let mut handle = policy.handle();
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(150)));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(150)));
        assert_eq!(handle.next_delay(), None);
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let mut handle = RetryPolicy::exponential(1, Duration::from_millis(200)).handle();
        assert_eq!(handle.next_delay(), None);
    }
}
