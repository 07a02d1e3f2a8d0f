//! Bounded exponential backoff used by the durable gateway and the snapshot
//! RPC paths.

use rand::{thread_rng, Rng};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter_fraction: f64,
}

impl BackoffPolicy {
    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay, max_delay: None, jitter_fraction: 0.0 }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = if max_delay.is_zero() { None } else { Some(max_delay) };
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.max(0.0);
        self
    }

    pub fn handle(&self) -> BackoffHandle {
        BackoffHandle { policy: self.clone(), attempts: 0 }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(31);
        let scaled = self.base_delay.as_millis().saturating_mul(1u128 << shift);
        let raw = Duration::from_millis(scaled.min(u128::from(u64::MAX)) as u64);
        let bounded = match self.max_delay {
            Some(max) => raw.min(max),
            None => raw,
        };
        if bounded.is_zero() || self.jitter_fraction <= 0.0 {
            return bounded;
        }
        let jitter = self.jitter_fraction.min(1.0);
        let factor = thread_rng().gen_range((1.0 - jitter).max(0.0)..=1.0 + jitter);
        let millis = (bounded.as_millis() as f64 * factor).round().max(0.0);
        Duration::from_millis(millis.min(u128::from(u64::MAX) as f64) as u64)
    }
}

pub struct BackoffHandle {
    policy: BackoffPolicy,
    attempts: usize,
}

impl BackoffHandle {
    /// Returns the delay before the next attempt, or `None` once the
    /// attempt budget is spent.
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
    fn budget_is_enforced() {
        let mut handle = BackoffPolicy::exponential(3, Duration::from_millis(10)).handle();
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(handle.next_delay(), None);
        assert_eq!(handle.attempts(), 2);
    }

    #[test]
    fn max_delay_caps_growth() {
        let policy = BackoffPolicy::exponential(10, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(150));
        let mut handle = policy.handle();
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(150)));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(150)));
    }

    #[test]
    fn single_attempt_policy_never_delays() {
        let mut handle = BackoffPolicy::exponential(1, Duration::from_millis(10)).handle();
        assert_eq!(handle.next_delay(), None);
    }
}
