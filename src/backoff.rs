use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter, capped at `max`.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the computed delay that may be added on top, in [0, 1]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay with up to `jitter` extra added, never beyond `max`
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(0.0..=jitter);
        delay.mul_f64(factor).min(self.max)
    }
}

/// Consecutive failure counts per object
pub struct RetryTracker<K> {
    policy: RetryPolicy,
    attempts: Mutex<HashMap<K, u32>>,
}

impl<K: Hash + Eq> RetryTracker<K> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure and return how long to wait before retrying
    pub fn next_delay(&self, key: K) -> (u32, Duration) {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
            let attempt = attempts.entry(key).or_insert(0);
            *attempt = attempt.saturating_add(1);
            *attempt
        };
        (attempt, self.policy.delay_with_jitter(attempt))
    }

    /// Forget failures after a success
    pub fn reset(&self, key: &K) {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    pub fn attempts(&self, key: &K) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter,
        }
    }

    #[test]
    fn delay_doubles_until_capped() {
        let policy = policy(0.0);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(8), Duration::from_millis(10_000));
        assert_eq!(policy.delay(9), Duration::from_secs(10));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn attempt_zero_behaves_like_the_first() {
        assert_eq!(policy(0.0).delay(0), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = policy(0.5);
        for _ in 0..100 {
            let delay = policy.delay_with_jitter(2);
            assert!(delay >= Duration::from_millis(200), "{delay:?}");
            assert!(delay <= Duration::from_millis(300), "{delay:?}");
        }
        for _ in 0..100 {
            assert!(policy.delay_with_jitter(20) <= Duration::from_secs(10));
        }
    }

    #[test]
    fn tracker_counts_per_key_and_resets() {
        let tracker = RetryTracker::new(policy(0.0));
        assert_eq!(tracker.next_delay("a"), (1, Duration::from_millis(100)));
        assert_eq!(tracker.next_delay("a"), (2, Duration::from_millis(200)));
        assert_eq!(tracker.next_delay("b"), (1, Duration::from_millis(100)));
        assert_eq!(tracker.attempts(&"a"), 2);

        tracker.reset(&"a");
        assert_eq!(tracker.attempts(&"a"), 0);
        assert_eq!(tracker.next_delay("a"), (1, Duration::from_millis(100)));
        assert_eq!(tracker.attempts(&"b"), 1);
    }
}
