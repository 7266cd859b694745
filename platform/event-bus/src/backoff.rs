//! Bounded exponential backoff with jitter
//!
//! Used by the connection manager's background reconnect loop and by consumers
//! waiting for the broker at startup. Retries are unlimited; only the delay
//! between them is bounded.

use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Configuration for backoff behavior
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Ceiling for the exponential growth
    pub max_backoff: Duration,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction (0.2 = ±20%)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay before retry number `attempt` (1-based), capped at `max_backoff`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Jittered delay before retry number `attempt`, never above `max_backoff`
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }

        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        base.mul_f64(factor).min(self.max_backoff)
    }

    /// Start a fresh backoff sequence
    pub fn iter(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
        }
    }
}

/// A running backoff sequence
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.policy.delay(self.attempt)
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Go back to the initial delay after a success
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Sleep for `delay` unless `cancel` fires first
///
/// Returns `false` if the wait was cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_full_backoff_sequence() {
        let mut backoff = no_jitter().iter();
        let expected = [1, 2, 4, 8, 16, 30, 30, 30];

        for &expected_secs in &expected {
            assert_eq!(backoff.next_delay(), Duration::from_secs(expected_secs));
        }
        assert_eq!(backoff.attempt(), expected.len() as u32);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = no_jitter().iter();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_huge_attempt_stays_capped() {
        let policy = no_jitter();
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy {
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        };

        for _ in 0..200 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_millis(750), "{d:?} below jitter floor");
            assert!(d <= Duration::from_millis(1250), "{d:?} above jitter ceiling");

            assert!(policy.delay(10) <= Duration::from_secs(30));
        }
    }

    #[tokio::test]
    async fn test_sleep_or_cancel() {
        let cancel = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_millis(1), &cancel).await);

        cancel.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(3600), &cancel).await);
    }
}
