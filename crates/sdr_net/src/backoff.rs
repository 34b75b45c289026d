//! Retry delay policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How long to wait before each reconnection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// The same delay every time.
    Fixed { delay_ms: u64 },
    /// `base * 2^n`, capped at `max`. Resets after a successful connection.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            base_ms: 500,
            max_ms: 30_000,
        }
    }
}

/// Delay calculator for one [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    #[must_use]
    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Delay before the next attempt. Each call counts one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let ms = match self.policy {
            BackoffPolicy::Fixed { delay_ms } => delay_ms,
            BackoffPolicy::Exponential { base_ms, max_ms } => {
                let multiplier = 1u64.checked_shl(self.failures.min(63)).unwrap_or(u64::MAX);
                base_ms.saturating_mul(multiplier).min(max_ms)
            }
        };
        self.failures = self.failures.saturating_add(1);
        Duration::from_millis(ms)
    }

    /// Forget past failures.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Delays handed out since the last reset.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay_never_grows() {
        let mut backoff = Backoff::new(BackoffPolicy::Fixed { delay_ms: 250 });
        for _ in 0..5 {
            assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_exponential_doubles_up_to_cap() {
        let mut backoff = Backoff::new(BackoffPolicy::Exponential {
            base_ms: 100,
            max_ms: 1000,
        });
        let delays: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_exponential_survives_many_failures() {
        let mut backoff = Backoff::new(BackoffPolicy::Exponential {
            base_ms: 1,
            max_ms: 60_000,
        });
        for _ in 0..200 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_millis(60_000));
    }

    #[test]
    fn test_policy_is_configurable_from_json() {
        let policy: BackoffPolicy =
            serde_json::from_str(r#"{"policy":"fixed","delay_ms":2000}"#).unwrap();
        assert_eq!(policy, BackoffPolicy::Fixed { delay_ms: 2000 });
    }
}
