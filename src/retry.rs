//! Reconnect policy and exponential backoff.
//!
//! This module provides [`ReconnectPolicy`], the value object that decides
//! whether and when a transport should try to re-establish its connection
//! after an unexpected closure or a failed attempt, and [`ReconnectState`],
//! the per-transport attempt counter it operates on.
//!
//! # Retry Strategy
//!
//! - Attempt `n` (1-based) waits `base_delay * 2^(n-1)`
//! - The delay is capped at `max_delay`
//! - Optional ±25% jitter to spread reconnect storms after a backend restart
//! - After `max_attempts` consecutive failures the policy is exhausted and the
//!   transport stays down until `connect()` is called explicitly
//!
//! The policy is pure: it never sleeps. The connection manager owns the timer,
//! which keeps the policy testable without a runtime.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

/// Reconnect configuration with exponential backoff.
///
/// # Example
///
/// ```
/// use maville_notify::ReconnectPolicy;
/// use std::time::Duration;
///
/// let policy = ReconnectPolicy {
///     max_attempts: 3,
///     base_delay: Duration::from_millis(500),
///     max_delay: Duration::from_secs(10),
///     jitter: false,
/// };
///
/// assert_eq!(policy.delay_for(1), Duration::from_millis(500));
/// assert_eq!(policy.delay_for(3), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Maximum number of consecutive reconnect attempts (0 = never reconnect).
    pub max_attempts: u32,

    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,

    /// Upper bound for any single delay (caps exponential growth).
    pub max_delay: Duration,

    /// Apply ±25% randomization to each delay.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    /// Reasonable default reconnect configuration.
    ///
    /// - `max_attempts`: 5
    /// - `base_delay`: 1s
    /// - `max_delay`: 30s
    /// - `jitter`: off
    fn default() -> Self {
        // ---
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl ReconnectPolicy {
    // ---
    /// A policy that never reconnects automatically.
    pub fn never() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Un-jittered delay before reconnect attempt `attempt` (1-based).
    ///
    /// Attempt 0 is treated as attempt 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        // ---
        let exponent = attempt.max(1) - 1;
        let factor = 2u32.checked_pow(exponent);

        factor
            .and_then(|f| self.base_delay.checked_mul(f))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Returns true once `state` has used up every allowed attempt.
    pub fn is_exhausted(&self, state: &ReconnectState) -> bool {
        state.attempts >= self.max_attempts
    }

    /// Consume one attempt and return how long to wait before it.
    ///
    /// Returns `None` when the policy is exhausted; the caller must then stop
    /// retrying.
    pub fn next_delay(&self, state: &mut ReconnectState) -> Option<Duration> {
        // ---
        if self.is_exhausted(state) {
            return None;
        }

        state.attempts += 1;
        let delay = self.delay_for(state.attempts);

        Some(if self.jitter {
            apply_jitter(delay)
        } else {
            delay
        })
    }
}

/// Consecutive failed reconnect attempts for one transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectState {
    attempts: u32,
}

impl ReconnectState {
    /// Attempts consumed since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Forget previous failures (called on every successful connect).
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Spread `delay` uniformly over 75%..=125% of its nominal value.
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    // Fresh RandomState keys make the empty hash a random word.
    let word = RandomState::new().build_hasher().finish();
    let quarter = delay / 4;
    let spread = quarter.mul_f64((word % 1025) as f64 / 512.0);

    delay - quarter + spread
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn policy(max_attempts: u32, base_ms: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(60),
            jitter: false,
        }
    }

    #[test]
    fn test_delays_double_from_base() {
        // ---
        let policy = policy(3, 100);
        let mut state = ReconnectState::default();

        assert_eq!(
            policy.next_delay(&mut state),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            policy.next_delay(&mut state),
            Some(Duration::from_millis(200))
        );
        assert_eq!(
            policy.next_delay(&mut state),
            Some(Duration::from_millis(400))
        );
        assert_eq!(state.attempts(), 3);
    }

    #[test]
    fn test_exhaustion_is_terminal() {
        // ---
        let policy = policy(2, 10);
        let mut state = ReconnectState::default();

        assert!(policy.next_delay(&mut state).is_some());
        assert!(policy.next_delay(&mut state).is_some());
        assert!(policy.is_exhausted(&state));
        assert_eq!(policy.next_delay(&mut state), None);
        assert_eq!(policy.next_delay(&mut state), None);
        assert_eq!(state.attempts(), 2);
    }

    #[test]
    fn test_reset_restores_full_budget() {
        // ---
        let policy = policy(1, 50);
        let mut state = ReconnectState::default();

        assert!(policy.next_delay(&mut state).is_some());
        assert!(policy.next_delay(&mut state).is_none());

        state.reset();
        assert_eq!(
            policy.next_delay(&mut state),
            Some(Duration::from_millis(50))
        );
    }

    #[test]
    fn test_never_policy_gives_up_immediately() {
        // ---
        let mut state = ReconnectState::default();
        assert_eq!(ReconnectPolicy::never().next_delay(&mut state), None);
    }

    #[test]
    fn test_max_delay_cap() {
        // ---
        let policy = ReconnectPolicy {
            max_attempts: 100,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter: false,
        };

        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for(4), Duration::from_millis(50));
        // 2^63 overflows u32: falls back to the cap
        assert_eq!(policy.delay_for(64), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_range() {
        // ---
        let delay = Duration::from_millis(100);

        for _ in 0..100 {
            let jittered = apply_jitter(delay);

            assert!(
                jittered >= Duration::from_millis(75),
                "jitter too low: {jittered:?}",
            );
            assert!(
                jittered <= Duration::from_millis(125),
                "jitter too high: {jittered:?}",
            );
        }
    }

    #[test]
    fn test_jittered_policy_stays_near_nominal() {
        // ---
        let policy = ReconnectPolicy {
            jitter: true,
            ..policy(1, 1000)
        };
        let mut state = ReconnectState::default();

        let delay = policy.next_delay(&mut state).unwrap();
        assert!(delay >= Duration::from_millis(750));
        assert!(delay <= Duration::from_millis(1250));
    }
}
