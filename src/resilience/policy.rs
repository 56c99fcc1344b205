//! Retry and polling policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resilience::backoff::calculate_backoff;

/// Bounded retry budget applied to one operation or polling loop.
///
/// A policy is a plain value injected into the orchestrator; nothing in it
/// is protocol mandated.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,

    /// Delay after the first failed attempt in milliseconds.
    pub initial_delay_ms: u64,

    /// Growth factor applied per attempt.
    pub factor: f64,

    /// Upper bound for a single delay in milliseconds.
    pub max_delay_ms: u64,

    /// Wall-clock deadline for the whole loop in seconds.
    pub deadline_secs: u64,

    /// Shave a random fraction off each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1000,
            factor: 1.5,
            max_delay_ms: 10_000,
            deadline_secs: 120,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy for transient transport failures on individual calls.
    pub fn transport() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            factor: 2.0,
            max_delay_ms: 5000,
            deadline_secs: 60,
            jitter: true,
        }
    }

    /// Deterministic policy without jitter, mostly useful in tests.
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: delay_ms,
            factor: 1.0,
            max_delay_ms: delay_ms,
            deadline_secs: 3600,
            jitter: false,
        }
    }

    /// Delay to wait after `attempt` failed attempts.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        calculate_backoff(
            attempt,
            self.initial_delay_ms,
            self.factor,
            self.max_delay_ms,
            self.jitter,
        )
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Upper bound on time spent sleeping between attempts.
    pub fn worst_case_wait(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.saturating_mul(self.max_attempts as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_delay_ms, 1000);
        assert_eq!(policy.factor, 1.5);
        assert_eq!(policy.max_delay_ms, 10_000);
    }

    #[test]
    fn test_fixed_policy_has_constant_delay() {
        let policy = RetryPolicy::fixed(5, 250);
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(4), Duration::from_millis(250));
        assert_eq!(policy.worst_case_wait(), Duration::from_millis(1250));
    }

    #[test]
    fn test_policy_from_toml() {
        let policy: RetryPolicy = toml::from_str("max_attempts = 4\nfactor = 2.0").unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.factor, 2.0);
        assert_eq!(policy.initial_delay_ms, 1000);
    }
}
