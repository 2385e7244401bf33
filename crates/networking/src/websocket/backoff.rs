//! Reconnect backoff policy

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with a cap, optional jitter and an attempt budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Delay before the first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Random spread applied to each delay, 0.2 = ±20%
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Consecutive failed attempts before giving up (None = never give up)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
}

fn default_base_delay_ms() -> u64 { 1000 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_jitter() -> f64 { 0.2 }
fn default_max_attempts() -> Option<u32> { Some(15) }

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl BackoffConfig {
    /// Deterministic policy: no jitter, unlimited attempts
    pub fn fixed(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            jitter: 0.0,
            max_attempts: None,
        }
    }

    /// Whether `attempt` (0-based) is still within budget
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }

    /// Delay before retry number `attempt` (0-based): base doubled per
    /// attempt, capped, then jittered and capped again
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_delay_ms);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let millis = if jitter > 0.0 && exponential > 0 {
            let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
            ((exponential as f64 * factor) as u64).min(self.max_delay_ms)
        } else {
            exponential
        };

        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let policy = BackoffConfig::fixed(1000, 8000);
        let delays: Vec<u64> = (0..6).map(|n| policy.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 8000, 8000]);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = BackoffConfig::fixed(1000, 30_000);
        assert_eq!(policy.delay(200), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffConfig {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: 0.2,
            max_attempts: None,
        };
        for _ in 0..100 {
            let millis = policy.delay(1).as_millis() as u64;
            assert!((1599..=2400).contains(&millis), "delay {} out of range", millis);
        }
    }

    #[test]
    fn test_attempt_budget() {
        let policy = BackoffConfig::default();
        assert!(policy.allows(0));
        assert!(policy.allows(14));
        assert!(!policy.allows(15));
        assert!(BackoffConfig::fixed(10, 10).allows(u32::MAX));
    }
}
