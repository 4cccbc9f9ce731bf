use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Bounded exponential backoff with jitter.
///
/// Attempts are numbered from 1. After attempt `n` fails, the next attempt
/// becomes visible after `backoff(n)`, as long as `n < max_attempts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub initial_backoff_ms: u64,
  pub max_backoff_ms: u64,
  pub multiplier: f64,
  /// Fraction of the computed delay applied as random jitter in both
  /// directions (0.2 means +/- 20%).
  pub jitter: f64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      initial_backoff_ms: 200,
      max_backoff_ms: 30_000,
      multiplier: 2.0,
      jitter: 0.2,
    }
  }
}

impl RetryPolicy {
  /// Whether another attempt is allowed after `attempt` failed.
  pub fn should_retry(&self, attempt: u32) -> bool {
    attempt < self.max_attempts
  }

  /// The delay before the attempt following `attempt`, without jitter.
  pub fn base_delay(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63) as i32;
    let delay = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
    let capped = delay.min(self.max_backoff_ms as f64);
    Duration::from_millis(capped as u64)
  }

  /// The delay before the attempt following `attempt`, with jitter applied.
  /// Never exceeds `max_backoff_ms`.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let base = self.base_delay(attempt).as_millis() as f64;
    let jitter = self.jitter.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
      rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
    } else {
      1.0
    };
    let delay = (base * factor).min(self.max_backoff_ms as f64).max(0.0);
    Duration::from_millis(delay as u64)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_policy() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.max_attempts, 3);
    assert!(policy.should_retry(1));
    assert!(policy.should_retry(2));
    assert!(!policy.should_retry(3));
  }

  #[test]
  fn test_base_delay_grows_exponentially() {
    let policy = RetryPolicy {
      initial_backoff_ms: 100,
      multiplier: 2.0,
      max_backoff_ms: 10_000,
      ..RetryPolicy::default()
    };

    assert_eq!(policy.base_delay(1), Duration::from_millis(100));
    assert_eq!(policy.base_delay(2), Duration::from_millis(200));
    assert_eq!(policy.base_delay(3), Duration::from_millis(400));
  }

  #[test]
  fn test_base_delay_is_capped() {
    let policy = RetryPolicy {
      initial_backoff_ms: 1_000,
      multiplier: 10.0,
      max_backoff_ms: 5_000,
      ..RetryPolicy::default()
    };

    assert_eq!(policy.base_delay(4), Duration::from_millis(5_000));
    assert_eq!(policy.base_delay(60), Duration::from_millis(5_000));
  }

  #[test]
  fn test_jitter_stays_within_bounds() {
    let policy = RetryPolicy {
      initial_backoff_ms: 1_000,
      multiplier: 2.0,
      max_backoff_ms: 60_000,
      jitter: 0.25,
      ..RetryPolicy::default()
    };

    for _ in 0..100 {
      let delay = policy.backoff(2).as_millis();
      assert!((1_500..=2_500).contains(&delay), "delay out of range: {}", delay);
    }
  }

  #[test]
  fn test_jitter_never_exceeds_cap() {
    let policy = RetryPolicy {
      initial_backoff_ms: 10_000,
      multiplier: 2.0,
      max_backoff_ms: 10_000,
      jitter: 0.5,
      ..RetryPolicy::default()
    };

    for _ in 0..100 {
      assert!(policy.backoff(3) <= Duration::from_millis(10_000));
    }
  }
}
