//! Delay strategies for retrying failed operations.
//!
//! A single configurable [`Backoff`] serves both the retry executor and the
//! query controller. Queries default to linear growth, the executor to
//! capped exponential growth.

use std::time::Duration;

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
  /// `delay * attempt`: 1s, 2s, 3s, ...
  Linear {
    /// Delay for the first retry; each subsequent retry adds this much.
    delay: Duration,
  },
  /// `min(base * factor^(attempt-1), max)`: 1s, 2s, 4s, 8s, 10s, 10s, ...
  Exponential {
    /// Delay for the first retry.
    base: Duration,
    /// Multiplier applied per attempt.
    factor: f64,
    /// Ceiling no single wait may exceed.
    max: Duration,
  },
}

impl Backoff {
  /// Linear backoff with a 1 second step.
  pub fn linear_default() -> Self {
    Backoff::Linear {
      delay: Duration::from_millis(1000),
    }
  }

  /// Exponential backoff: base 1s, factor 2, capped at 10s.
  pub fn exponential_default() -> Self {
    Backoff::Exponential {
      base: Duration::from_millis(1000),
      factor: 2.0,
      max: Duration::from_millis(10_000),
    }
  }

  /// Delay before retry number `attempt` (1-based).
  ///
  /// `attempt` is the number of failures observed so far, i.e. the first
  /// retry passes 1.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    match *self {
      Backoff::Linear { delay } => delay * attempt,
      Backoff::Exponential { base, factor, max } => {
        let scaled = base.as_secs_f64() * factor.powf(f64::from(attempt - 1));
        // Clamp in float space: large attempts overflow what a Duration
        // can represent, so the cap applies before conversion.
        if !scaled.is_finite() || scaled >= max.as_secs_f64() {
          max
        } else {
          Duration::from_secs_f64(scaled.max(0.0))
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_linear_growth() {
    let backoff = Backoff::Linear {
      delay: Duration::from_millis(500),
    };
    assert_eq!(backoff.delay_for(1), Duration::from_millis(500));
    assert_eq!(backoff.delay_for(2), Duration::from_millis(1000));
    assert_eq!(backoff.delay_for(3), Duration::from_millis(1500));
  }

  #[test]
  fn test_exponential_growth_with_cap() {
    let backoff = Backoff::exponential_default();
    let delays: Vec<u64> = (1..=6).map(|n| backoff.delay_for(n).as_millis() as u64).collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000, 10_000]);
  }

  #[test]
  fn test_large_attempt_saturates_at_cap() {
    let backoff = Backoff::exponential_default();
    // 2^65 seconds overflows Duration; the cap must win, not a panic.
    assert_eq!(backoff.delay_for(66), Duration::from_millis(10_000));
    assert_eq!(backoff.delay_for(1_000), Duration::from_millis(10_000));
    assert_eq!(backoff.delay_for(u32::MAX), Duration::from_millis(10_000));
  }

  #[test]
  fn test_attempt_zero_treated_as_first() {
    let backoff = Backoff::exponential_default();
    assert_eq!(backoff.delay_for(0), backoff.delay_for(1));
  }
}
