//! Circuit breaker for isolating persistently failing operations.
//!
//! After `failure_threshold` consecutive failures the circuit opens and all
//! calls are rejected immediately, without invoking the wrapped operation.
//! Once `reset_timeout` has elapsed the next call probes the operation in
//! half-open state; three consecutive probe successes close the circuit,
//! any probe failure reopens it.
//!
//! The open-to-half-open transition happens lazily on call, not via a
//! background timer.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::error::QueryError;

/// The three states of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
  /// Normal operation. Calls pass through.
  Closed,
  /// Failing fast. Calls are rejected without invoking the operation.
  Open,
  /// Testing recovery. Calls pass through as probes.
  HalfOpen,
}

impl std::fmt::Display for CircuitState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Closed => write!(f, "closed"),
      Self::Open => write!(f, "open"),
      Self::HalfOpen => write!(f, "half_open"),
    }
  }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
  /// Consecutive failures in closed state before the circuit opens.
  pub failure_threshold: u32,
  /// How long the circuit stays open before the next call may probe.
  pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
  fn default() -> Self {
    Self {
      failure_threshold: 5,
      reset_timeout: Duration::from_millis(60_000),
    }
  }
}

/// Consecutive half-open successes required to close the circuit.
const PROBE_SUCCESSES_TO_CLOSE: u32 = 3;

struct Inner {
  state: CircuitState,
  failures: u32,
  probe_successes: u32,
  last_failure: Option<Instant>,
}

type StateChangeCallback = Box<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

/// A three-state failure-isolation guard for async operations.
///
/// One instance guards one logical operation; share an instance explicitly
/// (e.g. behind an `Arc`) to pool failure accounting across callers.
pub struct CircuitBreaker {
  inner: Mutex<Inner>,
  config: CircuitBreakerConfig,
  on_state_change: Option<StateChangeCallback>,
}

impl CircuitBreaker {
  /// Create a breaker with the given configuration, initially closed.
  pub fn new(config: CircuitBreakerConfig) -> Self {
    Self {
      inner: Mutex::new(Inner {
        state: CircuitState::Closed,
        failures: 0,
        probe_successes: 0,
        last_failure: None,
      }),
      config,
      on_state_change: None,
    }
  }

  /// Register a callback invoked exactly once per actual state transition.
  pub fn on_state_change<F>(mut self, callback: F) -> Self
  where
    F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
  {
    self.on_state_change = Some(Box::new(callback));
    self
  }

  /// Current state. Does not take the lazy open-to-half-open transition;
  /// that happens on the next call.
  pub fn state(&self) -> CircuitState {
    self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
  }

  /// Number of consecutive failures recorded in closed state.
  pub fn failure_count(&self) -> u32 {
    self.inner.lock().unwrap_or_else(|e| e.into_inner()).failures
  }

  /// Run the operation through the breaker.
  ///
  /// Returns [`QueryError::CircuitOpen`] without invoking the operation when
  /// the circuit is open and has not yet aged past the reset timeout.
  pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, QueryError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, QueryError>>,
  {
    self.try_acquire()?;

    match operation().await {
      Ok(value) => {
        self.record_success();
        Ok(value)
      }
      Err(error) => {
        self.record_failure();
        Err(error)
      }
    }
  }

  /// Check whether a call may proceed, taking the lazy open-to-half-open
  /// transition when the reset timeout has elapsed.
  ///
  /// Public so the breaker can be composed manually with a [`Retrier`]
  /// (check before each attempt, record after).
  ///
  /// [`Retrier`]: crate::retry::Retrier
  pub fn try_acquire(&self) -> Result<(), QueryError> {
    let transition;
    {
      let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
      match inner.state {
        CircuitState::Closed | CircuitState::HalfOpen => return Ok(()),
        CircuitState::Open => {
          let elapsed = inner
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX);

          if elapsed > self.config.reset_timeout {
            inner.probe_successes = 0;
            transition = Self::set_state(&mut inner, CircuitState::HalfOpen);
          } else {
            return Err(QueryError::CircuitOpen {
              retry_after: self.config.reset_timeout - elapsed,
            });
          }
        }
      }
    }
    self.notify(transition);
    Ok(())
  }

  /// Record a successful operation outcome.
  pub fn record_success(&self) {
    let transition;
    {
      let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
      match inner.state {
        CircuitState::Closed => {
          inner.failures = 0;
          transition = None;
        }
        CircuitState::HalfOpen => {
          inner.probe_successes += 1;
          if inner.probe_successes >= PROBE_SUCCESSES_TO_CLOSE {
            inner.failures = 0;
            transition = Self::set_state(&mut inner, CircuitState::Closed);
          } else {
            transition = None;
          }
        }
        // A success cannot be recorded while open; calls never pass through.
        CircuitState::Open => transition = None,
      }
    }
    self.notify(transition);
  }

  /// Record a failed operation outcome.
  pub fn record_failure(&self) {
    let transition;
    {
      let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
      inner.failures += 1;

      match inner.state {
        CircuitState::Closed => {
          inner.last_failure = Some(Instant::now());
          if inner.failures >= self.config.failure_threshold {
            transition = Self::set_state(&mut inner, CircuitState::Open);
          } else {
            transition = None;
          }
        }
        // A single probe failure reopens the circuit.
        CircuitState::HalfOpen => {
          inner.last_failure = Some(Instant::now());
          transition = Self::set_state(&mut inner, CircuitState::Open);
        }
        // The timeout is armed by the failure that opened the circuit;
        // failures reported while already open must not extend the window.
        CircuitState::Open => transition = None,
      }
    }
    self.notify(transition);
  }

  fn set_state(inner: &mut Inner, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
    if inner.state == to {
      return None;
    }
    let from = inner.state;
    inner.state = to;
    Some((from, to))
  }

  // Invoked outside the lock so callbacks may re-enter the breaker.
  fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
    if let Some((from, to)) = transition {
      if to == CircuitState::Open {
        warn!(%from, %to, "circuit breaker opened");
      }
      if let Some(callback) = &self.on_state_change {
        callback(from, to);
      }
    }
  }
}

impl Default for CircuitBreaker {
  fn default() -> Self {
    Self::new(CircuitBreakerConfig::default())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  fn test_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
      failure_threshold: 5,
      reset_timeout: Duration::from_secs(60),
    }
  }

  async fn fail(breaker: &CircuitBreaker) {
    let _: Result<(), _> = breaker
      .call(|| async { Err(QueryError::Server("500".into())) })
      .await;
  }

  async fn succeed(breaker: &CircuitBreaker) {
    let _ = breaker.call(|| async { Ok(()) }).await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_opens_after_threshold_failures() {
    let breaker = CircuitBreaker::new(test_config());

    for _ in 0..4 {
      fail(&breaker).await;
      assert_eq!(breaker.state(), CircuitState::Closed);
    }
    fail(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);
  }

  #[tokio::test(start_paused = true)]
  async fn test_open_rejects_without_invoking() {
    let breaker = CircuitBreaker::new(test_config());
    for _ in 0..5 {
      fail(&breaker).await;
    }

    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();
    let result = breaker
      .call(|| {
        let calls = calls_clone.clone();
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(())
        }
      })
      .await;

    assert!(matches!(result, Err(QueryError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_probes_after_reset_timeout() {
    let breaker = CircuitBreaker::new(test_config());
    for _ in 0..5 {
      fail(&breaker).await;
    }

    tokio::time::advance(Duration::from_secs(61)).await;

    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();
    let result = breaker
      .call(|| {
        let calls = calls_clone.clone();
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(())
        }
      })
      .await;

    assert!(result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
  }

  #[tokio::test(start_paused = true)]
  async fn test_three_probe_successes_close() {
    let breaker = CircuitBreaker::new(test_config());
    for _ in 0..5 {
      fail(&breaker).await;
    }
    tokio::time::advance(Duration::from_secs(61)).await;

    succeed(&breaker).await;
    succeed(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    succeed(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_probe_failure_reopens_immediately() {
    let breaker = CircuitBreaker::new(test_config());
    for _ in 0..5 {
      fail(&breaker).await;
    }
    tokio::time::advance(Duration::from_secs(61)).await;

    succeed(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    fail(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);
  }

  #[tokio::test(start_paused = true)]
  async fn test_closed_success_resets_failure_count() {
    let breaker = CircuitBreaker::new(test_config());
    for _ in 0..4 {
      fail(&breaker).await;
    }
    succeed(&breaker).await;
    assert_eq!(breaker.failure_count(), 0);

    // Needs a full threshold of fresh failures to open again.
    for _ in 0..4 {
      fail(&breaker).await;
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
  }

  #[tokio::test(start_paused = true)]
  async fn test_state_change_fires_once_per_transition() {
    let transitions = Arc::new(std::sync::Mutex::new(Vec::new()));
    let transitions_clone = transitions.clone();

    let breaker = CircuitBreaker::new(test_config()).on_state_change(move |from, to| {
      transitions_clone.lock().unwrap().push((from, to));
    });

    for _ in 0..7 {
      fail(&breaker).await;
    }
    tokio::time::advance(Duration::from_secs(61)).await;
    for _ in 0..3 {
      succeed(&breaker).await;
    }

    let seen = transitions.lock().unwrap().clone();
    assert_eq!(
      seen,
      vec![
        (CircuitState::Closed, CircuitState::Open),
        (CircuitState::Open, CircuitState::HalfOpen),
        (CircuitState::HalfOpen, CircuitState::Closed),
      ]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_while_open_does_not_extend_window() {
    let breaker = CircuitBreaker::new(test_config());
    for _ in 0..5 {
      fail(&breaker).await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // Manual composition may keep reporting failures while the circuit is
    // open; the reset window still runs from the failure that opened it.
    tokio::time::advance(Duration::from_secs(30)).await;
    breaker.record_failure();

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(breaker.try_acquire().is_ok());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
  }

  #[tokio::test(start_paused = true)]
  async fn test_circuit_open_error_reports_remaining_time() {
    let breaker = CircuitBreaker::new(test_config());
    for _ in 0..5 {
      fail(&breaker).await;
    }

    tokio::time::advance(Duration::from_secs(20)).await;
    let result: Result<(), _> = breaker.call(|| async { Ok(()) }).await;
    match result {
      Err(QueryError::CircuitOpen { retry_after }) => {
        assert!(retry_after <= Duration::from_secs(40));
        assert!(retry_after > Duration::from_secs(30));
      }
      other => panic!("expected CircuitOpen, got {other:?}"),
    }
  }
}
