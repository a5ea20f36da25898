//! Bounded retry execution with pluggable backoff and retry predicate.
//!
//! [`Retrier`] wraps an arbitrary async operation and re-runs it on failure,
//! sequentially, up to a configured attempt limit. Attempts never overlap and
//! no single wait exceeds the backoff cap.
//!
//! # Example
//!
//! ```ignore
//! let retrier = Retrier::new(RetryPolicy::network())
//!   .on_retry(|attempt, err| tracing::debug!(attempt, %err, "retrying"));
//!
//! let user = retrier.run(|| async { api.fetch_user(id).await }).await?;
//! ```

use std::future::Future;

use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::error::QueryError;

/// Attempt limit and delay strategy for a [`Retrier`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  /// Maximum number of times the operation may run, including the first.
  pub max_attempts: u32,
  /// Delay strategy between attempts.
  pub backoff: Backoff,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      backoff: Backoff::exponential_default(),
    }
  }
}

impl RetryPolicy {
  /// Recovery strategy for network failures: quick, short-delay retries.
  pub fn network() -> Self {
    Self {
      max_attempts: 3,
      backoff: Backoff::Exponential {
        base: std::time::Duration::from_millis(250),
        factor: 2.0,
        max: std::time::Duration::from_millis(5_000),
      },
    }
  }

  /// Recovery strategy for auth failures: a retry will not change the
  /// outcome, so the operation runs exactly once.
  pub fn auth() -> Self {
    Self {
      max_attempts: 1,
      backoff: Backoff::exponential_default(),
    }
  }

  /// Recovery strategy for server (5xx) failures: these are often transient,
  /// so retry more times with a larger backoff.
  pub fn server() -> Self {
    Self {
      max_attempts: 5,
      backoff: Backoff::Exponential {
        base: std::time::Duration::from_millis(2_000),
        factor: 2.0,
        max: std::time::Duration::from_millis(30_000),
      },
    }
  }
}

type RetryPredicate = Box<dyn Fn(&QueryError) -> bool + Send + Sync>;
type RetryCallback = Box<dyn Fn(u32, &QueryError) + Send + Sync>;
type ExhaustedCallback = Box<dyn Fn(&QueryError) + Send + Sync>;

/// Retry executor for async operations.
pub struct Retrier {
  policy: RetryPolicy,
  retry_if: RetryPredicate,
  on_retry: Option<RetryCallback>,
  on_exhausted: Option<ExhaustedCallback>,
}

impl Retrier {
  /// Create a retrier with the given policy.
  ///
  /// The default retry predicate accepts every error. Pass
  /// [`QueryError::is_retryable`] to [`retry_if`](Self::retry_if) to skip
  /// retries for errors the taxonomy considers permanent.
  pub fn new(policy: RetryPolicy) -> Self {
    Self {
      policy,
      retry_if: Box::new(|_| true),
      on_retry: None,
      on_exhausted: None,
    }
  }

  /// Replace the retry predicate. Return `false` to stop retrying and
  /// surface the error immediately.
  pub fn retry_if<F>(mut self, predicate: F) -> Self
  where
    F: Fn(&QueryError) -> bool + Send + Sync + 'static,
  {
    self.retry_if = Box::new(predicate);
    self
  }

  /// Invoked before each delay, with the failed attempt number (1-based)
  /// and the error that triggered the retry.
  pub fn on_retry<F>(mut self, callback: F) -> Self
  where
    F: Fn(u32, &QueryError) + Send + Sync + 'static,
  {
    self.on_retry = Some(Box::new(callback));
    self
  }

  /// Invoked once when the attempt limit is reached, just before the last
  /// error is returned.
  pub fn on_exhausted<F>(mut self, callback: F) -> Self
  where
    F: Fn(&QueryError) + Send + Sync + 'static,
  {
    self.on_exhausted = Some(Box::new(callback));
    self
  }

  /// Run the operation, retrying on failure per the policy.
  ///
  /// The operation runs at most `max_attempts` times. The last error is
  /// always surfaced; nothing is swallowed.
  pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, QueryError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QueryError>>,
  {
    let max_attempts = self.policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
      match operation().await {
        Ok(value) => return Ok(value),
        Err(error) => {
          if attempt == max_attempts {
            warn!(attempt, %error, "retry attempts exhausted");
            if let Some(callback) = &self.on_exhausted {
              callback(&error);
            }
            return Err(error);
          }

          if !(self.retry_if)(&error) {
            debug!(attempt, %error, "error not retryable, giving up");
            return Err(error);
          }

          let delay = self.policy.backoff.delay_for(attempt);
          debug!(attempt, delay_ms = delay.as_millis() as u64, %error, "retrying after delay");
          if let Some(callback) = &self.on_retry {
            callback(attempt, &error);
          }
          tokio::time::sleep(delay).await;
        }
      }
    }

    unreachable!("loop returns on the final attempt")
  }
}
