//! Error taxonomy for query and mutation operations.
//!
//! Errors are classified into categories that drive the retry strategy:
//! network and server failures are often transient and worth retrying,
//! auth and other client failures are not.

use std::time::Duration;
use thiserror::Error;

/// Error type for query, mutation, retry, and circuit breaker operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
  /// Connectivity, timeout, or fetch failure. Retryable.
  #[error("network error: {0}")]
  Network(String),

  /// Unauthorized or forbidden. Retrying will not change the outcome.
  #[error("auth error: {0}")]
  Auth(String),

  /// 5xx-class failure. Often transient, retried aggressively.
  #[error("server error: {0}")]
  Server(String),

  /// Other 4xx-class or validation failure. Not retried.
  #[error("client error: {0}")]
  Client(String),

  /// Rejected by an open circuit breaker without invoking the operation.
  ///
  /// Distinct from any error the wrapped operation could produce, so callers
  /// can tell "the service failed" apart from "we stopped calling it".
  #[error("circuit open, next probe in {retry_after:?}")]
  CircuitOpen {
    /// Time remaining until the breaker allows a probe call.
    retry_after: Duration,
  },

  /// Wrapper applied by `MutationController::mutate` on its failure path.
  /// The original error is preserved as the source.
  #[error("mutation failed: {0}")]
  Mutation(#[source] Box<QueryError>),
}

impl QueryError {
  /// Classify a stringly-typed transport error by message content.
  ///
  /// This mirrors the pragmatic heuristic used by UI-facing fetch layers:
  /// callers that already have structured status codes should construct the
  /// variants directly instead.
  pub fn from_message(message: impl Into<String>) -> Self {
    let message = message.into();
    let lower = message.to_lowercase();

    if lower.contains("network")
      || lower.contains("timeout")
      || lower.contains("timed out")
      || lower.contains("connection")
      || lower.contains("fetch")
    {
      QueryError::Network(message)
    } else if lower.contains("401")
      || lower.contains("403")
      || lower.contains("unauthorized")
      || lower.contains("forbidden")
    {
      QueryError::Auth(message)
    } else if lower.contains("500")
      || lower.contains("502")
      || lower.contains("503")
      || lower.contains("504")
      || lower.contains("server")
    {
      QueryError::Server(message)
    } else {
      QueryError::Client(message)
    }
  }

  /// Whether the default recovery strategy should retry this error.
  pub fn is_retryable(&self) -> bool {
    matches!(self, QueryError::Network(_) | QueryError::Server(_))
  }

  /// The innermost error, unwrapping any mutation wrapper.
  pub fn root(&self) -> &QueryError {
    match self {
      QueryError::Mutation(inner) => inner.root(),
      other => other,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_classify_network() {
    assert!(matches!(
      QueryError::from_message("connection refused"),
      QueryError::Network(_)
    ));
    assert!(matches!(
      QueryError::from_message("request timed out"),
      QueryError::Network(_)
    ));
  }

  #[test]
  fn test_classify_auth() {
    assert!(matches!(
      QueryError::from_message("401 Unauthorized"),
      QueryError::Auth(_)
    ));
    assert!(matches!(
      QueryError::from_message("Forbidden"),
      QueryError::Auth(_)
    ));
  }

  #[test]
  fn test_classify_server() {
    assert!(matches!(
      QueryError::from_message("502 Bad Gateway"),
      QueryError::Server(_)
    ));
  }

  #[test]
  fn test_classify_fallback_is_client() {
    assert!(matches!(
      QueryError::from_message("validation failed: name required"),
      QueryError::Client(_)
    ));
  }

  #[test]
  fn test_retryability() {
    assert!(QueryError::Network("x".into()).is_retryable());
    assert!(QueryError::Server("x".into()).is_retryable());
    assert!(!QueryError::Auth("x".into()).is_retryable());
    assert!(!QueryError::Client("x".into()).is_retryable());
    assert!(!QueryError::CircuitOpen {
      retry_after: Duration::from_secs(1)
    }
    .is_retryable());
  }

  #[test]
  fn test_mutation_wrapper_preserves_original() {
    let original = QueryError::Server("500 oops".into());
    let wrapped = QueryError::Mutation(Box::new(original.clone()));

    assert_eq!(wrapped.root(), &original);
    assert!(wrapped.to_string().contains("500 oops"));
  }
}
