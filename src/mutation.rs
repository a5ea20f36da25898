//! Mutation controller: one write-operation's lifecycle.
//!
//! Mutations bypass the cache entirely: no caching, no retry, no
//! deduplication. Execute, report through callbacks and observable state,
//! and re-raise failures to the caller. Invalidate related query keys from
//! `on_success` to trigger refetching.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::error::QueryError;

/// Caller-visible state of a mutation.
///
/// Each invocation overwrites the previous terminal state; [`reset`]
/// restores the defaults.
///
/// [`reset`]: MutationController::reset
#[derive(Debug, Clone)]
pub struct MutationState<T> {
  /// Result of the last successful invocation, if any.
  pub data: Option<T>,
  /// Whether an invocation is in progress.
  pub is_loading: bool,
  /// Whether the last invocation failed.
  pub is_error: bool,
  /// The last invocation's error, when `is_error` is set.
  pub error: Option<QueryError>,
}

impl<T> Default for MutationState<T> {
  fn default() -> Self {
    Self {
      data: None,
      is_loading: false,
      is_error: false,
      error: None,
    }
  }
}

type MutateFn<V, T> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;
type SuccessCallback<T, V> = Box<dyn Fn(&T, &V) + Send + Sync>;
type ErrorCallback<V> = Box<dyn Fn(&QueryError, &V) + Send + Sync>;
type SettledCallback<T, V> = Box<dyn Fn(Option<&T>, Option<&QueryError>, &V) + Send + Sync>;

/// Builder for [`MutationController`].
pub struct MutationBuilder<V, T> {
  operation: MutateFn<V, T>,
  on_success: Option<SuccessCallback<T, V>>,
  on_error: Option<ErrorCallback<V>>,
  on_settled: Option<SettledCallback<T, V>>,
}

impl<V, T> MutationBuilder<V, T>
where
  V: Clone + Send + 'static,
  T: Clone + Send + Sync + 'static,
{
  /// Create a builder around the write operation.
  pub fn new<F, Fut>(operation: F) -> Self
  where
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
  {
    Self {
      operation: Arc::new(move |variables| Box::pin(operation(variables))),
      on_success: None,
      on_error: None,
      on_settled: None,
    }
  }

  /// Invoked with the result and the variables after a successful
  /// invocation, before `on_settled`.
  pub fn on_success<F>(mut self, callback: F) -> Self
  where
    F: Fn(&T, &V) + Send + Sync + 'static,
  {
    self.on_success = Some(Box::new(callback));
    self
  }

  /// Invoked with the error and the variables after a failed invocation,
  /// before `on_settled`.
  pub fn on_error<F>(mut self, callback: F) -> Self
  where
    F: Fn(&QueryError, &V) + Send + Sync + 'static,
  {
    self.on_error = Some(Box::new(callback));
    self
  }

  /// Invoked after every invocation, success or failure, last.
  pub fn on_settled<F>(mut self, callback: F) -> Self
  where
    F: Fn(Option<&T>, Option<&QueryError>, &V) + Send + Sync + 'static,
  {
    self.on_settled = Some(Box::new(callback));
    self
  }

  /// Build the controller.
  pub fn build(self) -> MutationController<V, T> {
    let (state_tx, _) = watch::channel(MutationState::default());
    MutationController {
      operation: self.operation,
      on_success: self.on_success,
      on_error: self.on_error,
      on_settled: self.on_settled,
      state_tx,
    }
  }
}

/// Executes a write operation and reports its outcome.
///
/// Safe to invoke repeatedly; invocations are expected to be sequential and
/// each overwrites the previous terminal state.
pub struct MutationController<V, T> {
  operation: MutateFn<V, T>,
  on_success: Option<SuccessCallback<T, V>>,
  on_error: Option<ErrorCallback<V>>,
  on_settled: Option<SettledCallback<T, V>>,
  state_tx: watch::Sender<MutationState<T>>,
}

impl<V, T> MutationController<V, T>
where
  V: Clone + Send + 'static,
  T: Clone + Send + Sync + 'static,
{
  /// Subscribe to state transitions.
  pub fn subscribe(&self) -> watch::Receiver<MutationState<T>> {
    self.state_tx.subscribe()
  }

  /// Snapshot of the current state.
  pub fn state(&self) -> MutationState<T> {
    self.state_tx.borrow().clone()
  }

  /// Run the mutation. Failures are re-raised wrapped in
  /// [`QueryError::Mutation`]; the original error is preserved as the
  /// source and in the message.
  pub async fn mutate(&self, variables: V) -> Result<T, QueryError> {
    self
      .execute(variables)
      .await
      .map_err(|error| QueryError::Mutation(Box::new(error)))
  }

  /// Run the mutation, re-raising failures unwrapped.
  pub async fn mutate_async(&self, variables: V) -> Result<T, QueryError> {
    self.execute(variables).await
  }

  /// Restore the default state regardless of any prior terminal state.
  pub fn reset(&self) {
    self.state_tx.send_replace(MutationState::default());
  }

  async fn execute(&self, variables: V) -> Result<T, QueryError> {
    self.state_tx.send_modify(|state| {
      state.is_loading = true;
      state.is_error = false;
      state.error = None;
    });

    match (self.operation)(variables.clone()).await {
      Ok(data) => {
        self.state_tx.send_modify(|state| {
          state.data = Some(data.clone());
          state.is_error = false;
          state.error = None;
          state.is_loading = false;
        });
        if let Some(callback) = &self.on_success {
          callback(&data, &variables);
        }
        if let Some(callback) = &self.on_settled {
          callback(Some(&data), None, &variables);
        }
        Ok(data)
      }
      Err(error) => {
        self.state_tx.send_modify(|state| {
          state.is_error = true;
          state.error = Some(error.clone());
          state.is_loading = false;
        });
        if let Some(callback) = &self.on_error {
          callback(&error, &variables);
        }
        if let Some(callback) = &self.on_settled {
          callback(None, Some(&error), &variables);
        }
        Err(error)
      }
    }
  }
}
