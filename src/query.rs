//! Query controller: one read-operation's lifecycle.
//!
//! A [`QueryController`] orchestrates fetching, cache adoption, bounded
//! background retries, and optional interval/focus refetching for a single
//! cache key. State transitions are published through a watch channel;
//! subscribe with [`QueryController::subscribe`] and render from the latest
//! [`QueryState`].
//!
//! # Example
//!
//! ```ignore
//! let cache = Arc::new(CacheStore::new());
//! let users = QueryBuilder::new("users", cache.clone(), move || {
//!   let api = api.clone();
//!   async move { api.list_users().await }
//! })
//! .config(QueryConfig {
//!   stale_time: Duration::from_secs(60),
//!   ..QueryConfig::default()
//! })
//! .build();
//!
//! users.fetch().await;
//! let state = users.state();
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::cache::{CacheKey, CacheStore, Flight};
use crate::error::QueryError;
use crate::focus::FocusSignal;

/// Caller-visible state of a query.
///
/// `is_loading` is true only until the first resolution (success or
/// exhausted failure); `is_fetching` is true for the duration of any
/// in-flight fetch, including background refreshes.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
  /// Last successful payload, if any.
  pub data: Option<T>,
  /// First load in progress.
  pub is_loading: bool,
  /// Any fetch in progress, foreground or background.
  pub is_fetching: bool,
  /// Whether the last resolution was a failure with retries exhausted.
  pub is_error: bool,
  /// The terminal error, when `is_error` is set.
  pub error: Option<QueryError>,
}

impl<T> Default for QueryState<T> {
  fn default() -> Self {
    Self {
      data: None,
      is_loading: false,
      is_fetching: false,
      is_error: false,
      error: None,
    }
  }
}

impl<T> QueryState<T> {
  /// Whether a successful payload is available.
  pub fn has_data(&self) -> bool {
    self.data.is_some()
  }
}

/// Query behavior configuration. All fields have documented defaults.
#[derive(Debug, Clone)]
pub struct QueryConfig {
  /// When false, every fetch is a no-op. Default `true`.
  pub enabled: bool,
  /// How long a cached result stays fresh. Default 5 minutes.
  pub stale_time: Duration,
  /// How long a cached result is retained. Retained for API parity with the
  /// store's planned eviction; currently unused. Default 10 minutes.
  pub cache_time: Duration,
  /// How many background retries follow a failed fetch. Default 3.
  pub retry: u32,
  /// Delay strategy between retries. Default linear, 1 second step.
  pub backoff: Backoff,
  /// Refetch when the application regains focus and the entry is stale.
  /// Default `false`.
  pub refetch_on_focus: bool,
  /// Periodic background refetch while focused. Default `None`.
  pub refetch_interval: Option<Duration>,
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      stale_time: Duration::from_secs(5 * 60),
      cache_time: Duration::from_secs(10 * 60),
      retry: 3,
      backoff: Backoff::linear_default(),
      refetch_on_focus: false,
      refetch_interval: None,
    }
  }
}

type QueryFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;
type SuccessCallback<T> = Box<dyn Fn(&T) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&QueryError) + Send + Sync>;

/// Builder for [`QueryController`].
pub struct QueryBuilder<T> {
  key: CacheKey,
  cache: Arc<CacheStore>,
  fetcher: QueryFn<T>,
  config: QueryConfig,
  on_success: Option<SuccessCallback<T>>,
  on_error: Option<ErrorCallback>,
  focus: Option<watch::Receiver<bool>>,
}

impl<T> QueryBuilder<T>
where
  T: Clone + Send + Sync + 'static,
{
  /// Create a builder for a query identified by `key`, fetching through the
  /// given operation and caching in `cache`.
  pub fn new<K, F, Fut>(key: K, cache: Arc<CacheStore>, fetcher: F) -> Self
  where
    K: Into<CacheKey>,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
  {
    Self {
      key: key.into(),
      cache,
      fetcher: Arc::new(move || Box::pin(fetcher())),
      config: QueryConfig::default(),
      on_success: None,
      on_error: None,
      focus: None,
    }
  }

  /// Replace the whole configuration.
  pub fn config(mut self, config: QueryConfig) -> Self {
    self.config = config;
    self
  }

  /// Invoked with the payload after every successful fetch (not on cache
  /// adoption).
  pub fn on_success<F>(mut self, callback: F) -> Self
  where
    F: Fn(&T) + Send + Sync + 'static,
  {
    self.on_success = Some(Box::new(callback));
    self
  }

  /// Invoked with the terminal error once retries are exhausted.
  pub fn on_error<F>(mut self, callback: F) -> Self
  where
    F: Fn(&QueryError) + Send + Sync + 'static,
  {
    self.on_error = Some(Box::new(callback));
    self
  }

  /// Attach a foreground signal. Without one the controller assumes the
  /// application is always foregrounded.
  pub fn focus_signal(mut self, signal: &FocusSignal) -> Self {
    self.focus = Some(signal.subscribe());
    self
  }

  /// Build the controller and start its background timers.
  pub fn build(self) -> Arc<QueryController<T>> {
    let (state_tx, _) = watch::channel(QueryState::default());

    let controller = Arc::new(QueryController {
      key: self.key,
      cache: self.cache,
      fetcher: self.fetcher,
      config: self.config,
      on_success: self.on_success,
      on_error: self.on_error,
      focus: self.focus,
      state_tx,
      retry_count: AtomicU32::new(0),
      tasks: Mutex::new(Vec::new()),
    });

    controller.start_interval_refetch();
    controller.start_focus_refetch();
    controller
  }
}

/// State machine driving one query's fetch lifecycle.
///
/// Cheap to share: the builder returns an `Arc`. Dropping the last reference
/// cancels all pending timers; an in-flight fetch is not aborted and still
/// writes through to the cache.
pub struct QueryController<T> {
  key: CacheKey,
  cache: Arc<CacheStore>,
  fetcher: QueryFn<T>,
  config: QueryConfig,
  on_success: Option<SuccessCallback<T>>,
  on_error: Option<ErrorCallback>,
  focus: Option<watch::Receiver<bool>>,
  state_tx: watch::Sender<QueryState<T>>,
  retry_count: AtomicU32,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> QueryController<T>
where
  T: Clone + Send + Sync + 'static,
{
  /// Subscribe to state transitions.
  pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
    self.state_tx.subscribe()
  }

  /// Snapshot of the current state.
  pub fn state(&self) -> QueryState<T> {
    self.state_tx.borrow().clone()
  }

  /// The key this controller caches under.
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Start a foreground fetch. Serves a fresh cache entry without any
  /// network call; otherwise fetches, caches the result, and schedules
  /// background retries on failure.
  pub async fn fetch(self: &Arc<Self>) {
    self.fetch_data(true).await;
  }

  /// Reset the retry counter and fetch again. Cache freshness is still
  /// honored: refetching against a fresh entry is a no-op. Call
  /// [`invalidate`](Self::invalidate) first for an unconditional refetch.
  pub async fn refetch(self: &Arc<Self>) {
    self.retry_count.store(0, Ordering::SeqCst);
    self.fetch_data(true).await;
  }

  /// Delete this query's cache entry without changing controller state.
  /// Idempotent.
  pub fn invalidate(&self) {
    self.cache.remove(&self.key);
  }

  async fn fetch_data(self: &Arc<Self>, show_loading: bool) {
    if !self.config.enabled {
      return;
    }

    if self.adopt_fresh_entry() {
      return;
    }

    // Deduplicate against other controllers fetching the same key. The
    // guard wakes followers and clears the registry when dropped.
    let _guard = loop {
      match self.cache.begin_flight(&self.key) {
        Flight::Leader(guard) => break guard,
        Flight::Follower(mut rx) => {
          debug!(key = %self.key, "awaiting in-flight fetch for key");
          self.mark_fetching(show_loading);
          let _ = rx.recv().await;
          if self.adopt_fresh_entry() {
            return;
          }
          // The leader failed or its result is already stale; take over.
        }
      }
    };

    self.mark_fetching(show_loading);

    match (self.fetcher)().await {
      Ok(data) => {
        self.cache.set(&self.key, data.clone(), self.config.stale_time);
        self.retry_count.store(0, Ordering::SeqCst);
        self.state_tx.send_modify(|state| {
          state.data = Some(data.clone());
          state.is_error = false;
          state.error = None;
          state.is_loading = false;
          state.is_fetching = false;
        });
        if let Some(callback) = &self.on_success {
          callback(&data);
        }
      }
      Err(error) => {
        let failed_so_far = self.retry_count.load(Ordering::SeqCst);
        if failed_so_far < self.config.retry {
          let attempt = failed_so_far + 1;
          self.retry_count.store(attempt, Ordering::SeqCst);
          let delay = self.config.backoff.delay_for(attempt);
          debug!(
            key = %self.key,
            attempt,
            delay_ms = delay.as_millis() as u64,
            %error,
            "scheduling background retry"
          );
          self.spawn_retry(delay);
          // Not a terminal failure yet; only the fetch flags clear.
          self.state_tx.send_modify(|state| {
            state.is_loading = false;
            state.is_fetching = false;
          });
        } else {
          warn!(key = %self.key, %error, "query failed, retries exhausted");
          self.state_tx.send_modify(|state| {
            state.is_error = true;
            state.error = Some(error.clone());
            state.is_loading = false;
            state.is_fetching = false;
          });
          if let Some(callback) = &self.on_error {
            callback(&error);
          }
        }
      }
    }
  }

  /// Adopt a fresh cache entry as current state. Returns false on a miss or
  /// a stale hit.
  fn adopt_fresh_entry(&self) -> bool {
    let Some(hit) = self.cache.get::<T>(&self.key) else {
      return false;
    };
    if hit.is_stale {
      return false;
    }
    debug!(key = %self.key, age_ms = hit.age.as_millis() as u64, "serving fresh cache entry");
    self.state_tx.send_modify(|state| {
      state.data = Some(hit.data.clone());
      state.is_error = false;
      state.error = None;
      state.is_loading = false;
      state.is_fetching = false;
    });
    true
  }

  fn mark_fetching(&self, show_loading: bool) {
    self.state_tx.send_modify(|state| {
      state.is_fetching = true;
      if show_loading {
        state.is_loading = true;
      }
      state.is_error = false;
      state.error = None;
    });
  }

  fn is_focused(&self) -> bool {
    self.focus.as_ref().map_or(true, |rx| *rx.borrow())
  }

  // Boxed so the retry task's future does not embed fetch_data's own type.
  fn background_fetch(self: Arc<Self>) -> BoxFuture<'static, ()> {
    Box::pin(async move { self.fetch_data(false).await })
  }

  fn spawn_retry(self: &Arc<Self>, delay: Duration) {
    let weak = Arc::downgrade(self);
    let handle = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      if let Some(controller) = weak.upgrade() {
        controller.background_fetch().await;
      }
    });
    self.track_task(handle);
  }

  fn start_interval_refetch(self: &Arc<Self>) {
    let Some(period) = self.config.refetch_interval else {
      return;
    };
    if !self.config.enabled {
      return;
    }

    let weak = Arc::downgrade(self);
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      // The first tick of a tokio interval fires immediately; skip it so
      // the initial fetch stays under the caller's control.
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(controller) = weak.upgrade() else {
          break;
        };
        if controller.is_focused() {
          controller.background_fetch().await;
        }
      }
    });
    self.track_task(handle);
  }

  fn start_focus_refetch(self: &Arc<Self>) {
    if !self.config.refetch_on_focus || !self.config.enabled {
      return;
    }
    let Some(mut rx) = self.focus.clone() else {
      return;
    };

    let weak = Arc::downgrade(self);
    let handle = tokio::spawn(async move {
      let mut was_focused = *rx.borrow();
      while rx.changed().await.is_ok() {
        let focused = *rx.borrow();
        let regained = focused && !was_focused;
        was_focused = focused;
        if !regained {
          continue;
        }
        let Some(controller) = weak.upgrade() else {
          break;
        };
        if controller.cache.is_stale(&controller.key) {
          debug!(key = %controller.key, "focus regained with stale entry, refetching");
          controller.background_fetch().await;
        }
      }
    });
    self.track_task(handle);
  }
}

impl<T> QueryController<T> {
  /// Cancel all pending timers (retries, interval and focus refetch).
  /// Also runs on drop.
  pub fn dispose(&self) {
    let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
    for task in tasks.drain(..) {
      task.abort();
    }
  }

  fn track_task(&self, handle: JoinHandle<()>) {
    let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
    tasks.retain(|task| !task.is_finished());
    tasks.push(handle);
  }
}

impl<T> Drop for QueryController<T> {
  fn drop(&mut self) {
    self.dispose();
  }
}
