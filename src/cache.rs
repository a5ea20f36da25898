//! In-memory cache store keyed by canonical query keys.
//!
//! The store maps canonical keys to type-erased entries with a write-time
//! staleness budget. It is an explicit, constructible object shared by
//! reference between query controllers; there is no process-wide singleton.
//!
//! Entries live until explicitly removed. Callers that stop using a key are
//! responsible for invalidating it; there is no eviction policy.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

/// Canonical identity under which a query's result is stored.
///
/// Built from an ordered sequence of string parts joined with `-`; two equal
/// part sequences always canonicalize identically. Avoiding collisions
/// between semantically distinct keys is the caller's responsibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
  /// Canonical delimiter between key parts.
  const DELIMITER: &'static str = "-";

  /// Build a key from ordered parts, e.g. `CacheKey::new(["users", "42"])`.
  pub fn new<I, S>(parts: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let joined = parts
      .into_iter()
      .map(|p| p.as_ref().to_string())
      .collect::<Vec<_>>()
      .join(Self::DELIMITER);
    Self(joined)
  }

  /// The canonical string identity.
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<&str> for CacheKey {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

impl From<String> for CacheKey {
  fn from(s: String) -> Self {
    Self(s)
  }
}

impl<S: AsRef<str>, const N: usize> From<[S; N]> for CacheKey {
  fn from(parts: [S; N]) -> Self {
    Self::new(parts)
  }
}

impl std::fmt::Display for CacheKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// One stored result. The payload is type-erased so a single store can hold
/// results of different queries.
struct Entry {
  data: Box<dyn Any + Send + Sync>,
  stored_at: Instant,
  stale_after: Duration,
}

impl Entry {
  fn is_stale(&self) -> bool {
    self.stored_at.elapsed() >= self.stale_after
  }
}

/// A typed cache lookup result.
#[derive(Debug, Clone)]
pub struct CacheHit<T> {
  /// The cached data.
  pub data: T,
  /// Whether the entry has outlived its staleness budget. Stale data is
  /// still servable as last-known-good; it just warrants a refresh.
  pub is_stale: bool,
  /// Age of the entry at lookup time.
  pub age: Duration,
}

type FlightMap = Arc<Mutex<HashMap<String, broadcast::Sender<()>>>>;

/// In-memory query result cache with staleness evaluation and an in-flight
/// request registry for deduplicating concurrent fetches of one key.
pub struct CacheStore {
  entries: Mutex<HashMap<String, Entry>>,
  flights: FlightMap,
}

impl CacheStore {
  /// Create an empty store.
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      flights: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Typed lookup. Returns `None` on a miss or if the stored payload is of
  /// a different type than requested.
  pub fn get<T>(&self, key: &CacheKey) -> Option<CacheHit<T>>
  where
    T: Clone + Send + Sync + 'static,
  {
    let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    let entry = entries.get(key.as_str())?;
    let data = entry.data.downcast_ref::<T>()?.clone();
    Some(CacheHit {
      data,
      is_stale: entry.is_stale(),
      age: entry.stored_at.elapsed(),
    })
  }

  /// Write a result, overwriting any previous entry wholesale. The
  /// staleness budget is fixed now, at write time.
  pub fn set<T>(&self, key: &CacheKey, data: T, stale_after: Duration)
  where
    T: Send + Sync + 'static,
  {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    entries.insert(
      key.as_str().to_string(),
      Entry {
        data: Box::new(data),
        stored_at: Instant::now(),
        stale_after,
      },
    );
  }

  /// Whether the entry for `key` is stale. Absent entries are always stale.
  pub fn is_stale(&self, key: &CacheKey) -> bool {
    let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    entries.get(key.as_str()).map_or(true, Entry::is_stale)
  }

  /// Remove the entry for `key`, if any. Idempotent.
  pub fn remove(&self, key: &CacheKey) {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    entries.remove(key.as_str());
  }

  /// Number of stored entries.
  pub fn len(&self) -> usize {
    self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  /// Whether the store holds no entries.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Join or start the in-flight fetch for `key`.
  ///
  /// The first caller becomes the leader and must perform the fetch; the
  /// guard it holds clears the registry and notifies followers when dropped,
  /// even if the leader's future is cancelled. Followers get a receiver
  /// that resolves once the leader finishes, after which they should
  /// re-check the cache.
  pub(crate) fn begin_flight(&self, key: &CacheKey) -> Flight {
    let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(tx) = flights.get(key.as_str()) {
      return Flight::Follower(tx.subscribe());
    }

    let (tx, _) = broadcast::channel(1);
    flights.insert(key.as_str().to_string(), tx);
    Flight::Leader(FlightGuard {
      flights: Arc::clone(&self.flights),
      key: key.as_str().to_string(),
    })
  }
}

impl Default for CacheStore {
  fn default() -> Self {
    Self::new()
  }
}

/// Outcome of [`CacheStore::begin_flight`].
pub(crate) enum Flight {
  /// This caller fetches; drop the guard when done.
  Leader(FlightGuard),
  /// Another caller is fetching the same key; await the receiver, then
  /// re-check the cache.
  Follower(broadcast::Receiver<()>),
}

/// Clears the in-flight marker and wakes followers on drop.
pub(crate) struct FlightGuard {
  flights: FlightMap,
  key: String,
}

impl Drop for FlightGuard {
  fn drop(&mut self) {
    let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(tx) = flights.remove(&self.key) {
      // No receivers is fine; there were no followers.
      let _ = tx.send(());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_canonicalization() {
    let a = CacheKey::new(["users", "42"]);
    let b = CacheKey::new(vec!["users".to_string(), "42".to_string()]);
    assert_eq!(a, b);
    assert_eq!(a.as_str(), "users-42");
  }

  #[tokio::test(start_paused = true)]
  async fn test_staleness_boundary() {
    let store = CacheStore::new();
    let key = CacheKey::from("answer");
    store.set(&key, 42u32, Duration::from_secs(10));

    tokio::time::advance(Duration::from_secs(9)).await;
    assert!(!store.is_stale(&key));

    tokio::time::advance(Duration::from_secs(1)).await;
    // Stale from exactly stale_after onward.
    assert!(store.is_stale(&key));
  }

  #[tokio::test(start_paused = true)]
  async fn test_overwrite_resets_staleness() {
    let store = CacheStore::new();
    let key = CacheKey::from("answer");
    store.set(&key, 1u32, Duration::from_secs(10));

    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(store.is_stale(&key));

    store.set(&key, 2u32, Duration::from_secs(10));
    assert!(!store.is_stale(&key));
    let hit = store.get::<u32>(&key).unwrap();
    assert_eq!(hit.data, 2);
    assert!(!hit.is_stale);
  }

  #[test]
  fn test_absent_is_stale() {
    let store = CacheStore::new();
    assert!(store.is_stale(&CacheKey::from("missing")));
    assert!(store.get::<u32>(&CacheKey::from("missing")).is_none());
  }

  #[test]
  fn test_wrong_type_is_a_miss() {
    let store = CacheStore::new();
    let key = CacheKey::from("answer");
    store.set(&key, 42u32, Duration::from_secs(10));
    assert!(store.get::<String>(&key).is_none());
  }

  #[test]
  fn test_remove_is_idempotent() {
    let store = CacheStore::new();
    let key = CacheKey::from("answer");
    store.set(&key, 42u32, Duration::from_secs(10));

    store.remove(&key);
    assert!(store.get::<u32>(&key).is_none());
    store.remove(&key);
    assert!(store.get::<u32>(&key).is_none());
    assert!(store.is_empty());
  }

  #[tokio::test]
  async fn test_flight_leader_then_follower() {
    let store = CacheStore::new();
    let key = CacheKey::from("shared");

    let guard = match store.begin_flight(&key) {
      Flight::Leader(guard) => guard,
      Flight::Follower(_) => panic!("first caller should lead"),
    };

    let mut rx = match store.begin_flight(&key) {
      Flight::Follower(rx) => rx,
      Flight::Leader(_) => panic!("second caller should follow"),
    };

    drop(guard);
    rx.recv().await.expect("leader drop notifies followers");

    // Registry cleared; the next caller leads again.
    assert!(matches!(store.begin_flight(&key), Flight::Leader(_)));
  }

  #[tokio::test]
  async fn test_flight_guard_notifies_on_cancel() {
    let store = Arc::new(CacheStore::new());
    let key = CacheKey::from("shared");

    let guard = match store.begin_flight(&key) {
      Flight::Leader(guard) => guard,
      Flight::Follower(_) => panic!("first caller should lead"),
    };

    let mut rx = match store.begin_flight(&key) {
      Flight::Follower(rx) => rx,
      Flight::Leader(_) => panic!("second caller should follow"),
    };

    // Simulate the leader's future being dropped mid-fetch.
    let task = tokio::spawn(async move {
      let _guard = guard;
      std::future::pending::<()>().await;
    });
    task.abort();

    rx.recv().await.expect("cancelled leader still notifies");
  }
}
