//! refetch - resilient data fetching and caching for async Rust
//!
//! This library provides the resilience layer behind data-driven UIs:
//!
//! - A query/mutation cache in the spirit of TanStack Query: staleness
//!   tracking, cache-first fetching, background refetching
//! - A retry executor with bounded, configurable backoff
//! - A circuit breaker for isolating persistently failing operations
//!
//! The pieces compose but do not depend on each other: a [`Retrier`] or
//! [`CircuitBreaker`] can wrap any async operation, while
//! [`QueryController`] and [`MutationController`] manage full read/write
//! lifecycles against a shared [`CacheStore`].
//!
//! # Example
//!
//! ```ignore
//! use refetch::{CacheStore, QueryBuilder, QueryConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let cache = Arc::new(CacheStore::new());
//!
//! let users = QueryBuilder::new(["users", "active"], cache.clone(), move || {
//!     let api = api.clone();
//!     async move { api.list_active_users().await }
//! })
//! .config(QueryConfig {
//!     stale_time: Duration::from_secs(60),
//!     ..QueryConfig::default()
//! })
//! .build();
//!
//! users.fetch().await;
//! if let Some(data) = users.state().data {
//!     render(data);
//! }
//! ```

mod backoff;
mod breaker;
mod cache;
mod error;
mod focus;
mod mutation;
mod query;
mod retry;

pub use backoff::Backoff;
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use cache::{CacheHit, CacheKey, CacheStore};
pub use error::QueryError;
pub use focus::FocusSignal;
pub use mutation::{MutationBuilder, MutationController, MutationState};
pub use query::{QueryBuilder, QueryConfig, QueryController, QueryState};
pub use retry::{Retrier, RetryPolicy};
