//! Coordination store abstraction for Parklane.
//!
//! This crate defines the [`CoordStore`] trait — a small keyed store for
//! short-lived, reconstructible state: webhook nonce dedup, debounce
//! records, per-space evaluation locks, last-known display caches, the
//! policy-version key, and rate-limit token buckets. Nothing in here is the
//! source of truth; a cold start loses only state that the next
//! reconciliation sweep rebuilds.
//!
//! Two implementations are provided:
//!
//! - [`MemoryStore`] — in-process, the default for single-node deployments
//!   and for tests
//! - [`RedisStore`] — shared across replicas, backed by Redis (feature
//!   `redis-backend`)

mod bucket;
mod error;
mod memory;
#[cfg(feature = "redis-backend")]
mod redis_store;

use std::time::Duration;

pub use bucket::{BucketDecision, TokenBucket};
pub use error::CoordError;
pub use memory::MemoryStore;
#[cfg(feature = "redis-backend")]
pub use redis_store::RedisStore;

/// A keyed store for short-lived coordination state.
///
/// Keys are UTF-8 strings using `:` as a separator (e.g. `nonce:acme:ab12`,
/// `lock:space:550e8400-…`, `rl:gw:0102030405060708`). Values are opaque
/// byte arrays. Every entry may carry a TTL after which it disappears.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait CoordStore: Send + Sync + 'static {
    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist or has expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordError>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// A `ttl` of `None` keeps the entry until it is overwritten or deleted.
    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CoordError>;

    /// Delete a key. Idempotent — deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CoordError>;

    /// Store a key-value pair only if the key is absent.
    ///
    /// Returns `true` if the value was stored, `false` if the key already
    /// existed. This is the primitive behind nonce replay detection and
    /// per-space locks.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, CoordError>;

    /// Atomically increment a counter, creating it at 1 with the given TTL.
    ///
    /// The TTL is only applied on creation, so a busy counter expires a
    /// fixed interval after its first increment.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, CoordError>;

    /// Delete a key only if it currently holds `value`.
    ///
    /// Returns `true` if the key was deleted. Used to release locks without
    /// stomping on a holder that acquired the key after our lease expired.
    async fn compare_delete(&self, key: &str, value: &[u8]) -> Result<bool, CoordError>;

    /// Take `cost` tokens from the bucket stored at `key`.
    ///
    /// The bucket refills at `refill_per_sec` up to `burst`. The operation
    /// is atomic per backend: the memory store mutates under its write
    /// lock, the Redis store runs a script.
    async fn bucket_take(
        &self,
        key: &str,
        refill_per_sec: f64,
        burst: f64,
        cost: f64,
    ) -> Result<BucketDecision, CoordError>;

    /// Liveness check for the readiness probe.
    async fn ping(&self) -> Result<(), CoordError>;
}
