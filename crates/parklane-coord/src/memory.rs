//! In-memory coordination store.
//!
//! Entries live in a `BTreeMap` behind a `RwLock` with lazy TTL expiry.
//! This is the default backend for single-node deployments and the one
//! used by every test. Data is lost on restart, which is acceptable for a
//! coordination store — everything in it is reconstructible.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;

use crate::bucket::{BucketDecision, TokenBucket};
use crate::{CoordError, CoordStore};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// An in-memory coordination store backed by a `BTreeMap`.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl MemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl CoordStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordError> {
        let now = Instant::now();
        let data = self.data.read().await;
        Ok(data
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CoordError> {
        let mut data = self.data.write().await;
        data.insert(
            key.to_owned(),
            Entry {
                value: value.to_vec(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CoordError> {
        let mut data = self.data.write().await;
        data.remove(key);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, CoordError> {
        let now = Instant::now();
        let mut data = self.data.write().await;
        if data.get(key).is_some_and(|e| e.live(now)) {
            return Ok(false);
        }
        data.insert(
            key.to_owned(),
            Entry {
                value: value.to_vec(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, CoordError> {
        let now = Instant::now();
        let mut data = self.data.write().await;
        let current = data
            .get(key)
            .filter(|e| e.live(now))
            .and_then(|e| std::str::from_utf8(&e.value).ok()?.parse::<i64>().ok());

        match current {
            Some(n) => {
                let next = n.saturating_add(1);
                // Preserve the original expiry.
                let expires_at = data.get(key).and_then(|e| e.expires_at);
                data.insert(
                    key.to_owned(),
                    Entry {
                        value: next.to_string().into_bytes(),
                        expires_at,
                    },
                );
                Ok(next)
            }
            None => {
                data.insert(
                    key.to_owned(),
                    Entry {
                        value: b"1".to_vec(),
                        expires_at: Some(now + ttl),
                    },
                );
                Ok(1)
            }
        }
    }

    async fn compare_delete(&self, key: &str, value: &[u8]) -> Result<bool, CoordError> {
        let now = Instant::now();
        let mut data = self.data.write().await;
        let matches = data
            .get(key)
            .is_some_and(|e| e.live(now) && e.value == value);
        if matches {
            data.remove(key);
        }
        Ok(matches)
    }

    async fn bucket_take(
        &self,
        key: &str,
        refill_per_sec: f64,
        burst: f64,
        cost: f64,
    ) -> Result<BucketDecision, CoordError> {
        let now_ms = Self::now_ms();
        let mut data = self.data.write().await;

        let mut bucket = data
            .get(key)
            .and_then(|e| serde_json::from_slice::<TokenBucket>(&e.value).ok())
            .unwrap_or_else(|| TokenBucket::full(burst, now_ms));

        let decision = bucket.take(now_ms, refill_per_sec, burst, cost);

        let value = serde_json::to_vec(&bucket)
            .map_err(|e| CoordError::Write(format!("bucket encode: {e}")))?;
        // Keep bucket state around long enough to refill fully, then let it lapse.
        let ttl_secs = if refill_per_sec > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let fill_time = (burst / refill_per_sec).ceil() as u64;
            fill_time.saturating_mul(2).max(60)
        } else {
            3600
        };
        data.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );

        Ok(decision)
    }

    async fn ping(&self) -> Result<(), CoordError> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = MemoryStore::new();
        store.put("k", b"v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let store = MemoryStore::new();
        assert_eq!(store.get("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entry_is_gone() {
        let store = MemoryStore::new();
        store
            .put("k", b"v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_nx_blocks_second_writer() {
        let store = MemoryStore::new();
        assert!(store
            .set_nx("nonce:a", b"1", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .set_nx("nonce:a", b"2", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn set_nx_succeeds_after_expiry() {
        let store = MemoryStore::new();
        assert!(store
            .set_nx("lock", b"1", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store
            .set_nx("lock", b"2", Duration::from_millis(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn incr_counts_up() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("c", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(store.incr("c", Duration::from_secs(60)).await.unwrap(), 2);
        assert_eq!(store.incr("c", Duration::from_secs(60)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn compare_delete_only_removes_matching_value() {
        let store = MemoryStore::new();
        store.put("lock", b"owner-a", None).await.unwrap();
        assert!(!store.compare_delete("lock", b"owner-b").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some(b"owner-a".to_vec()));
        assert!(store.compare_delete("lock", b"owner-a").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn bucket_take_enforces_burst() {
        let store = MemoryStore::new();
        for _ in 0..5 {
            let d = store.bucket_take("rl:t", 1.0, 5.0, 1.0).await.unwrap();
            assert!(d.allowed);
        }
        let denied = store.bucket_take("rl:t", 1.0, 5.0, 1.0).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms > 0);
    }
}
