//! Redis-backed coordination store.
//!
//! Used when the control plane runs more than one replica: nonce dedup,
//! locks, and token buckets must then be shared. Multi-step operations
//! (`set_nx` release, bucket take, incr-with-ttl) run as Lua scripts so
//! they stay atomic under concurrent replicas.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::bucket::BucketDecision;
use crate::{CoordError, CoordStore};

const UNLOCK_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end";

const INCR_TTL_SCRIPT: &str = r"
local v = redis.call('INCR', KEYS[1])
if v == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return v";

const BUCKET_SCRIPT: &str = r"
local tokens = tonumber(redis.call('HGET', KEYS[1], 't'))
local updated = tonumber(redis.call('HGET', KEYS[1], 'u'))
local now = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local burst = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])
if tokens == nil then
  tokens = burst
  updated = now
end
local elapsed = math.max(0, now - updated)
tokens = math.min(burst, tokens + elapsed / 1000.0 * refill)
local allowed = 0
local retry = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
elseif refill > 0 then
  retry = math.ceil((cost - tokens) / refill * 1000.0)
else
  retry = -1
end
redis.call('HSET', KEYS[1], 't', tostring(tokens), 'u', tostring(now))
redis.call('PEXPIRE', KEYS[1], ttl)
return {allowed, retry}";

/// A coordination store backed by Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    unlock: redis::Script,
    incr_ttl: redis::Script,
    bucket: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self, CoordError> {
        let client = redis::Client::open(url)
            .map_err(|e| CoordError::Unavailable(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| CoordError::Unavailable(format!("redis connect: {e}")))?;
        Ok(Self {
            conn,
            unlock: redis::Script::new(UNLOCK_SCRIPT),
            incr_ttl: redis::Script::new(INCR_TTL_SCRIPT),
            bucket: redis::Script::new(BUCKET_SCRIPT),
        })
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl CoordStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|e| CoordError::Read(e.to_string()))?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CoordError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
                let _: () = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(ms)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| CoordError::Write(e.to_string()))?;
            }
            None => {
                let _: () = conn
                    .set(key, value)
                    .await
                    .map_err(|e| CoordError::Write(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CoordError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| CoordError::Write(e.to_string()))?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, CoordError> {
        let mut conn = self.conn.clone();
        let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| CoordError::Write(e.to_string()))?;
        Ok(reply.is_some())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, CoordError> {
        let mut conn = self.conn.clone();
        let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let count: i64 = self
            .incr_ttl
            .key(key)
            .arg(ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoordError::Write(e.to_string()))?;
        Ok(count)
    }

    async fn compare_delete(&self, key: &str, value: &[u8]) -> Result<bool, CoordError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .unlock
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoordError::Write(e.to_string()))?;
        Ok(deleted == 1)
    }

    async fn bucket_take(
        &self,
        key: &str,
        refill_per_sec: f64,
        burst: f64,
        cost: f64,
    ) -> Result<BucketDecision, CoordError> {
        let mut conn = self.conn.clone();
        let ttl_secs = if refill_per_sec > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let fill_time = (burst / refill_per_sec).ceil() as u64;
            fill_time.saturating_mul(2).max(60)
        } else {
            3600
        };
        let (allowed, retry_ms): (i64, i64) = self
            .bucket
            .key(key)
            .arg(Self::now_ms())
            .arg(refill_per_sec)
            .arg(burst)
            .arg(cost)
            .arg(ttl_secs.saturating_mul(1000))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoordError::Write(e.to_string()))?;

        Ok(BucketDecision {
            allowed: allowed == 1,
            retry_after_ms: if retry_ms < 0 {
                u64::MAX
            } else {
                u64::try_from(retry_ms).unwrap_or(u64::MAX)
            },
        })
    }

    async fn ping(&self) -> Result<(), CoordError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CoordError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
