//! Token-bucket arithmetic shared by all backends.
//!
//! The bucket state is two numbers: the token level and the timestamp of
//! the last update. Refill is computed lazily from elapsed time, so an
//! idle bucket costs nothing. Backends persist the state however they like
//! (the memory store keeps the struct, the Redis store keeps a hash).

use serde::{Deserialize, Serialize};

/// Persisted token-bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    /// Current token level.
    pub tokens: f64,
    /// Unix milliseconds of the last refill computation.
    pub updated_ms: u64,
}

impl TokenBucket {
    /// A full bucket as of `now_ms`.
    #[must_use]
    pub fn full(burst: f64, now_ms: u64) -> Self {
        Self {
            tokens: burst,
            updated_ms: now_ms,
        }
    }

    /// Refill for elapsed time, then try to take `cost` tokens.
    ///
    /// Mutates the bucket in place and returns the decision. When the take
    /// is denied, `retry_after_ms` is the time until enough tokens will
    /// have accumulated at the given refill rate.
    pub fn take(
        &mut self,
        now_ms: u64,
        refill_per_sec: f64,
        burst: f64,
        cost: f64,
    ) -> BucketDecision {
        let elapsed_ms = now_ms.saturating_sub(self.updated_ms);
        #[allow(clippy::cast_precision_loss)]
        let refilled = self.tokens + (elapsed_ms as f64 / 1000.0) * refill_per_sec;
        self.tokens = refilled.min(burst);
        self.updated_ms = now_ms;

        if self.tokens >= cost {
            self.tokens -= cost;
            BucketDecision {
                allowed: true,
                retry_after_ms: 0,
            }
        } else {
            let deficit = cost - self.tokens;
            let retry_after_ms = if refill_per_sec > 0.0 {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let ms = (deficit / refill_per_sec * 1000.0).ceil() as u64;
                ms.max(1)
            } else {
                u64::MAX
            };
            BucketDecision {
                allowed: false,
                retry_after_ms,
            }
        }
    }
}

/// Outcome of a [`TokenBucket::take`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketDecision {
    /// Whether the tokens were taken.
    pub allowed: bool,
    /// When denied, milliseconds until the take would succeed.
    pub retry_after_ms: u64,
}

impl BucketDecision {
    /// Retry hint in whole seconds, rounded up, at least 1.
    #[must_use]
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_ms.div_ceil(1000).max(1)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn full_bucket_allows_burst() {
        let mut bucket = TokenBucket::full(10.0, 0);
        for _ in 0..10 {
            assert!(bucket.take(0, 1.0, 10.0, 1.0).allowed);
        }
        assert!(!bucket.take(0, 1.0, 10.0, 1.0).allowed);
    }

    #[test]
    fn refill_restores_tokens() {
        let mut bucket = TokenBucket::full(5.0, 0);
        for _ in 0..5 {
            assert!(bucket.take(0, 2.0, 5.0, 1.0).allowed);
        }
        assert!(!bucket.take(0, 2.0, 5.0, 1.0).allowed);

        // 2 tokens/s for 1.5s = 3 tokens.
        assert!(bucket.take(1500, 2.0, 5.0, 1.0).allowed);
        assert!(bucket.take(1500, 2.0, 5.0, 1.0).allowed);
        assert!(bucket.take(1500, 2.0, 5.0, 1.0).allowed);
        assert!(!bucket.take(1500, 2.0, 5.0, 1.0).allowed);
    }

    #[test]
    fn refill_caps_at_burst() {
        let mut bucket = TokenBucket::full(3.0, 0);
        // A week of idling does not exceed burst.
        let week_ms = 7 * 24 * 3600 * 1000;
        for _ in 0..3 {
            assert!(bucket.take(week_ms, 1.0, 3.0, 1.0).allowed);
        }
        assert!(!bucket.take(week_ms, 1.0, 3.0, 1.0).allowed);
    }

    #[test]
    fn denied_take_reports_retry_hint() {
        let mut bucket = TokenBucket::full(1.0, 0);
        assert!(bucket.take(0, 0.5, 1.0, 1.0).allowed);

        let decision = bucket.take(0, 0.5, 1.0, 1.0);
        assert!(!decision.allowed);
        // 1 token at 0.5/s = 2000ms.
        assert_eq!(decision.retry_after_ms, 2000);
        assert_eq!(decision.retry_after_secs(), 2);
    }

    #[test]
    fn denied_take_does_not_consume() {
        let mut bucket = TokenBucket::full(1.0, 0);
        assert!(bucket.take(0, 1.0, 1.0, 1.0).allowed);
        let level_after_deny = {
            let _ = bucket.take(0, 1.0, 1.0, 1.0);
            bucket.tokens
        };
        assert!(level_after_deny >= 0.0);
        // One second later exactly one token is back.
        assert!(bucket.take(1000, 1.0, 1.0, 1.0).allowed);
    }
}
