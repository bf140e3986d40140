//! Token bucket store.
//!
//! Each key owns a bucket holding up to `capacity` tokens. Tokens are refilled
//! lazily on access from the time elapsed since the previous access, so no
//! background ticker is needed.

use dashmap::DashMap;
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};

use super::cleanup::Evict;
use super::limiter::Decision;
use crate::error::{Result, TurnstileError};

/// Per-key bucket state.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    /// Currently available tokens, always within `0..=capacity`
    tokens: f64,
    /// Last time tokens were added; doubles as the last-access time
    last_refill: SystemTime,
}

/// In-memory token bucket store keyed by string.
///
/// Buckets live in a sharded map; the refill/consume sequence for one key runs
/// while holding that key's shard guard, so concurrent callers on the same key
/// are serialized and callers on other shards proceed in parallel.
pub struct TokenBucketStore {
    /// Maximum tokens per bucket (the burst size)
    capacity: u64,
    /// Tokens added per second of elapsed time
    refill_per_second: f64,
    /// Buckets indexed by key
    buckets: DashMap<String, Bucket>,
}

impl TokenBucketStore {
    /// Create a new store.
    ///
    /// Fails when `capacity` is zero or `refill_per_second` is not a positive,
    /// finite number.
    pub fn new(capacity: u64, refill_per_second: f64) -> Result<Self> {
        if capacity < 1 {
            return Err(TurnstileError::Config(
                "token bucket capacity must be at least 1".to_string(),
            ));
        }
        if !refill_per_second.is_finite() || refill_per_second <= 0.0 {
            return Err(TurnstileError::Config(format!(
                "token bucket refill rate must be positive, got {}",
                refill_per_second
            )));
        }

        Ok(Self {
            capacity,
            refill_per_second,
            buckets: DashMap::new(),
        })
    }

    /// Take one token for `key` if available.
    ///
    /// An empty key is never limited and creates no state.
    pub fn allow(&self, key: &str, now: SystemTime) -> Decision {
        if key.is_empty() {
            return Decision::bypass(self.capacity);
        }

        let capacity = self.capacity as f64;
        let mut bucket = self.buckets.entry(key.to_owned()).or_insert_with(|| {
            debug!(key = %key, capacity = self.capacity, "Creating new token bucket");
            Bucket {
                tokens: capacity,
                last_refill: now,
            }
        });

        // A clock that steps backwards refills nothing and keeps the later stamp.
        let elapsed = now
            .duration_since(bucket.last_refill)
            .unwrap_or(Duration::ZERO);
        let refilled = elapsed.as_secs_f64() * self.refill_per_second;
        bucket.tokens = (bucket.tokens + refilled).min(capacity);
        if now > bucket.last_refill {
            bucket.last_refill = now;
        }

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        let tokens = bucket.tokens;
        drop(bucket);

        trace!(key = %key, allowed, tokens, "Token bucket checked");

        Decision {
            allowed,
            limit: self.capacity,
            remaining: if allowed { tokens.floor() as u64 } else { 0 },
            reset_after: self.seconds_until_token(tokens),
        }
    }

    /// Whole seconds until at least one token is available.
    fn seconds_until_token(&self, tokens: f64) -> u64 {
        if tokens >= 1.0 {
            return 0;
        }
        ((1.0 - tokens) / self.refill_per_second).ceil().max(1.0) as u64
    }

    /// Get the bucket capacity.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Get the refill rate in tokens per second.
    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }

    /// Get the stored token count for a key, as of its last access.
    ///
    /// Returns `None` if no bucket exists for the key.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|b| b.tokens)
    }

    /// Get the number of tracked buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Check whether no buckets are tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Clear all buckets.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

impl Evict for TokenBucketStore {
    fn evict_idle(&self, now: SystemTime, ttl: Duration) -> usize {
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            let idle = now
                .duration_since(bucket.last_refill)
                .map(|age| age > ttl)
                .unwrap_or(false);
            if idle {
                removed += 1;
            }
            !idle
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::UNIX_EPOCH;

    fn at(millis: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000) + Duration::from_millis(millis)
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        assert!(TokenBucketStore::new(0, 1.0).is_err());
        assert!(TokenBucketStore::new(5, 0.0).is_err());
        assert!(TokenBucketStore::new(5, -2.0).is_err());
        assert!(TokenBucketStore::new(5, f64::NAN).is_err());
        assert!(TokenBucketStore::new(5, f64::INFINITY).is_err());
        assert!(TokenBucketStore::new(1, 0.001).is_ok());
    }

    #[test]
    fn test_burst_then_refill() {
        let store = TokenBucketStore::new(5, 10.0).unwrap();

        for expected in [4, 3, 2, 1, 0] {
            let decision = store.allow("client", at(0));
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        let denied = store.allow("client", at(0));
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_after, 1);

        // 100ms at 10 tokens/s refills exactly one token
        let decision = store.allow("client", at(100));
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(!store.allow("client", at(100)).allowed);
    }

    #[test]
    fn test_burst_admission_exact() {
        let store = TokenBucketStore::new(3, 1.0).unwrap();

        let allowed = (0..4).filter(|_| store.allow("k", at(0)).allowed).count();
        assert_eq!(allowed, 3);
    }

    #[test]
    fn test_full_refill_after_capacity_over_rate() {
        let store = TokenBucketStore::new(5, 10.0).unwrap();
        for _ in 0..5 {
            store.allow("k", at(0));
        }
        assert!(!store.allow("k", at(0)).allowed);

        // capacity / rate = 0.5s
        for _ in 0..5 {
            assert!(store.allow("k", at(500)).allowed);
        }
        assert!(!store.allow("k", at(500)).allowed);
    }

    #[test]
    fn test_tokens_stay_within_capacity() {
        let store = TokenBucketStore::new(4, 3.0).unwrap();
        let offsets = [0, 0, 10, 10, 250, 900, 905, 2_000, 10_000, 10_001, 10_002, 10_003, 10_004];

        for offset in offsets {
            store.allow("k", at(offset));
            let tokens = store.tokens("k").unwrap();
            assert!((0.0..=4.0).contains(&tokens), "tokens out of range: {}", tokens);
        }

        // A long idle period never overfills the bucket
        store.allow("k", at(1_000_000));
        assert_eq!(store.tokens("k"), Some(3.0));
    }

    #[test]
    fn test_clock_going_backwards_adds_nothing() {
        let store = TokenBucketStore::new(2, 1.0).unwrap();
        store.allow("k", at(5_000));
        store.allow("k", at(5_000));

        assert!(!store.allow("k", at(1_000)).allowed);
        // Refill is measured from the later timestamp
        assert!(!store.allow("k", at(5_500)).allowed);
        assert!(store.allow("k", at(6_000)).allowed);
    }

    #[test]
    fn test_reset_after_reflects_refill_rate() {
        let store = TokenBucketStore::new(1, 0.5).unwrap();

        let first = store.allow("k", at(0));
        assert!(first.allowed);
        assert_eq!(first.reset_after, 2);

        let second = store.allow("k", at(500));
        assert!(!second.allowed);
        // 0.25 tokens present, 0.75 more at 0.5/s
        assert_eq!(second.reset_after, 2);
    }

    #[test]
    fn test_keys_are_isolated() {
        let store = TokenBucketStore::new(2, 1.0).unwrap();

        for _ in 0..100 {
            store.allow("noisy", at(0));
        }

        assert!(store.allow("quiet", at(0)).allowed);
        assert!(store.allow("quiet", at(0)).allowed);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_empty_key_bypasses() {
        let store = TokenBucketStore::new(1, 1.0).unwrap();

        for _ in 0..10 {
            let decision = store.allow("", at(0));
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 1);
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_callers_share_exact_capacity() {
        let store = TokenBucketStore::new(10, 0.001).unwrap();
        let allowed = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..64 {
                scope.spawn(|| {
                    if store.allow("shared", at(0)).allowed {
                        allowed.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(allowed.load(Ordering::SeqCst), 10);
        let tokens = store.tokens("shared").unwrap();
        assert!((0.0..1.0).contains(&tokens));
    }

    #[test]
    fn test_evict_idle_removes_only_stale_buckets() {
        let store = TokenBucketStore::new(5, 1.0).unwrap();
        store.allow("old", at(0));
        store.allow("fresh", at(50_000));

        let removed = store.evict_idle(at(61_000), Duration::from_secs(30));

        assert_eq!(removed, 1);
        assert!(store.tokens("old").is_none());
        assert!(store.tokens("fresh").is_some());

        // An evicted key starts over with a full bucket
        assert_eq!(store.allow("old", at(61_000)).remaining, 4);
    }
}
