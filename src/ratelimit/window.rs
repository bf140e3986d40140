//! Sliding window counters.
//!
//! Instead of logging every request timestamp, each key keeps two counters:
//! one for the current epoch-aligned window and one for the window right
//! before it. Memory per key is constant and every operation is O(1).

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use super::cleanup::Evict;
use crate::error::{Result, TurnstileError};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// How requests in the two windows count against the limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowPolicy {
    /// Only the current window counts
    #[default]
    Fixed,
    /// The previous window counts in proportion to its overlap with the
    /// trailing window
    Weighted,
}

/// Request counts for one key as seen at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounts {
    /// Requests counted in the current window
    pub current: u64,
    /// Requests counted in the window immediately before it
    pub previous: u64,
    /// Start of the current window
    pub window_start: SystemTime,
}

impl WindowCounts {
    fn empty(window_start: SystemTime) -> Self {
        Self {
            current: 0,
            previous: 0,
            window_start,
        }
    }

    /// Blend both windows into an estimate of the requests seen over the last
    /// `window`.
    ///
    /// The previous count is weighted by the share of the sliding window that
    /// still overlaps it: `current + floor(previous * (window - elapsed) / window)`.
    pub fn weighted(&self, window: Duration, now: SystemTime) -> u64 {
        let window_nanos = window.as_nanos();
        if window_nanos == 0 {
            return self.current;
        }

        let elapsed = now
            .duration_since(self.window_start)
            .unwrap_or(Duration::ZERO)
            .as_nanos()
            .min(window_nanos);
        let carried = u128::from(self.previous) * (window_nanos - elapsed) / window_nanos;

        // carried never exceeds previous, so it fits in u64
        self.current.saturating_add(carried as u64)
    }

    /// Get the number of requests in use under `policy`.
    pub fn used(&self, policy: WindowPolicy, window: Duration, now: SystemTime) -> u64 {
        match policy {
            WindowPolicy::Fixed => self.current,
            WindowPolicy::Weighted => self.weighted(window, now),
        }
    }

    /// Get the time left until the current window closes.
    pub fn reset_after(&self, window: Duration, now: SystemTime) -> Duration {
        (self.window_start + window)
            .duration_since(now)
            .unwrap_or(Duration::ZERO)
    }
}

/// Truncate `now` to the start of its `window`, counting from the UNIX epoch.
pub fn window_start(now: SystemTime, window: Duration) -> Result<SystemTime> {
    let window_nanos = window.as_nanos();
    if window_nanos == 0 {
        return Err(TurnstileError::Store("window length must be non-zero".to_string()));
    }

    let since_epoch = now
        .duration_since(UNIX_EPOCH)
        .map_err(|e| TurnstileError::Store(format!("time is before the UNIX epoch: {}", e)))?
        .as_nanos();
    let start = since_epoch - since_epoch % window_nanos;

    Ok(UNIX_EPOCH
        + Duration::new(
            (start / NANOS_PER_SEC) as u64,
            (start % NANOS_PER_SEC) as u32,
        ))
}

/// Result of an atomic admit-and-count against a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Whether the request was admitted and counted
    pub allowed: bool,
    /// Requests in use before this one
    pub used: u64,
    /// Counts before this request was counted
    pub counts: WindowCounts,
}

/// Storage for per-key window counters.
///
/// The in-memory store never suspends, but the trait is async so a shared
/// remote store can be substituted behind the same limiter.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Get the counts for `key` in the window containing `now`, rolling the
    /// stored windows forward first. Unknown keys report zero counts.
    async fn get_counts(
        &self,
        key: &str,
        window: Duration,
        now: SystemTime,
    ) -> Result<WindowCounts>;

    /// Roll the windows forward and count one request for `key`.
    async fn incr(&self, key: &str, window: Duration, now: SystemTime) -> Result<()>;

    /// Count one request for `key` only if fewer than `limit` are in use under
    /// `policy`.
    ///
    /// Deciding and counting form one step per key: no other call for the
    /// same key may land between them.
    async fn acquire(
        &self,
        key: &str,
        window: Duration,
        now: SystemTime,
        limit: u64,
        policy: WindowPolicy,
    ) -> Result<Admission>;
}

/// Stored counters for one key.
#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    current: u64,
    previous: u64,
    window_start: SystemTime,
    last_seen: SystemTime,
}

impl WindowEntry {
    fn new(window_start: SystemTime, now: SystemTime) -> Self {
        Self {
            current: 0,
            previous: 0,
            window_start,
            last_seen: now,
        }
    }

    /// Move the counters into the window starting at `start`.
    ///
    /// Advancing one window carries the current count into `previous`; a
    /// longer gap leaves nothing to carry. Starts at or before the stored one
    /// change nothing.
    fn roll(&mut self, start: SystemTime, window: Duration) {
        if start <= self.window_start {
            return;
        }

        self.previous = if self.window_start + window == start {
            self.current
        } else {
            0
        };
        self.current = 0;
        self.window_start = start;
    }

    fn counts(&self) -> WindowCounts {
        WindowCounts {
            current: self.current,
            previous: self.previous,
            window_start: self.window_start,
        }
    }
}

/// In-memory window store backed by a sharded map.
#[derive(Default)]
pub struct MemoryWindowStore {
    entries: DashMap<String, WindowEntry>,
}

impl MemoryWindowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous form of [`WindowStore::get_counts`].
    pub fn counts(&self, key: &str, window: Duration, now: SystemTime) -> Result<WindowCounts> {
        let start = window_start(now, window)?;

        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.roll(start, window);
                Ok(entry.counts())
            }
            None => Ok(WindowCounts::empty(start)),
        }
    }

    /// Synchronous form of [`WindowStore::incr`].
    pub fn increment(&self, key: &str, window: Duration, now: SystemTime) -> Result<()> {
        let start = window_start(now, window)?;

        let mut entry = self.entries.entry(key.to_owned()).or_insert_with(|| {
            debug!(key = %key, window = ?window, "Creating new window counter");
            WindowEntry::new(start, now)
        });
        entry.roll(start, window);
        entry.current = entry.current.saturating_add(1);
        if now > entry.last_seen {
            entry.last_seen = now;
        }

        Ok(())
    }

    /// Synchronous form of [`WindowStore::acquire`].
    ///
    /// Runs under the key's entry lock.
    pub fn try_acquire(
        &self,
        key: &str,
        window: Duration,
        now: SystemTime,
        limit: u64,
        policy: WindowPolicy,
    ) -> Result<Admission> {
        let start = window_start(now, window)?;

        let mut entry = self.entries.entry(key.to_owned()).or_insert_with(|| {
            debug!(key = %key, window = ?window, "Creating new window counter");
            WindowEntry::new(start, now)
        });
        entry.roll(start, window);

        let counts = entry.counts();
        let used = counts.used(policy, window, now);
        let allowed = used < limit;
        if allowed {
            entry.current = entry.current.saturating_add(1);
            if now > entry.last_seen {
                entry.last_seen = now;
            }
        }

        Ok(Admission {
            allowed,
            used,
            counts,
        })
    }

    /// Get the number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn get_counts(
        &self,
        key: &str,
        window: Duration,
        now: SystemTime,
    ) -> Result<WindowCounts> {
        self.counts(key, window, now)
    }

    async fn incr(&self, key: &str, window: Duration, now: SystemTime) -> Result<()> {
        self.increment(key, window, now)
    }

    async fn acquire(
        &self,
        key: &str,
        window: Duration,
        now: SystemTime,
        limit: u64,
        policy: WindowPolicy,
    ) -> Result<Admission> {
        self.try_acquire(key, window, now, limit, policy)
    }
}

impl Evict for MemoryWindowStore {
    fn evict_idle(&self, now: SystemTime, ttl: Duration) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let idle = now
                .duration_since(entry.last_seen)
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

    const WINDOW: Duration = Duration::from_secs(10);

    fn at(millis: u64) -> SystemTime {
        // Aligned to a 10s boundary
        UNIX_EPOCH + Duration::from_secs(1_700_000_000) + Duration::from_millis(millis)
    }

    #[test]
    fn test_window_start_truncates_to_epoch_multiple() {
        let now = UNIX_EPOCH + Duration::from_millis(1_234_567);
        let start = window_start(now, WINDOW).unwrap();
        assert_eq!(start, UNIX_EPOCH + Duration::from_secs(1_230));

        let start = window_start(now, Duration::from_millis(250)).unwrap();
        assert_eq!(start, UNIX_EPOCH + Duration::from_millis(1_234_500));
    }

    #[test]
    fn test_zero_window_is_an_error() {
        let store = MemoryWindowStore::new();
        assert!(store.counts("k", Duration::ZERO, at(0)).is_err());
        assert!(store.increment("k", Duration::ZERO, at(0)).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_unseen_key_reports_zero_without_state() {
        let store = MemoryWindowStore::new();

        let counts = store.counts("nobody", WINDOW, at(3_500)).unwrap();

        assert_eq!(counts.current, 0);
        assert_eq!(counts.previous, 0);
        assert_eq!(counts.window_start, at(0));
        assert!(store.is_empty());
    }

    #[test]
    fn test_counts_within_same_window() {
        let store = MemoryWindowStore::new();
        store.increment("k", WINDOW, at(1_000)).unwrap();
        store.increment("k", WINDOW, at(9_999)).unwrap();

        let counts = store.counts("k", WINDOW, at(9_999)).unwrap();
        assert_eq!((counts.current, counts.previous), (2, 0));
    }

    #[test]
    fn test_rollover_by_one_window_carries_current() {
        let store = MemoryWindowStore::new();
        store.increment("k", WINDOW, at(2_000)).unwrap();

        let counts = store.counts("k", WINDOW, at(12_000)).unwrap();

        assert_eq!(counts.current, 0);
        assert_eq!(counts.previous, 1);
        assert_eq!(counts.window_start, at(10_000));
    }

    #[test]
    fn test_rollover_past_one_window_resets() {
        let store = MemoryWindowStore::new();
        store.increment("k", WINDOW, at(2_000)).unwrap();

        let counts = store.counts("k", WINDOW, at(22_000)).unwrap();

        assert_eq!(counts.current, 0);
        assert_eq!(counts.previous, 0);
        assert_eq!(counts.window_start, at(20_000));
    }

    #[test]
    fn test_increment_after_rollover() {
        let store = MemoryWindowStore::new();
        for _ in 0..3 {
            store.increment("k", WINDOW, at(0)).unwrap();
        }
        store.increment("k", WINDOW, at(10_500)).unwrap();

        let counts = store.counts("k", WINDOW, at(10_500)).unwrap();
        assert_eq!((counts.current, counts.previous), (1, 3));
    }

    #[test]
    fn test_keys_are_isolated() {
        let store = MemoryWindowStore::new();
        for _ in 0..50 {
            store.increment("a", WINDOW, at(0)).unwrap();
        }
        store.increment("b", WINDOW, at(0)).unwrap();

        assert_eq!(store.counts("a", WINDOW, at(0)).unwrap().current, 50);
        assert_eq!(store.counts("b", WINDOW, at(0)).unwrap().current, 1);
    }

    #[test]
    fn test_weighted_count_interpolates_previous() {
        let counts = WindowCounts {
            current: 2,
            previous: 10,
            window_start: at(10_000),
        };

        assert_eq!(counts.weighted(WINDOW, at(10_000)), 12);
        assert_eq!(counts.weighted(WINDOW, at(15_000)), 7);
        // 10 * 0.25 = 2.5 floors to 2
        assert_eq!(counts.weighted(WINDOW, at(17_500)), 4);
        assert_eq!(counts.weighted(WINDOW, at(19_999)), 2);
        assert_eq!(counts.weighted(WINDOW, at(25_000)), 2);
    }

    #[test]
    fn test_reset_after_counts_down_to_window_end() {
        let counts = WindowCounts::empty(at(10_000));
        assert_eq!(counts.reset_after(WINDOW, at(12_500)), Duration::from_millis(7_500));
        assert_eq!(counts.reset_after(WINDOW, at(30_000)), Duration::ZERO);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let store = MemoryWindowStore::new();

        std::thread::scope(|scope| {
            for _ in 0..32 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        store.increment("shared", WINDOW, at(0)).unwrap();
                    }
                });
            }
        });

        assert_eq!(store.counts("shared", WINDOW, at(0)).unwrap().current, 320);
    }

    #[test]
    fn test_acquire_admits_up_to_limit() {
        let store = MemoryWindowStore::new();

        for expected_used in 0..3 {
            let admission = store
                .try_acquire("k", WINDOW, at(1_000), 3, WindowPolicy::Fixed)
                .unwrap();
            assert!(admission.allowed);
            assert_eq!(admission.used, expected_used);
        }

        let denied = store
            .try_acquire("k", WINDOW, at(1_000), 3, WindowPolicy::Fixed)
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.used, 3);
        // Denied requests are not counted
        assert_eq!(store.counts("k", WINDOW, at(1_000)).unwrap().current, 3);
    }

    #[test]
    fn test_acquire_weighted_counts_previous_window() {
        let store = MemoryWindowStore::new();
        for _ in 0..4 {
            store.increment("k", WINDOW, at(9_000)).unwrap();
        }

        // 0 + floor(4 * 0.5) = 2 in use
        let admission = store
            .try_acquire("k", WINDOW, at(15_000), 3, WindowPolicy::Weighted)
            .unwrap();
        assert!(admission.allowed);
        assert_eq!(admission.used, 2);
        assert_eq!(admission.counts.previous, 4);

        let denied = store
            .try_acquire("k", WINDOW, at(15_000), 3, WindowPolicy::Weighted)
            .unwrap();
        assert!(!denied.allowed);
    }

    #[test]
    fn test_concurrent_acquire_admits_exactly_limit() {
        let store = MemoryWindowStore::new();
        let barrier = std::sync::Barrier::new(32);
        let admitted = std::sync::atomic::AtomicU64::new(0);

        std::thread::scope(|scope| {
            for _ in 0..32 {
                scope.spawn(|| {
                    barrier.wait();
                    for _ in 0..10 {
                        let admission = store
                            .try_acquire("shared", WINDOW, at(0), 100, WindowPolicy::Fixed)
                            .unwrap();
                        if admission.allowed {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(std::sync::atomic::Ordering::SeqCst), 100);
        assert_eq!(store.counts("shared", WINDOW, at(0)).unwrap().current, 100);
    }

    #[test]
    fn test_evict_idle() {
        let store = MemoryWindowStore::new();
        store.increment("stale", WINDOW, at(0)).unwrap();
        store.increment("active", WINDOW, at(55_000)).unwrap();

        assert_eq!(store.evict_idle(at(60_000), Duration::from_secs(30)), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.counts("stale", WINDOW, at(60_000)).unwrap().current, 0);
    }

    #[tokio::test]
    async fn test_trait_object_round_trip() {
        let store: std::sync::Arc<dyn WindowStore> =
            std::sync::Arc::new(MemoryWindowStore::new());

        store.incr("k", WINDOW, at(0)).await.unwrap();
        store.incr("k", WINDOW, at(1)).await.unwrap();

        let counts = store.get_counts("k", WINDOW, at(2)).await.unwrap();
        assert_eq!(counts.current, 2);
    }
}
