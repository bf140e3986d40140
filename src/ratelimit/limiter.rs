//! Rate limiter handle and strategy dispatch.

use axum::extract::Request;
use axum::response::Response;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, trace, warn};

use super::bucket::TokenBucketStore;
use super::cleanup::{self, CleanupTask, Evict};
use super::key::{self, KeyFn};
use super::window::{MemoryWindowStore, WindowPolicy, WindowStore};
use crate::error::{Result, TurnstileError};

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Configured limit (bucket capacity or requests per window)
    pub limit: u64,
    /// Requests still available after this one
    pub remaining: u64,
    /// Seconds until the limit frees up again
    pub reset_after: u64,
}

impl Decision {
    /// An allowed decision that consumed nothing.
    pub fn bypass(limit: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_after: 0,
        }
    }
}

/// What to do when the window store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Let the request through
    Open,
    /// Reject the request
    Closed,
}

/// Limiting algorithm together with its state.
#[derive(Clone)]
pub enum Strategy {
    /// Smooth, burst-tolerant limiting
    TokenBucket(Arc<TokenBucketStore>),
    /// Quota of `limit` requests per `window`
    SlidingWindow {
        store: Arc<dyn WindowStore>,
        limit: u64,
        window: Duration,
        policy: WindowPolicy,
        on_store_error: FailureMode,
    },
}

/// Builds the response sent when a request is rejected.
pub type DenyHandler = Arc<dyn Fn(&Request, &Decision) -> Response + Send + Sync>;

/// Called with the key and decision of every rejected request.
pub type LimitHook = Arc<dyn Fn(&str, &Decision) + Send + Sync>;

/// A configured rate limiter.
///
/// Cloning is cheap and clones share state. Each constructor call creates a
/// fresh store, so two limiters built separately never see each other's keys.
#[derive(Clone)]
pub struct RateLimiter {
    strategy: Strategy,
    key_fn: KeyFn,
    deny_handler: Option<DenyHandler>,
    on_limit_reached: Option<LimitHook>,
    headers: bool,
    evictor: Option<Arc<dyn Evict>>,
    cleanup: Arc<Mutex<Option<CleanupTask>>>,
}

impl RateLimiter {
    fn with_strategy(strategy: Strategy, evictor: Option<Arc<dyn Evict>>) -> Self {
        Self {
            strategy,
            key_fn: key::peer_ip(),
            deny_handler: None,
            on_limit_reached: None,
            headers: true,
            evictor,
            cleanup: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a token bucket limiter refilling at `requests_per_second` with
    /// room for `burst` requests at once.
    pub fn token_bucket(requests_per_second: f64, burst: u64) -> Result<Self> {
        let store = Arc::new(TokenBucketStore::new(burst, requests_per_second)?);
        let evictor: Arc<dyn Evict> = store.clone();
        Ok(Self::with_strategy(Strategy::TokenBucket(store), Some(evictor)))
    }

    /// Create a sliding window limiter over the given store.
    ///
    /// `on_store_error` decides the outcome when the store fails.
    pub fn sliding_window(
        store: Arc<dyn WindowStore>,
        limit: u64,
        window: Duration,
        on_store_error: FailureMode,
    ) -> Result<Self> {
        Self::validate_window(limit, window)?;
        Ok(Self::with_strategy(
            Strategy::SlidingWindow {
                store,
                limit,
                window,
                policy: WindowPolicy::default(),
                on_store_error,
            },
            None,
        ))
    }

    /// Create a sliding window limiter with its own in-memory store.
    pub fn in_memory_window(
        limit: u64,
        window: Duration,
        on_store_error: FailureMode,
    ) -> Result<Self> {
        Self::validate_window(limit, window)?;
        let store = Arc::new(MemoryWindowStore::new());
        let evictor: Arc<dyn Evict> = store.clone();
        Ok(Self::with_strategy(
            Strategy::SlidingWindow {
                store,
                limit,
                window,
                policy: WindowPolicy::default(),
                on_store_error,
            },
            Some(evictor),
        ))
    }

    fn validate_window(limit: u64, window: Duration) -> Result<()> {
        if limit == 0 {
            return Err(TurnstileError::Config(
                "window limit must be at least 1".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(TurnstileError::Config(
                "window length must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Use a custom key function.
    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = key_fn;
        self
    }

    /// Use a custom response for rejected requests.
    pub fn with_deny_handler(mut self, handler: DenyHandler) -> Self {
        self.deny_handler = Some(handler);
        self
    }

    /// Enable or disable `RateLimit-*` response headers.
    pub fn with_headers(mut self, enabled: bool) -> Self {
        self.headers = enabled;
        self
    }

    /// Set how the sliding window counts requests. Ignored for token buckets.
    pub fn with_policy(mut self, policy: WindowPolicy) -> Self {
        if let Strategy::SlidingWindow { policy: current, .. } = &mut self.strategy {
            *current = policy;
        }
        self
    }

    /// Register a hook run for every rejected request.
    pub fn on_limit_reached(mut self, hook: LimitHook) -> Self {
        self.on_limit_reached = Some(hook);
        self
    }

    /// Get the strategy in use.
    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    /// Get the configured limit.
    pub fn limit(&self) -> u64 {
        match &self.strategy {
            Strategy::TokenBucket(store) => store.capacity(),
            Strategy::SlidingWindow { limit, .. } => *limit,
        }
    }

    /// Check whether rate limit headers are emitted.
    pub fn headers_enabled(&self) -> bool {
        self.headers
    }

    /// Get the custom deny handler, if any.
    pub fn deny_handler(&self) -> Option<&DenyHandler> {
        self.deny_handler.as_ref()
    }

    /// Derive the limit key for a request.
    pub fn key_for(&self, request: &Request) -> String {
        (self.key_fn)(request)
    }

    /// Count one request for `key` at `now` and decide whether it may proceed.
    ///
    /// An empty key is always allowed and leaves no state behind.
    pub async fn check(&self, key: &str, now: SystemTime) -> Decision {
        if key.is_empty() {
            return Decision::bypass(self.limit());
        }

        trace!(key = %key, "Checking rate limit");

        let decision = match &self.strategy {
            Strategy::TokenBucket(store) => store.allow(key, now),
            Strategy::SlidingWindow {
                store,
                limit,
                window,
                policy,
                on_store_error,
            } => match check_window(store.as_ref(), key, *limit, *window, *policy, now).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(
                        key = %key,
                        error = %e,
                        mode = ?on_store_error,
                        "Window store failed, applying failure mode"
                    );
                    match on_store_error {
                        FailureMode::Open => Decision::bypass(*limit),
                        FailureMode::Closed => Decision {
                            allowed: false,
                            limit: *limit,
                            remaining: 0,
                            reset_after: ceil_secs(*window),
                        },
                    }
                }
            },
        };

        if !decision.allowed {
            debug!(
                key = %key,
                limit = decision.limit,
                reset_after = decision.reset_after,
                "Rate limit exceeded"
            );
            if let Some(hook) = &self.on_limit_reached {
                hook(key, &decision);
            }
        }

        decision
    }

    /// Start evicting entries idle for longer than `ttl`, sweeping every
    /// `interval`. Replaces any sweep already running for this limiter.
    ///
    /// Only limiters over an in-memory store support eviction.
    pub fn start_cleanup(&self, interval: Duration, ttl: Duration) -> Result<()> {
        let evictor = self.evictor.clone().ok_or_else(|| {
            TurnstileError::Config("store does not support idle eviction".to_string())
        })?;
        let task = cleanup::spawn(evictor, interval, ttl)?;

        // Dropping a replaced task signals it to stop
        let _previous = self.cleanup.lock().replace(task);
        Ok(())
    }

    /// Stop the eviction sweep, if running, and wait for it to exit.
    pub async fn stop_cleanup(&self) {
        let task = self.cleanup.lock().take();
        if let Some(task) = task {
            task.shutdown().await;
        }
    }

    /// Check whether an eviction sweep is running.
    pub fn cleanup_running(&self) -> bool {
        self.cleanup
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

async fn check_window(
    store: &dyn WindowStore,
    key: &str,
    limit: u64,
    window: Duration,
    policy: WindowPolicy,
    now: SystemTime,
) -> Result<Decision> {
    let admission = store.acquire(key, window, now, limit, policy).await?;
    let reset_after = ceil_secs(admission.counts.reset_after(window, now));

    let remaining = if admission.allowed {
        limit - admission.used - 1
    } else {
        0
    };

    Ok(Decision {
        allowed: admission.allowed,
        limit,
        remaining,
        reset_after,
    })
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}
