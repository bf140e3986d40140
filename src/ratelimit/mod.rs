//! Rate limiting strategies and state management.

mod bucket;
pub mod cleanup;
pub mod key;
mod limiter;
mod rules;
mod window;

pub use bucket::TokenBucketStore;
pub use cleanup::{CleanupTask, Evict};
pub use key::{KeyFn, KeySource};
pub use limiter::{Decision, DenyHandler, FailureMode, LimitHook, RateLimiter, Strategy};
pub(crate) use rules::check_route_paths;
pub use rules::{LimitRule, Limits, RateLimitRules, RouteRule, StrategyKind};
pub use window::{
    window_start, Admission, MemoryWindowStore, WindowCounts, WindowPolicy, WindowStore,
};
