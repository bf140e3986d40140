//! Rate limit rules configuration.
//!
//! Rules are loaded from YAML and describe an optional limit applied to every
//! request plus independent limits scoped to individual routes:
//!
//! ```yaml
//! global:
//!   strategy: token_bucket
//!   requests_per_second: 50
//!   burst: 100
//! routes:
//!   - path: /login
//!     limit:
//!       strategy: sliding_window
//!       limit: 5
//!       window_secs: 60
//!       on_store_error: closed
//!       key: forwarded_ip
//! ```

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use super::key::KeySource;
use super::limiter::{FailureMode, RateLimiter};
use super::window::WindowPolicy;
use crate::error::{Result, TurnstileError};

/// Limiting algorithm named in a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    TokenBucket,
    SlidingWindow,
}

/// A single limit definition.
///
/// Which fields are required depends on `strategy`; [`LimitRule::build`]
/// rejects rules missing them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitRule {
    /// The limiting algorithm
    pub strategy: StrategyKind,
    /// Token bucket refill rate
    #[serde(default)]
    pub requests_per_second: Option<f64>,
    /// Token bucket capacity
    #[serde(default)]
    pub burst: Option<u64>,
    /// Requests allowed per window
    #[serde(default)]
    pub limit: Option<u64>,
    /// Window length in seconds
    #[serde(default)]
    pub window_secs: Option<u64>,
    /// How the previous window is counted
    #[serde(default)]
    pub policy: WindowPolicy,
    /// Outcome when the window store fails; must be stated for windows
    #[serde(default)]
    pub on_store_error: Option<FailureMode>,
    /// Where the limit key comes from
    #[serde(default)]
    pub key: KeySource,
    /// Emit `RateLimit-*` headers
    #[serde(default = "default_headers")]
    pub headers: bool,
}

fn default_headers() -> bool {
    true
}

/// A limit scoped to one route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// Route path as registered with the router
    pub path: String,
    /// The limit applied to this route only
    pub limit: LimitRule,
}

/// A complete set of rate limit rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitRules {
    /// Limit applied to every request
    #[serde(default)]
    pub global: Option<LimitRule>,
    /// Per-route limits
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

/// Limiters built from a rule set, one independent instance per rule.
#[derive(Clone, Default)]
pub struct Limits {
    /// Limiter wrapping every route
    pub global: Option<RateLimiter>,
    /// Route path and the limiter wrapping only that route
    pub routes: Vec<(String, RateLimiter)>,
}

impl LimitRule {
    /// Build a limiter with its own in-memory store.
    pub fn build(&self) -> Result<RateLimiter> {
        let limiter = match self.strategy {
            StrategyKind::TokenBucket => {
                let rate = self.requests_per_second.ok_or_else(|| {
                    missing("token_bucket", "requests_per_second")
                })?;
                let burst = self.burst.ok_or_else(|| missing("token_bucket", "burst"))?;
                RateLimiter::token_bucket(rate, burst)?
            }
            StrategyKind::SlidingWindow => {
                let limit = self.limit.ok_or_else(|| missing("sliding_window", "limit"))?;
                let window_secs = self
                    .window_secs
                    .ok_or_else(|| missing("sliding_window", "window_secs"))?;
                let on_store_error = self
                    .on_store_error
                    .ok_or_else(|| missing("sliding_window", "on_store_error"))?;
                let window = Duration::from_secs(window_secs);
                RateLimiter::in_memory_window(limit, window, on_store_error)?
                    .with_policy(self.policy)
            }
        };

        Ok(limiter
            .with_key_fn(self.key.key_fn())
            .with_headers(self.headers))
    }
}

/// Check that `paths` can be registered together on one router.
///
/// Paths go through the same matcher the router uses, so malformed
/// parameters and overlapping shapes such as `/users/{id}` next to
/// `/users/{name}` fail here instead of when the router is built.
pub(crate) fn check_route_paths<'a, I>(paths: I) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut matcher = matchit::Router::new();
    for path in paths {
        if !path.starts_with('/') {
            return Err(TurnstileError::Config(format!(
                "route path must start with '/': {}",
                path
            )));
        }
        if path
            .split('/')
            .any(|segment| segment.starts_with(':') || segment.starts_with('*'))
        {
            return Err(TurnstileError::Config(format!(
                "route parameters use `{{name}}` syntax: {}",
                path
            )));
        }
        matcher.insert(path, ()).map_err(|e| {
            TurnstileError::Config(format!("invalid route path {}: {}", path, e))
        })?;
    }
    Ok(())
}

fn missing(strategy: &str, field: &str) -> TurnstileError {
    TurnstileError::Config(format!("{} rule requires `{}`", strategy, field))
}

impl RateLimitRules {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: RateLimitRules = serde_yaml::from_str(yaml).map_err(|e| {
            TurnstileError::Config(format!("Failed to parse rate limit rules: {}", e))
        })?;
        rules.validate()?;
        Ok(rules)
    }

    /// Check route paths are usable and do not conflict.
    pub fn validate(&self) -> Result<()> {
        check_route_paths(self.routes.iter().map(|route| route.path.as_str()))
    }

    /// Find the rule scoped to `path`.
    pub fn find_route(&self, path: &str) -> Option<&LimitRule> {
        self.routes
            .iter()
            .find(|route| route.path == path)
            .map(|route| &route.limit)
    }

    /// Build a limiter for every rule.
    pub fn build(&self) -> Result<Limits> {
        self.validate()?;

        let global = self.global.as_ref().map(LimitRule::build).transpose()?;
        let routes = self
            .routes
            .iter()
            .map(|route| Ok((route.path.clone(), route.limit.build()?)))
            .collect::<Result<Vec<_>>>()?;

        if global.is_none() && routes.is_empty() {
            warn!("No rate limit rules configured, all requests pass unlimited");
        }

        Ok(Limits { global, routes })
    }
}

impl Limits {
    /// Iterate over every limiter, global first.
    pub fn iter(&self) -> impl Iterator<Item = &RateLimiter> {
        self.global
            .iter()
            .chain(self.routes.iter().map(|(_, limiter)| limiter))
    }

    /// Start idle eviction on every limiter.
    pub fn start_cleanup(&self, interval: Duration, ttl: Duration) -> Result<()> {
        for limiter in self.iter() {
            limiter.start_cleanup(interval, ttl)?;
        }
        Ok(())
    }

    /// Stop idle eviction on every limiter and wait for the sweeps to exit.
    pub async fn stop_cleanup(&self) {
        join_all(self.iter().map(RateLimiter::stop_cleanup)).await;
    }
}
