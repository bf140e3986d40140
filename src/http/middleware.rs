//! Rate limiting middleware for axum.
//!
//! Install globally with `Router::layer` or on a single route with
//! `MethodRouter::route_layer`:
//!
//! ```rust,ignore
//! use axum::{middleware::from_fn_with_state, routing::get, Router};
//! use turnstile::http::rate_limit;
//! use turnstile::ratelimit::RateLimiter;
//!
//! let global = RateLimiter::token_bucket(50.0, 100)?;
//! let login = RateLimiter::in_memory_window(5, Duration::from_secs(60), FailureMode::Closed)?;
//!
//! let app = Router::new()
//!     .route("/login", post(login_handler).route_layer(from_fn_with_state(login, rate_limit)))
//!     .route("/", get(index))
//!     .layer(from_fn_with_state(global, rate_limit));
//! ```

use axum::{
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::time::SystemTime;
use tracing::{debug, trace, warn};

use crate::ratelimit::{Decision, RateLimiter};

/// Requests allowed per period.
pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
/// Requests left in the current period.
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
/// Seconds until the limit frees up.
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// Axum middleware function enforcing `limiter` on each request.
pub async fn rate_limit(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let key = limiter.key_for(&request);
    if key.is_empty() {
        trace!(path = %request.uri().path(), "No rate limit key, passing through");
        return next.run(request).await;
    }

    let decision = limiter.check(&key, SystemTime::now()).await;

    if !decision.allowed {
        warn!(
            key = %key,
            method = %request.method(),
            path = %request.uri().path(),
            reset_after = decision.reset_after,
            "Rate limit exceeded"
        );

        let mut response = match limiter.deny_handler() {
            Some(handler) => handler(&request, &decision),
            None => default_denied_response(),
        };
        if limiter.headers_enabled() {
            add_rate_limit_headers(&mut response, &decision);
        }
        return response;
    }

    debug!(
        key = %key,
        method = %request.method(),
        path = %request.uri().path(),
        remaining = decision.remaining,
        "Request allowed"
    );

    let mut response = next.run(request).await;
    if limiter.headers_enabled() {
        add_rate_limit_headers(&mut response, &decision);
    }
    response
}

/// The `429` response used when no deny handler is configured.
pub fn default_denied_response() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({ "error": "rate limit exceeded" })),
    )
        .into_response()
}

/// Add `RateLimit-*` headers for `decision`, plus `Retry-After` on denial.
pub fn add_rate_limit_headers(response: &mut Response, decision: &Decision) {
    let headers = response.headers_mut();

    headers.insert(RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(RATELIMIT_RESET, HeaderValue::from(decision.reset_after));

    if !decision.allowed {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(decision.reset_after));
    }
}
