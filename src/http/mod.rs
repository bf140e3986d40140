//! HTTP surface: the axum middleware and a server applying configured limits.

mod middleware;
mod server;

pub use middleware::{
    add_rate_limit_headers, default_denied_response, rate_limit, RATELIMIT_LIMIT,
    RATELIMIT_REMAINING, RATELIMIT_RESET,
};
pub use server::{build_router, HttpServer};
