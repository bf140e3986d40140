//! Turnstile - HTTP rate limiting middleware
//!
//! This crate implements per-key request limiting for axum services. Two
//! strategies are available: a continuously refilling token bucket for
//! smooth, burst-tolerant limits and a two-window counter for quota-style
//! limits. Each limiter owns its own in-memory store, so limiters applied to
//! different routes never share state.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;

pub use error::{Result, TurnstileError};
