//! Rate limit key extraction.
//!
//! A key function maps a request to the string its limit is tracked under.
//! Returning an empty string exempts the request from limiting.

use axum::extract::{ConnectInfo, Request};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::TurnstileError;

/// Function deriving the limit key from a request.
pub type KeyFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// Key by the IP address of the connected peer.
///
/// Requires the router to be served with
/// `into_make_service_with_connect_info::<SocketAddr>()`; without it the key is
/// empty and requests pass unlimited.
pub fn peer_ip() -> KeyFn {
    Arc::new(|req: &Request| peer_addr(req).unwrap_or_default())
}

/// Key by the client address reported by a fronting proxy.
///
/// Uses the first `X-Forwarded-For` entry, then `X-Real-IP`, then the peer
/// address. Only use this behind a proxy that overwrites these headers.
pub fn forwarded_ip() -> KeyFn {
    Arc::new(|req: &Request| {
        let headers = req.headers();
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                headers
                    .get("x-real-ip")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
            })
            .map(str::to_string)
            .or_else(|| peer_addr(req))
            .unwrap_or_default()
    })
}

/// Key by the value of a request header, e.g. an API key.
pub fn header(name: impl Into<String>) -> KeyFn {
    let name = name.into();
    Arc::new(move |req: &Request| {
        req.headers()
            .get(name.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_default()
    })
}

fn peer_addr(req: &Request) -> Option<String> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

/// Named key extractor, as written in rule files.
///
/// Parsed from `peer_ip`, `forwarded_ip` or `header:<name>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeySource {
    #[default]
    PeerIp,
    ForwardedIp,
    Header(String),
}

impl KeySource {
    /// Build the key function for this source.
    pub fn key_fn(&self) -> KeyFn {
        match self {
            KeySource::PeerIp => peer_ip(),
            KeySource::ForwardedIp => forwarded_ip(),
            KeySource::Header(name) => header(name.clone()),
        }
    }
}

impl FromStr for KeySource {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "peer_ip" => Ok(KeySource::PeerIp),
            "forwarded_ip" => Ok(KeySource::ForwardedIp),
            other => match other.strip_prefix("header:") {
                Some(name) if !name.trim().is_empty() => {
                    Ok(KeySource::Header(name.trim().to_ascii_lowercase()))
                }
                _ => Err(TurnstileError::Config(format!("unknown key source: {}", other))),
            },
        }
    }
}

impl TryFrom<String> for KeySource {
    type Error = TurnstileError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeySource> for String {
    fn from(source: KeySource) -> Self {
        match source {
            KeySource::PeerIp => "peer_ip".to_string(),
            KeySource::ForwardedIp => "forwarded_ip".to_string(),
            KeySource::Header(name) => format!("header:{}", name),
        }
    }
}
