//! HTTP server applying configured rate limits.

use axum::{
    extract::Request,
    middleware::from_fn_with_state,
    routing::{any, get},
    Json, Router,
};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::rate_limit;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{check_route_paths, Limits};

const HEALTH_PATH: &str = "/healthz";

/// Build a router with one endpoint per route rule.
///
/// Route limiters wrap only their own route; the global limiter, if any, wraps
/// every route including the fallback. Endpoints answer with a small JSON
/// acknowledgement.
pub fn build_router(limits: &Limits) -> Result<Router> {
    if limits.routes.iter().any(|(path, _)| path == HEALTH_PATH) {
        return Err(TurnstileError::Config(format!(
            "{} is reserved for health checks",
            HEALTH_PATH
        )));
    }
    // Router::route panics on paths it cannot register
    check_route_paths(
        std::iter::once(HEALTH_PATH).chain(limits.routes.iter().map(|(path, _)| path.as_str())),
    )?;

    let mut router = Router::new().route(HEALTH_PATH, get(health));
    for (path, limiter) in &limits.routes {
        router = router.route(
            path,
            any(acknowledge).route_layer(from_fn_with_state(limiter.clone(), rate_limit)),
        );
    }

    router = router.fallback(acknowledge);

    if let Some(global) = &limits.global {
        router = router.layer(from_fn_with_state(global.clone(), rate_limit));
    }

    Ok(router)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn acknowledge(request: Request) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "method": request.method().as_str(),
        "path": request.uri().path(),
    }))
}

/// HTTP server for a rate limited router.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The router to serve
    router: Router,
}

impl HttpServer {
    /// Create a new server for `router`.
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Create a new server for the router built from `limits`.
    pub fn from_limits(addr: SocketAddr, limits: &Limits) -> Result<Self> {
        Ok(Self::new(addr, build_router(limits)?))
    }

    /// Start the server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Starting HTTP server with graceful shutdown");

        // Peer addresses feed the default IP key
        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}
