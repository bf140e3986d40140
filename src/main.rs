use clap::Parser;
use std::net::SocketAddr;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use turnstile::config::{LogFormat, LoggingSettings, Settings};
use turnstile::http::HttpServer;
use turnstile::ratelimit::RateLimitRules;

/// Rate limited HTTP server driven by a YAML rule file.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Settings file (YAML)
    #[arg(short, long)]
    config: Option<String>,

    /// Rate limit rules file (YAML), overrides `rules_path`
    #[arg(short, long)]
    rules: Option<String>,

    /// Listen address, overrides `server.listen_addr`
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        settings.server.listen_addr = listen;
    }
    if let Some(rules) = args.rules {
        settings.rules_path = Some(rules);
    }

    init_tracing(&settings.logging);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(listen_addr = %settings.server.listen_addr, "Configuration loaded");

    let rules = match &settings.rules_path {
        Some(path) => RateLimitRules::from_file(path)?,
        None => RateLimitRules::new(),
    };
    let limits = rules.build()?;
    info!(
        global = limits.global.is_some(),
        routes = limits.routes.len(),
        "Rate limiters initialized"
    );

    limits.start_cleanup(settings.cleanup.interval(), settings.cleanup.ttl())?;

    let server = HttpServer::from_limits(settings.server.listen_addr, &limits)?;
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    limits.stop_cleanup().await;
    served?;

    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false).with_thread_ids(true))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
