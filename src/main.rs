use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cache;
mod config;
mod error;
mod logging;
mod metrics;
mod proxy;
mod usage;

/// OpenAI-compatible chat relay: retries flaky upstreams, recovers dropped
/// streams, and keeps per-session usage accounting.
#[derive(Parser, Debug)]
#[command(name = "chat-relay", version)]
struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,
    /// Port to listen on.
    #[arg(long, default_value_t = 8787)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config::RelayConfig::from_env().context("loading configuration")?;
    info!(
        "upstream base: {} ({} model aliases)",
        config.upstream_base,
        config.model_aliases.len()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = proxy::RelayService::new(config, shutdown_rx)?;
    let metrics = Arc::clone(&service.metrics);
    let app = proxy::router(service);

    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port)
        .parse()
        .context("parsing bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("chat-relay listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("serving")?;

    metrics.end_session();
    info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM; flips the shutdown watch so in-flight
/// retry backoffs abort instead of holding the drain open.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received; draining in-flight requests");
    let _ = shutdown_tx.send(true);
}
