//! sqlconsole: ad-hoc SQL over a WebSocket.
//!
//! Each WebSocket on `/ws` becomes a session that answers `{"Query": ...}`
//! frames one at a time with columns and rows, an error, or (for the
//! reserved `stats` command) connection-pool telemetry.

mod config;
mod encoder;
mod executor;
mod protocol;
mod server;
mod session;
mod telemetry;
#[cfg(test)]
mod testing;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlconsole_db::{CancelToken, PgStore, SqliteStore, Store};
use tracing::info;

use crate::config::{Args, Backend};
use crate::server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init(&args.log_level, args.json_logs)?;

    match args.backend() {
        Backend::Postgres(config) => {
            info!(max_conns = config.max_conns, "connecting to postgres");
            let store = PgStore::connect(config)
                .await
                .map_err(anyhow::Error::msg)
                .context("postgres store unavailable")?;
            serve(&args, store).await
        }
        Backend::Sqlite { path, mode } => {
            info!(path = %path.display(), ?mode, "opening sqlite database");
            let store = SqliteStore::open(&path, args.max_conns.max(1), mode)
                .with_context(|| format!("cannot open {}", path.display()))?;
            serve(&args, store).await
        }
    }
}

async fn serve<S: Store>(args: &Args, store: S) -> Result<()> {
    let shutdown = CancelToken::new();
    let state = AppState::new(Arc::new(store), args.session_config(), shutdown.clone());
    let app = server::router(state, &args.static_dir);

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(%addr, static_dir = %args.static_dir.display(), "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutting down");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
