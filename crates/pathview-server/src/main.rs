//! PathView execution kernel server.
//!
//! Run with: cargo run -p pathview-server

mod config;

use std::sync::Arc;

use clap::Parser;
use pathview_session::SessionManager;
use pathview_transport::{AppState, app};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // a missing .env file is fine
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::parse();
    let addr = config.addr()?;

    let manager = Arc::new(SessionManager::new(config.manager_config()));
    let reaper = Arc::clone(&manager).spawn_reaper(config.reap_interval());

    let app = app(AppState::new(manager), config.production);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(production = config.production, "Server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper.abort();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}
