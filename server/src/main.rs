//! Pulsegate - Main Entry Point
//!
//! Resumable-session WebSocket gateway.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

mod codec;
mod config;
mod error;
mod pool;
mod quality;
mod server;
mod session;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulsegate=debug,tower_http=debug".into()),
        )
        .json()
        .init();

    dotenvy::dotenv().ok();
    let config = config::Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Pulsegate gateway"
    );

    let gateway = Arc::new(server::GatewayServer::new(config.clone()));
    gateway.spawn_background_tasks();
    let app = server::router(gateway.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    info!(address = %config.bind_address(), "Server listening");

    let shutdown_gateway = gateway.clone();
    let shutdown_signal = async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        info!("received shutdown signal, closing sessions...");
        shutdown_gateway.shutdown().await;
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    info!("server shutdown complete");

    Ok(())
}
