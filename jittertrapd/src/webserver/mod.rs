pub mod adaptive;
pub mod messages;
mod ws;

use crate::Daemon;
use anyhow::Result;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Launches the Axum webserver that carries the WebSocket feed.
/// This is designed to be run as an independent Tokio future,
/// with tokio::spawn unless you want it to block execution.
pub async fn spawn_webserver(daemon: Arc<Daemon>) -> Result<()> {
    let listen_address = daemon.config.webserver_listen.clone();
    let listener = TcpListener::bind(&listen_address).await?;

    let router = Router::new().nest("/websocket", ws::websocket_router(daemon));

    info!("Webserver listening on: [{listen_address}]");
    axum::serve(listener, router).await?;
    Ok(())
}
