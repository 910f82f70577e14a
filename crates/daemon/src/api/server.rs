/// API Server implementation

use super::handlers::*;
use anyhow::Result;
use axum::{routing::get, Router};
use bitmesh_core::RouterSnapshot;
use std::net::SocketAddr;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Read-only status server over the snapshots the node publishes
pub struct ApiServer {
    listen_addr: SocketAddr,
    snapshots: watch::Receiver<RouterSnapshot>,
}

impl ApiServer {
    pub fn new(listen_addr: SocketAddr, snapshots: watch::Receiver<RouterSnapshot>) -> Self {
        Self {
            listen_addr,
            snapshots,
        }
    }

    /// All endpoints, CORS open for browser extensions
    pub fn router(&self) -> Router {
        let state = AppState {
            snapshots: self.snapshots.clone(),
        };

        Router::new()
            .route("/health", get(health_check))
            .route("/api/wallet", get(get_wallet))
            .route("/api/circuits", get(get_circuits))
            .route("/api/circuits/:key", get(get_circuit))
            .route("/api/status", get(get_status))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    pub async fn start(self) -> Result<()> {
        let app = self.router();

        info!("API server starting on {}", self.listen_addr);
        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;

        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("API server error: {}", e))?;

        Ok(())
    }
}
