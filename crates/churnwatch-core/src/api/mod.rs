//! REST API implementation
//!
//! This module provides the HTTP API for churnwatch: event ingestion,
//! manual digest sweeps and per-channel alert settings.

pub mod handlers;
pub mod routes;

pub use handlers::AppState;
pub use routes::create_router;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::alerting::AlertOrchestrator;
use crate::db::Database;
use crate::error::Result;

/// HTTP API server
pub struct HttpServer {
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(db: Database, orchestrator: Arc<AlertOrchestrator>) -> Self {
        Self {
            state: AppState { db, orchestrator },
        }
    }

    /// Serve until `shutdown` fires
    pub async fn serve(self, addr: &str, shutdown: CancellationToken) -> Result<()> {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = create_router(self.state).layer(cors);

        let listener = TcpListener::bind(addr).await?;

        info!(addr, "HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}
