//! HTTP login endpoint for burrow clients
//!
//! `POST /api/v1/login` trades credentials (or nothing, for anonymous
//! registration) for a client token. `GET /api/v1/health` reports liveness.

pub mod handlers;
pub mod models;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use burrow_auth::Authenticator;
use burrow_control::SessionRegistry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub authenticator: Arc<dyn Authenticator>,
    pub registry: Option<Arc<SessionRegistry>>,
}

pub struct ApiServer {
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            state: Arc::new(AppState {
                authenticator,
                registry: None,
            }),
        }
    }

    pub fn with_registry(self, registry: Arc<SessionRegistry>) -> Self {
        Self {
            state: Arc::new(AppState {
                authenticator: self.state.authenticator.clone(),
                registry: Some(registry),
            }),
        }
    }

    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/api/v1/login", post(handlers::login))
            .route("/api/v1/health", get(handlers::health_check))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve on an already bound listener until `shutdown` fires.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Login API listening on http://{}", addr);
        }
        let router = self.build_router();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }
}
