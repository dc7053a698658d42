//! Control surface HTTP server

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::config::UiConfig;
use crate::error::{Error, Result};
use crate::network::HealthProbe;
use crate::session::Session;
use crate::ui::{handlers, websocket};

/// Shared state behind every route
pub struct AppState {
    pub session: Arc<Session>,
    pub health: HealthProbe,
}

impl AppState {
    pub fn new(session: Arc<Session>) -> Self {
        let backend = &session.config().backend;
        let health = HealthProbe::new(&backend.health_url, backend.connect_timeout());
        Self { session, health }
    }
}

/// Build the route table
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(handlers::get_status))
        .route("/api/devices", get(handlers::get_devices))
        .route("/api/health", get(handlers::get_health))
        .route("/api/session/start", post(handlers::start_session))
        .route("/api/session/stop", post(handlers::stop_session))
        .route("/api/stems/:stem/volume", post(handlers::set_stem_volume))
        .route("/ws", get(websocket::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub struct WebServer {
    addr: SocketAddr,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: &UiConfig, session: Arc<Session>) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.bind_address, config.http_port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid UI address: {}", e)))?;
        Ok(Self {
            addr,
            state: Arc::new(AppState::new(session)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until the listener fails
    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("Control surface listening on http://{}", self.addr);
        axum::serve(listener, router(self.state)).await?;
        Ok(())
    }
}
