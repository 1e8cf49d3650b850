use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Json;
use linkhub_core::config::WebSocketConfig;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::hub::{Hub, HubStats};
use crate::router::Router;
use crate::session::websocket_handler;

/// Shared state for the HTTP routes
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub router: Arc<Router>,
    pub websocket: Arc<WebSocketConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(hub: Arc<Hub>, router: Router, websocket: WebSocketConfig) -> Self {
        Self {
            hub,
            router: Arc::new(router),
            websocket: Arc::new(websocket),
        }
    }
}

pub fn create_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/ws", get(websocket_handler))
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn stats(State(state): State<AppState>) -> Json<HubStats> {
    Json(state.hub.stats())
}

/// Serve until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "HTTP server listening");

    axum::serve(
        listener,
        create_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    info!("HTTP server shut down gracefully");
    Ok(())
}
