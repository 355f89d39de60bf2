use {
    axum::{
        Json, Router,
        extract::DefaultBodyLimit,
        routing::{get, post},
    },
    tokio::net::TcpListener,
    tracing::info,
};

use crate::{file_proxy, inbound, state::GatewayState};

/// Inbound envelopes are metadata plus capability URLs, never file bytes.
const INBOUND_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Build the relay router. Shared between production startup and tests.
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/relay/inbound",
            post(inbound::handle).layer(DefaultBodyLimit::max(INBOUND_BODY_LIMIT)),
        )
        .route("/relay/file", get(file_proxy::handle))
        .with_state(state)
}

/// Serve the relay until the listener closes.
pub async fn serve(state: GatewayState, listener: TcpListener) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "relay gateway listening");
    axum::serve(listener, build_router(state)).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
