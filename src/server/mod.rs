pub mod api;

use crate::handler::EventHandler;
use api::{flush_prefix, get_batch, health_check, list_batches, receive_event, ApiState};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the intake router. Every request is an independent invocation.
pub fn router(handler: EventHandler) -> Router {
    let state = Arc::new(ApiState { handler });

    Router::new()
        .route("/health", get(health_check))
        .route("/events", post(receive_event))
        .route("/batches", get(list_batches))
        .route("/batches/:batch_id", get(get_batch))
        .route("/prefixes/:prefix/flush", post(flush_prefix))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the intake HTTP server
pub async fn start_server(
    listen_addr: SocketAddr,
    handler: EventHandler,
) -> Result<(), std::io::Error> {
    let app = router(handler);

    info!(addr = %listen_addr, "Starting batch loader HTTP server");

    let listener = TcpListener::bind(listen_addr).await?;
    axum::serve(listener, app).await
}
