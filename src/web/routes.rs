use axum::{
    http::HeaderName,
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::static_files::{index_handler, static_handler};
use super::ws::ws_handler;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(handlers::SESSION_HEADER)]);

    // Signaling endpoints, at the root as browser clients expect them
    let signaling_routes = Router::new()
        .route("/createPeerConnection", post(handlers::create_peer_connection))
        .route("/addVideo", post(handlers::add_video))
        .route("/removeVideo", post(handlers::remove_video))
        .route("/closePeerConnection", post(handlers::close_peer_connection));

    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::status))
        .route("/ws", any(ws_handler));

    Router::new()
        .route("/", get(index_handler))
        .merge(signaling_routes)
        .nest("/api", api_routes)
        .fallback(static_handler)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
