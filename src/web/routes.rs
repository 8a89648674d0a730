use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::WebState;

/// Create the application router
pub fn create_router(state: Arc<WebState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/state", get(handlers::stream_state));

    let stream_routes = Router::new()
        .route("/stream", get(handlers::mjpeg_stream))
        .route("/snapshot", get(handlers::snapshot))
        .route("/state", get(handlers::stream_state));

    Router::new()
        .merge(stream_routes)
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
