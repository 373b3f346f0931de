//! API routes.

pub mod health;
pub mod tables;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health_handler))
        .route("/ready", get(health::ready_handler))
        .route("/live", get(health::live_handler))
        .route("/metrics", get(health::metrics_handler))
        .route("/tables", get(tables::list_handler))
        .route("/tables/:database/:table", get(tables::status_handler))
        .route("/tables/:database/:table/insert", post(tables::insert_handler))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
