//! Router assembly.

pub mod health;
pub mod v1;

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::middleware;
use crate::state::AppState;

/// Build the full application router with tracing and CORS layers.
pub fn build(state: AppState) -> Router {
    let cors = middleware::cors::layer(state.config.cors_allowed_origins.as_deref());
    Router::new()
        .route("/health", get(health::health))
        .nest("/v1", v1::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
