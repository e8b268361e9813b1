//! HTTP ingress: health, direct publishing and id generation.

pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

pub use handlers::AppState;

/// Build the HTTP routes.
pub fn build_app(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Publishing
        .route("/events", post(handlers::publish_event))
        .route("/topics/:topic/messages", post(handlers::publish_to_topic))
        // Ids
        .route("/ids", get(handlers::new_id))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
