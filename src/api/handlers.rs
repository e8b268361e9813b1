//! HTTP request handlers for the event router.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::broker::{publish_raw, BrokerClient};
use crate::error::TransportError;
use crate::message::new_unique_id;
use crate::router::RouterState;
use crate::types::PipelineConfig;

/// Application state shared across handlers.
pub struct AppState {
    pub broker: Arc<dyn BrokerClient>,
    pub config: PipelineConfig,
    pub router_state: watch::Receiver<RouterState>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    router_state: RouterState,
}

/// Response to an accepted publish.
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    id: String,
    topic: String,
}

#[derive(Debug, Serialize)]
pub struct IdResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Errors returned by the publish endpoints.
#[derive(Debug)]
pub enum ApiError {
    EmptyPayload,
    Transport(TransportError),
}

impl From<TransportError> for ApiError {
    fn from(e: TransportError) -> Self {
        ApiError::Transport(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::EmptyPayload => (StatusCode::BAD_REQUEST, "payload is empty".to_string()),
            ApiError::Transport(e) => (StatusCode::BAD_GATEWAY, e.to_string()),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let router_state = *state.router_state.borrow();
    let status = match router_state {
        RouterState::Running => "healthy",
        RouterState::Created | RouterState::Configured => "starting",
        RouterState::Stopping | RouterState::Stopped => "stopping",
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        router_state,
    })
}

/// Publish a raw body to the pipeline's input topic.
pub async fn publish_event(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<PublishResponse>), ApiError> {
    let topic = state.config.topics.input.clone();
    publish(&state, topic, body).await
}

/// Publish a raw body to any topic.
pub async fn publish_to_topic(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<PublishResponse>), ApiError> {
    publish(&state, topic, body).await
}

async fn publish(
    state: &AppState,
    topic: String,
    body: Bytes,
) -> Result<(StatusCode, Json<PublishResponse>), ApiError> {
    if body.is_empty() {
        return Err(ApiError::EmptyPayload);
    }

    let id = publish_raw(state.broker.as_ref(), &topic, body.to_vec())
        .await
        .map_err(|e| {
            warn!(topic = %topic, error = %e, "Publish request failed");
            e
        })?;

    info!(topic = %topic, id = %id, "Published message from HTTP request");
    Ok((StatusCode::ACCEPTED, Json(PublishResponse { id, topic })))
}

/// Hand out a fresh unique id.
pub async fn new_id() -> Json<IdResponse> {
    Json(IdResponse {
        id: new_unique_id(),
    })
}
