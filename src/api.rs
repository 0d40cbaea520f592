//! HTTP boundary
//!
//! Thin axum layer over the [`Coordinator`]: deserialization, status-code
//! mapping, nothing else. All trigger semantics live behind
//! [`Coordinator::handle_trigger`] so serial-forwarded and HTTP-originated
//! events behave identically.

use crate::coordinator::{Coordinator, GatewayStatus, PlayOutcome};
use crate::playback::PlayError;
use crate::trigger::{TriggerEvent, TriggerSource};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Request body for POST /trigger_audio
#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub button_id: Option<u32>,
    #[serde(default)]
    pub is_hold: bool,
    pub source: Option<String>,
}

/// Response for an accepted trigger
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub status: &'static str,
    pub audio_file: String,
    pub source: String,
    pub event_type: String,
}

/// Request body for POST /set_volume
#[derive(Debug, Deserialize)]
pub struct SetVolumeRequest {
    pub volume: f32,
}

/// API error payload with its HTTP status
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<PlayError> for ApiError {
    fn from(err: PlayError) -> Self {
        let status = match &err {
            PlayError::NoMapping(_) | PlayError::SourceNotFound(_) => StatusCode::NOT_FOUND,
            PlayError::InvalidVolume(_) => StatusCode::BAD_REQUEST,
            PlayError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

/// Build the service router
pub fn build_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/trigger_audio", post(trigger_audio))
        .route("/status", get(status))
        .route("/set_volume", post(set_volume))
        .route("/health", get(health_check))
        .with_state(coordinator)
}

/// POST /trigger_audio - fire a button trigger
async fn trigger_audio(
    State(coordinator): State<Arc<Coordinator>>,
    Json(req): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, ApiError> {
    let Some(button_id) = req.button_id else {
        return Err(ApiError::bad_request("No button_id provided"));
    };
    if button_id == 0 {
        return Err(ApiError::bad_request("Invalid button_id: 0"));
    }

    let source = req
        .source
        .as_deref()
        .map(TriggerSource::from_tag)
        .unwrap_or(TriggerSource::Direct);

    let event = TriggerEvent {
        button_id,
        is_hold: req.is_hold,
        source,
    };

    let outcome = coordinator.handle_trigger(event).await.map_err(|e| {
        warn!("Trigger rejected: {}", e);
        ApiError::from(e)
    })?;

    let PlayOutcome {
        audio_file,
        source,
        event_type,
    } = outcome;
    Ok(Json(TriggerResponse {
        status: "success",
        audio_file,
        source,
        event_type,
    }))
}

/// GET /status - aggregate gateway status
async fn status(State(coordinator): State<Arc<Coordinator>>) -> Json<GatewayStatus> {
    Json(coordinator.status())
}

/// POST /set_volume - adjust playback volume (0.0 to 1.0)
async fn set_volume(
    State(coordinator): State<Arc<Coordinator>>,
    Json(req): Json<SetVolumeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    coordinator.set_volume(req.volume)?;
    info!("Volume set to {}", req.volume);
    Ok(Json(serde_json::json!({
        "status": "success",
        "volume": req.volume
    })))
}

/// GET /health - liveness probe
async fn health_check() -> &'static str {
    "ok"
}

/// Serve the API until `shutdown` resolves.
pub async fn serve(
    coordinator: Arc<Coordinator>,
    bind: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = build_router(coordinator);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind API server on {bind}"))?;
    info!("API server listening on http://{}", bind);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
