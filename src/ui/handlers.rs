//! HTTP API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::audio::device::{list_devices, AudioDeviceInfo};
use crate::error::{Error, ErrorKind};
use crate::network::HealthReport;
use crate::protocol::{StartRequest, VolumeRequest};
use crate::session::SessionStatus;
use crate::ui::server::AppState;

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
            error_kind: None,
        }
    }

    pub fn failure(err: &Error) -> Self {
        Self {
            error_kind: Some(err.kind()),
            ..Self::error(err.to_string())
        }
    }
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Connection | ErrorKind::BackendModel => StatusCode::BAD_GATEWAY,
        ErrorKind::CaptureUnavailable | ErrorKind::Playback => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::MalformedMessage | ErrorKind::Config => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Get session status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SessionStatus>> {
    Json(ApiResponse::ok(state.session.status()))
}

/// Get available audio devices
pub async fn get_devices() -> Json<ApiResponse<Vec<AudioDeviceInfo>>> {
    let devices = tokio::task::spawn_blocking(list_devices).await.unwrap_or_default();
    Json(ApiResponse::ok(devices))
}

/// Start separation; the body is optional
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    body: Option<Json<StartRequest>>,
) -> ApiResult<SessionStatus> {
    let request = body.map(|Json(req)| req).unwrap_or_default();
    match state.session.start(request).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(state.session.status()))),
        Err(e) => (status_for(e.kind()), Json(ApiResponse::failure(&e))),
    }
}

/// Stop separation
pub async fn stop_session(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SessionStatus>> {
    if !state.session.stop() {
        tracing::debug!("Stop requested while no session is active");
    }
    Json(ApiResponse::ok(state.session.status()))
}

/// Set one stem's volume
pub async fn set_stem_volume(
    State(state): State<Arc<AppState>>,
    Path(stem): Path<String>,
    Json(req): Json<VolumeRequest>,
) -> ApiResult<f32> {
    if !req.volume.is_finite() {
        return (StatusCode::BAD_REQUEST, Json(ApiResponse::error("volume must be a number")));
    }
    if state.session.set_volume(&stem, req.volume) {
        let volume = state.session.mixer().volume(&stem).unwrap_or(req.volume);
        (StatusCode::OK, Json(ApiResponse::ok(volume)))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("no active channel for stem '{}'", stem))),
        )
    }
}

/// Probe the backend's health endpoint
pub async fn get_health(State(state): State<Arc<AppState>>) -> ApiResult<HealthReport> {
    match state.health.check().await {
        Ok(report) => (StatusCode::OK, Json(ApiResponse::ok(report))),
        Err(e) => {
            let err = Error::from(e);
            (StatusCode::BAD_GATEWAY, Json(ApiResponse::failure(&err)))
        }
    }
}
