use std::path::PathBuf;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;

use warden_core::CoreError;
use warden_core::push::PushStatus;
use warden_core::supervisor::{ChannelSettings, ChannelStatus, StatusSummary};
use warden_model::ChannelName;

use crate::AppState;

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::UnknownChannel(_) => StatusCode::NOT_FOUND,
            CoreError::NotLive(_) | CoreError::TitleUnresolved(_) => StatusCode::CONFLICT,
            CoreError::CredentialRejected | CoreError::CredentialExpired => {
                StatusCode::UNAUTHORIZED
            }
            CoreError::RateLimited { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Transient(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

pub async fn get_roster(State(state): State<AppState>) -> Json<Vec<ChannelStatus>> {
    Json(state.supervisor.all_channel_status().await)
}

pub async fn set_roster(
    State(state): State<AppState>,
    Json(names): Json<Vec<String>>,
) -> Result<Json<Vec<ChannelName>>, ApiError> {
    Ok(Json(state.supervisor.set_roster(names).await?))
}

pub async fn get_channel_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ChannelStatus>, ApiError> {
    let name = ChannelName::new(name);
    state
        .supervisor
        .channel_status(&name)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("unknown channel: {name}")))
}

pub async fn set_channel_settings(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(settings): Json<ChannelSettings>,
) -> Result<Json<ChannelStatus>, ApiError> {
    let name = ChannelName::new(name);
    Ok(Json(
        state.supervisor.set_channel_settings(&name, settings).await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct DownloadsEnabledBody {
    pub enabled: bool,
}

pub async fn set_downloads_enabled(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<DownloadsEnabledBody>,
) -> Result<Json<ChannelStatus>, ApiError> {
    let name = ChannelName::new(name);
    Ok(Json(
        state
            .supervisor
            .set_downloads_enabled(&name, body.enabled)
            .await?,
    ))
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub async fn start_recording(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<StartResponse>, ApiError> {
    let name = ChannelName::new(name);
    match state.supervisor.start_recording(&name).await {
        Ok(()) => Ok(Json(StartResponse {
            started: true,
            reason: None,
        })),
        // A cooldown rejection is a quiet no-op, not an error.
        Err(CoreError::Cooldown(_)) => Ok(Json(StartResponse {
            started: false,
            reason: Some("cooldown".into()),
        })),
        Err(err) => Err(err.into()),
    }
}

pub async fn stop_recording(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<serde_json::Value> {
    let name = ChannelName::new(name);
    let stopped = state.supervisor.stop_recording(&name).await;
    Json(json!({ "stopped": stopped }))
}

pub async fn get_storage_path(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "path": state.supervisor.storage_root().await }))
}

#[derive(Debug, Deserialize)]
pub struct StoragePathBody {
    pub path: PathBuf,
}

pub async fn set_storage_path(
    State(state): State<AppState>,
    Json(body): Json<StoragePathBody>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.set_storage_root(body.path).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn status_summary(State(state): State<AppState>) -> Json<StatusSummary> {
    Json(state.supervisor.status_summary().await)
}

pub async fn push_debug(State(state): State<AppState>) -> Result<Json<PushStatus>, ApiError> {
    Ok(Json(state.supervisor.push_debug().await?))
}

pub async fn push_reconnect(State(state): State<AppState>) -> StatusCode {
    state.supervisor.push_reconnect().await;
    StatusCode::ACCEPTED
}
