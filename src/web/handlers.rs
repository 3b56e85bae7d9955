//! HTTP request handlers.

use super::AppState;
use crate::scheduler::{emit, EventLog, MonitoringPolicy};
use crate::storage::{decode_nodes, DeviceCredentials, LogLevel, StorageError};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

const DEFAULT_LOG_LIMIT: usize = 200;
const MAX_LOG_LIMIT: usize = 1000;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum ApiError {
    /// Malformed request payload
    #[error("{0}")]
    BadRequest(String),

    /// Storage collaborator failure
    #[error("{context}: {source}")]
    Storage {
        context: &'static str,
        #[source]
        source: StorageError,
    },
}

impl ApiError {
    fn invalid_json() -> Self {
        ApiError::BadRequest("invalid json".to_string())
    }

    fn storage(context: &'static str) -> impl FnOnce(StorageError) -> Self {
        move |source| ApiError::Storage { context, source }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message returned to the client; storage details stay in the server log.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::BadRequest(message) => message.clone(),
            ApiError::Storage { context, .. } => context.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Storage { .. } => tracing::error!("Request failed: {}", self),
            ApiError::BadRequest(_) => tracing::debug!("Client error: {}", self),
        }
        (self.status_code(), self.user_message()).into_response()
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn record(state: &AppState, level: LogLevel, source: &str, message: &str) {
    let log: &dyn EventLog = state.logs.as_ref();
    emit(Some(log), level, source, message);
}

// ============================================================================
// Health
// ============================================================================

pub async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "time": now_rfc3339() }))
}

// ============================================================================
// Board
// ============================================================================

pub async fn handle_get_board(State(state): State<AppState>) -> Result<Response, ApiError> {
    let bytes = state
        .board
        .load()
        .map_err(ApiError::storage("failed to read board file"))?;
    state.apply_board(&bytes).await;

    Ok(([(header::CONTENT_TYPE, "application/json; charset=utf-8")], bytes).into_response())
}

pub async fn handle_save_board(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    if serde_json::from_slice::<serde_json::Value>(&body).is_err() {
        return Err(ApiError::invalid_json());
    }
    state
        .board
        .save(&body)
        .map_err(ApiError::storage("failed to write board file"))?;
    state.apply_board(&body).await;

    Ok(Json(json!({
        "status": "saved",
        "path": state.board.path().display().to_string(),
    }))
    .into_response())
}

// ============================================================================
// Status
// ============================================================================

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let results = state.reachability.results().await;
    Json(json!({ "updatedAt": now_rfc3339(), "results": results }))
}

pub async fn handle_connect_status(State(state): State<AppState>) -> impl IntoResponse {
    let results = state.liveness.results().await;
    Json(json!({ "updatedAt": now_rfc3339(), "results": results }))
}

// ============================================================================
// Logs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<String>,
}

pub async fn handle_logs(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> impl IntoResponse {
    let limit = query
        .limit
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|n| (1..=MAX_LOG_LIMIT).contains(n))
        .unwrap_or(DEFAULT_LOG_LIMIT);

    Json(json!({ "items": state.logs.list(limit) }))
}

// ============================================================================
// Monitoring
// ============================================================================

pub async fn handle_get_monitoring(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.reachability.policy().await)
}

pub async fn handle_set_monitoring(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let policy: MonitoringPolicy = serde_json::from_slice(&body).map_err(|_| ApiError::invalid_json())?;
    state.reachability.set_policy(policy).await;

    Ok(Json(state.reachability.policy().await).into_response())
}

pub async fn handle_monitoring_nodes(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let payload: serde_json::Value = serde_json::from_slice(&body).map_err(|_| ApiError::invalid_json())?;
    let devices = decode_nodes(payload.get("nodes"));
    state.apply_devices(devices).await;

    Ok(Json(json!({ "status": "ok" })).into_response())
}

// ============================================================================
// Device settings
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct DeviceSettingsQuery {
    pub detect: Option<String>,
    pub force: Option<String>,
}

impl DeviceSettingsQuery {
    fn detect(&self) -> bool {
        self.detect.as_deref() == Some("1")
    }

    fn force(&self) -> bool {
        self.force.as_deref() == Some("1")
    }
}

/// Detect the link speed and store a positive reading on `settings`.
/// Returns whether `settings` changed.
async fn detect_link_speed(state: &AppState, id: &str, settings: &mut DeviceCredentials) -> bool {
    let detected = state.link_speed.detect(settings).await;
    match detected {
        Ok(speed) if speed.mbps > 0 => {
            settings.link_speed_mbps = i64::from(speed.mbps);
            record(
                state,
                LogLevel::Info,
                "ssh",
                &format!("link speed {} Mbps detected for {} ({})", speed.mbps, id, speed.interface),
            );
            true
        }
        Ok(_) => false,
        Err(e) => {
            record(state, LogLevel::Warn, "ssh", &format!("ethtool failed for {}: {}", id, e));
            false
        }
    }
}

fn record_detection_skipped(state: &AppState, id: &str, os: &str) {
    record(
        state,
        LogLevel::Info,
        "ssh",
        &format!("link speed detection skipped for {} (os={})", id, os),
    );
}

pub async fn handle_get_device_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeviceSettingsQuery>,
) -> Result<Response, ApiError> {
    let stored = state
        .secrets
        .get(&id)
        .map_err(ApiError::storage("failed to read device settings"))?;

    let Some(mut settings) = stored else {
        return Ok(Json(json!({ "exists": false, "settings": DeviceCredentials::default() })).into_response());
    };

    if query.detect() && settings.connect_enabled {
        if settings.os != "linux" {
            record_detection_skipped(&state, &id, &settings.os);
        } else if settings.link_speed_mbps == 0 || query.force() {
            record(&state, LogLevel::Info, "ssh", &format!("auto-detect link speed for {}", id));
            if detect_link_speed(&state, &id, &mut settings).await {
                if let Err(e) = state.secrets.set(&id, &settings) {
                    tracing::warn!("Failed to store detected link speed for {}: {}", id, e);
                }
            }
        }
    }

    Ok(Json(json!({ "exists": true, "settings": settings })).into_response())
}

pub async fn handle_save_device_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let settings: DeviceCredentials = serde_json::from_slice(&body).map_err(|_| ApiError::invalid_json())?;

    let previous = match state.secrets.get(&id) {
        Ok(previous) => previous,
        Err(e) => {
            record(
                &state,
                LogLevel::Warn,
                "settings",
                &format!("failed to read previous settings for {}: {}", id, e),
            );
            None
        }
    };

    let mut settings = settings.sanitize();
    record(
        &state,
        LogLevel::Info,
        "settings",
        &format!(
            "settings received for {} (connect={} os={} host={})",
            id, settings.connect_enabled, settings.os, settings.host
        ),
    );

    if settings.connect_enabled {
        if settings.os == "linux" {
            detect_link_speed(&state, &id, &mut settings).await;
        } else {
            record_detection_skipped(&state, &id, &settings.os);
        }
    }

    state
        .secrets
        .set(&id, &settings)
        .map_err(ApiError::storage("failed to save device settings"))?;

    let was_enabled = previous.map(|p| p.connect_enabled).unwrap_or(false);
    if was_enabled != settings.connect_enabled {
        let action = if settings.connect_enabled { "enabled" } else { "disabled" };
        record(&state, LogLevel::Info, "ssh", &format!("SSH connection {} for {}", action, id));
    }
    if settings.connect_enabled {
        let host = if settings.host.is_empty() { "unset" } else { settings.host.as_str() };
        let user = if settings.username.is_empty() { "unset" } else { settings.username.as_str() };
        record(
            &state,
            LogLevel::Info,
            "ssh",
            &format!(
                "SSH settings saved for {} (host={} port={} user={})",
                id,
                host,
                settings.port_or_default(),
                user
            ),
        );
    }

    state.refresh_liveness().await;

    Ok(Json(json!({ "status": "saved", "settings": settings })).into_response())
}

pub async fn handle_delete_device_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state
        .secrets
        .delete(&id)
        .map_err(ApiError::storage("failed to delete device settings"))?;
    state.refresh_liveness().await;

    Ok(Json(json!({ "status": "deleted" })).into_response())
}
