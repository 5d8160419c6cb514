//! Alarm policy and network state endpoints.

use axum::extract::State;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tagwatch_core::{AlarmConfig, NetworkMode};
use tracing::info;
use utoipa::ToSchema;

use crate::api::error::{ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Creates the alarm policy router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(get_alarm_policy).put(update_alarm_policy))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Report of the phone's current connectivity.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "mode": "wifi" }))]
pub struct NetworkModeRequest {
    /// Current network.
    pub mode: NetworkMode,
}

/// Acknowledged network change.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NetworkModeResponse {
    /// Network now used for alarm decisions.
    pub mode: NetworkMode,
}

// ============================================================================
// Handlers
// ============================================================================

/// Read the alarm policy.
#[utoipa::path(
    get,
    path = "/api/alarm-policy",
    tag = "alarm",
    operation_id = "getAlarmPolicy",
    summary = "Get the alarm policy",
    description = "Returns the settings that decide whether a lost link sounds the alarm.",
    responses(
        (status = 200, description = "Current policy", body = AlarmConfig),
        (status = 503, description = "Engine unavailable", body = ErrorResponse)
    )
)]
pub async fn get_alarm_policy(State(state): State<SharedState>) -> ApiResult<Json<AlarmConfig>> {
    let engine = state.read().await.engine.clone();
    let settings = engine.alarm_settings().await?;
    Ok(Json(AlarmConfig::from_settings(&settings)))
}

/// Replace the alarm policy.
#[utoipa::path(
    put,
    path = "/api/alarm-policy",
    tag = "alarm",
    operation_id = "updateAlarmPolicy",
    summary = "Update the alarm policy",
    description = "Replaces Wi-Fi silencing, quiet hours and timezone. Quiet hours use \
        `HH:MM`; an end earlier than the start wraps past midnight. The change applies \
        to the next lost link and is written to the config file.",
    request_body = AlarmConfig,
    responses(
        (status = 200, description = "Policy updated", body = AlarmConfig),
        (status = 422, description = "Invalid policy", body = ErrorResponse)
    )
)]
pub async fn update_alarm_policy(
    State(state): State<SharedState>,
    Json(request): Json<AlarmConfig>,
) -> ApiResult<Json<AlarmConfig>> {
    let settings = request.to_settings()?;

    let mut state = state.write().await;
    state.engine.set_alarm_settings(settings).await?;
    state.config.engine.alarm = request.clone();
    if let Some(path) = &state.config_path {
        state.config.save(path)?;
    }

    info!(
        silence_on_wifi = request.silence_on_wifi,
        quiet_hours = request.quiet_hours.is_some(),
        timezone = %request.timezone,
        "Alarm policy updated"
    );
    Ok(Json(request))
}

/// Report the phone's connectivity.
#[utoipa::path(
    put,
    path = "/api/network",
    tag = "alarm",
    operation_id = "setNetworkMode",
    summary = "Report network connectivity",
    description = "Tells the engine which network the phone is on. While on Wi-Fi, \
        lost links stay silent if the policy says so.",
    request_body = NetworkModeRequest,
    responses(
        (status = 200, description = "Network recorded", body = NetworkModeResponse),
        (status = 503, description = "Engine unavailable", body = ErrorResponse)
    )
)]
pub async fn set_network_mode(
    State(state): State<SharedState>,
    Json(request): Json<NetworkModeRequest>,
) -> ApiResult<Json<NetworkModeResponse>> {
    let engine = state.read().await.engine.clone();
    engine.set_network_mode(request.mode).await?;
    Ok(Json(NetworkModeResponse { mode: request.mode }))
}
