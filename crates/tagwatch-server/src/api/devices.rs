//! Tag management API endpoints.
//!
//! Listing and reading go straight to the registry snapshot. Everything that
//! touches a link is a command to the engine, answered once the engine has
//! taken it (not once the radio has finished).

use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tagwatch_core::{Address, AlarmCommand, DeviceRecord, EngineHandle, SettingsUpdate};
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::state::SharedState;

const MAX_NICKNAME_LEN: usize = 32;

/// Creates the devices router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_devices))
        .route("/{address}", get(get_device).delete(remove_device))
        .route("/{address}/connect", post(connect_device))
        .route("/{address}/disconnect", post(disconnect_device))
        .route("/{address}/ring", post(ring_device))
        .route("/{address}/silence", post(silence_device))
        .route("/{address}/settings", put(update_settings))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Every known tag.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeviceListResponse {
    /// Tags sorted by address.
    pub devices: Vec<DeviceRecord>,

    /// Number of tags.
    #[schema(example = 2)]
    pub count: usize,
}

/// Acknowledgement of a link command.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "success": true,
    "address": "AA:BB:CC:DD:EE:FF",
    "message": "Connecting"
}))]
pub struct CommandResponse {
    /// Whether the engine accepted the command.
    pub success: bool,

    /// Target tag.
    pub address: Address,

    /// What happens next.
    #[schema(example = "Connecting")]
    pub message: String,
}

/// Partial update of a tag's user settings.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[schema(example = json!({
    "nickname": "Keys",
    "alarm_on_disconnect": true,
    "ring_index": 2
}))]
pub struct UpdateSettingsRequest {
    /// New display name (1-32 characters).
    #[schema(example = "Keys")]
    pub nickname: Option<String>,

    /// Sound the phone alarm when this tag's link drops.
    pub alarm_on_disconnect: Option<bool>,

    /// Alert sound index.
    #[schema(example = 2)]
    pub ring_index: Option<u8>,

    /// Picture reference. An empty string clears it.
    pub image: Option<String>,
}

/// Result of a scan request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ScanResponse {
    /// Whether a new sweep was scheduled.
    #[schema(example = true)]
    pub started: bool,
}

impl UpdateSettingsRequest {
    fn into_update(self) -> ApiResult<SettingsUpdate> {
        let nickname = match self.nickname.map(|n| n.trim().to_string()) {
            Some(n) if n.is_empty() || n.chars().count() > MAX_NICKNAME_LEN => {
                return Err(ApiError::bad_request(
                    "INVALID_NICKNAME",
                    format!("Nickname must be 1-{MAX_NICKNAME_LEN} characters"),
                ));
            }
            other => other,
        };
        Ok(SettingsUpdate {
            nickname,
            alarm_on_disconnect: self.alarm_on_disconnect,
            ring_index: self.ring_index,
            image: self.image.map(|i| Some(i).filter(|i| !i.is_empty())),
        })
    }
}

// ============================================================================
// Handlers
// ============================================================================

fn parse_address(raw: &str) -> ApiResult<Address> {
    Ok(Address::parse(raw)?)
}

async fn engine(state: &SharedState) -> EngineHandle {
    state.read().await.engine.clone()
}

fn accepted(address: Address, message: &str) -> Json<CommandResponse> {
    Json(CommandResponse {
        success: true,
        address,
        message: message.to_string(),
    })
}

/// List all tags.
#[utoipa::path(
    get,
    path = "/api/devices",
    tag = "devices",
    operation_id = "listDevices",
    summary = "List known tags",
    description = "Returns every tag in the registry: claimed tags and tags seen by \
        the last discovery sweep.",
    responses(
        (status = 200, description = "Tags listed", body = DeviceListResponse)
    )
)]
pub async fn list_devices(State(state): State<SharedState>) -> Json<DeviceListResponse> {
    let devices = engine(&state).await.devices();
    Json(DeviceListResponse {
        count: devices.len(),
        devices,
    })
}

/// Get one tag.
#[utoipa::path(
    get,
    path = "/api/devices/{address}",
    tag = "devices",
    operation_id = "getDevice",
    summary = "Get a tag",
    params(("address" = String, Path, description = "Tag address", example = "AA:BB:CC:DD:EE:FF")),
    responses(
        (status = 200, description = "Tag found", body = DeviceRecord),
        (status = 400, description = "Malformed address", body = ErrorResponse),
        (status = 404, description = "Unknown tag", body = ErrorResponse)
    )
)]
pub async fn get_device(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<Json<DeviceRecord>> {
    let address = parse_address(&address)?;
    Ok(Json(engine(&state).await.device(&address)?))
}

/// Forget a tag.
#[utoipa::path(
    delete,
    path = "/api/devices/{address}",
    tag = "devices",
    operation_id = "removeDevice",
    summary = "Forget a tag",
    description = "Tears down any link and deletes the tag and its stored copy.",
    params(("address" = String, Path, description = "Tag address")),
    responses(
        (status = 200, description = "Tag removed", body = CommandResponse),
        (status = 404, description = "Unknown tag", body = ErrorResponse)
    )
)]
pub async fn remove_device(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<Json<CommandResponse>> {
    let address = parse_address(&address)?;
    engine(&state).await.remove(address.clone()).await?;
    Ok(accepted(address, "Removed"))
}

/// Connect to a tag.
#[utoipa::path(
    post,
    path = "/api/devices/{address}/connect",
    tag = "devices",
    operation_id = "connectDevice",
    summary = "Connect to a tag",
    description = "Starts a link and refills the reconnect budget. A tag that is \
        already connecting or connected is left alone.",
    params(("address" = String, Path, description = "Tag address")),
    responses(
        (status = 200, description = "Connect started", body = CommandResponse),
        (status = 404, description = "Unknown tag", body = ErrorResponse),
        (status = 503, description = "Engine unavailable", body = ErrorResponse)
    )
)]
pub async fn connect_device(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<Json<CommandResponse>> {
    let address = parse_address(&address)?;
    engine(&state).await.connect(address.clone()).await?;
    Ok(accepted(address, "Connecting"))
}

/// Disconnect from a tag.
#[utoipa::path(
    post,
    path = "/api/devices/{address}/disconnect",
    tag = "devices",
    operation_id = "disconnectDevice",
    summary = "Disconnect from a tag",
    description = "Drops the link without reconnecting or sounding the alarm.",
    params(("address" = String, Path, description = "Tag address")),
    responses(
        (status = 200, description = "Disconnected", body = CommandResponse),
        (status = 404, description = "Unknown tag", body = ErrorResponse)
    )
)]
pub async fn disconnect_device(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<Json<CommandResponse>> {
    let address = parse_address(&address)?;
    engine(&state).await.disconnect(address.clone()).await?;
    Ok(accepted(address, "Disconnected"))
}

/// Make a tag ring.
#[utoipa::path(
    post,
    path = "/api/devices/{address}/ring",
    tag = "devices",
    operation_id = "ringDevice",
    summary = "Ring a tag",
    params(("address" = String, Path, description = "Tag address")),
    responses(
        (status = 200, description = "Ring queued", body = CommandResponse),
        (status = 404, description = "Unknown tag", body = ErrorResponse),
        (status = 409, description = "Tag not ready", body = ErrorResponse)
    )
)]
pub async fn ring_device(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<Json<CommandResponse>> {
    let address = parse_address(&address)?;
    engine(&state)
        .await
        .write(address.clone(), AlarmCommand::Ring)
        .await?;
    Ok(accepted(address, "Ring queued"))
}

/// Silence a ringing tag.
#[utoipa::path(
    post,
    path = "/api/devices/{address}/silence",
    tag = "devices",
    operation_id = "silenceDevice",
    summary = "Silence a tag",
    params(("address" = String, Path, description = "Tag address")),
    responses(
        (status = 200, description = "Silence queued", body = CommandResponse),
        (status = 404, description = "Unknown tag", body = ErrorResponse),
        (status = 409, description = "Tag not ready", body = ErrorResponse)
    )
)]
pub async fn silence_device(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<Json<CommandResponse>> {
    let address = parse_address(&address)?;
    engine(&state)
        .await
        .write(address.clone(), AlarmCommand::Silence)
        .await?;
    Ok(accepted(address, "Silence queued"))
}

/// Update a tag's user settings.
#[utoipa::path(
    put,
    path = "/api/devices/{address}/settings",
    tag = "devices",
    operation_id = "updateDeviceSettings",
    summary = "Update tag settings",
    description = "Changes nickname, alarm-on-disconnect, ring sound or picture. \
        Claimed tags are saved immediately; a ready tag is told about the new \
        alarm-on-disconnect setting.",
    params(("address" = String, Path, description = "Tag address")),
    request_body = UpdateSettingsRequest,
    responses(
        (status = 200, description = "Settings updated", body = DeviceRecord),
        (status = 400, description = "Invalid settings", body = ErrorResponse),
        (status = 404, description = "Unknown tag", body = ErrorResponse)
    )
)]
pub async fn update_settings(
    State(state): State<SharedState>,
    Path(address): Path<String>,
    Json(request): Json<UpdateSettingsRequest>,
) -> ApiResult<Json<DeviceRecord>> {
    let address = parse_address(&address)?;
    let update = request.into_update()?;
    let engine = engine(&state).await;
    engine.update_settings(address.clone(), update).await?;
    Ok(Json(engine.device(&address)?))
}

/// Start a discovery sweep.
#[utoipa::path(
    post,
    path = "/api/scan",
    tag = "devices",
    operation_id = "startScan",
    summary = "Start a discovery sweep",
    description = "Clears tags seen by the previous sweep and scans for tags for the \
        configured window. Claimed tags that show up are connected automatically. \
        `started` is false when a sweep is already running.",
    responses(
        (status = 200, description = "Sweep requested", body = ScanResponse),
        (status = 503, description = "Engine unavailable", body = ErrorResponse)
    )
)]
pub async fn start_scan(State(state): State<SharedState>) -> ApiResult<Json<ScanResponse>> {
    let started = engine(&state).await.scan().await?;
    Ok(Json(ScanResponse { started }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_request_validation() {
        let blank = UpdateSettingsRequest {
            nickname: Some("   ".into()),
            ..UpdateSettingsRequest::default()
        };
        assert!(blank.into_update().is_err());

        let long = UpdateSettingsRequest {
            nickname: Some("x".repeat(33)),
            ..UpdateSettingsRequest::default()
        };
        assert!(long.into_update().is_err());

        let update = UpdateSettingsRequest {
            nickname: Some(" Keys ".into()),
            image: Some(String::new()),
            ..UpdateSettingsRequest::default()
        }
        .into_update()
        .unwrap();
        assert_eq!(update.nickname.as_deref(), Some("Keys"));
        assert_eq!(update.image, Some(None));
    }

    #[test]
    fn test_parse_address_rejects_garbage() {
        assert!(parse_address("not-an-address").is_err());
        assert_eq!(
            parse_address("aa:bb:cc:dd:ee:ff").unwrap().as_str(),
            "AA:BB:CC:DD:EE:FF"
        );
    }
}
