//! OpenAPI specification generation for the tagwatch API.
//!
//! The document is served at `/api/openapi.json`, rendered by Swagger UI and
//! written to the workspace root by the `gen-openapi` binary for client
//! generation.

use axum::Json;
use tagwatch_core::{
    Address, AlarmCommand, AlarmConfig, ConnectionState, DeviceRecord, DisplayState, HealthResponse,
    NetworkMode, QuietHoursConfig,
};
use utoipa::OpenApi;

use super::alarm::{NetworkModeRequest, NetworkModeResponse};
use super::devices::{
    CommandResponse, DeviceListResponse, ScanResponse, UpdateSettingsRequest,
};
use super::error::ErrorResponse;

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as a pretty-printed string.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for tagwatch.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "tagwatch API",
        version = "0.1.0",
        description = r#"
# tagwatch API

tagwatch keeps Bluetooth LE anti-lost tags connected and sounds an alarm when one
drops out of range.

## Overview

1. **Discovery**: `POST /api/scan` runs a short sweep. New tags appear as `found`;
   claimed tags that show up are connected automatically.
2. **Links**: connect, disconnect, ring and silence individual tags. A tag only
   accepts ring and silence once its link is `ready`.
3. **Alarm policy**: a lost link alarms unless the tag opted out, the phone is on
   Wi-Fi with Wi-Fi silencing on, or the local time is inside quiet hours.

Dropped links are retried with exponential backoff until the retry budget runs out.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local tagwatch server")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "devices", description = "Tag discovery, links and per-tag settings"),
        (name = "alarm", description = "Lost-link alarm policy and phone network state")
    ),
    paths(
        super::health::health_check,
        super::devices::list_devices,
        super::devices::get_device,
        super::devices::remove_device,
        super::devices::connect_device,
        super::devices::disconnect_device,
        super::devices::ring_device,
        super::devices::silence_device,
        super::devices::update_settings,
        super::devices::start_scan,
        super::alarm::get_alarm_policy,
        super::alarm::update_alarm_policy,
        super::alarm::set_network_mode,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            Address,
            DeviceRecord,
            ConnectionState,
            DisplayState,
            AlarmCommand,
            DeviceListResponse,
            CommandResponse,
            UpdateSettingsRequest,
            ScanResponse,
            AlarmConfig,
            QuietHoursConfig,
            NetworkMode,
            NetworkModeRequest,
            NetworkModeResponse,
        )
    )
)]
pub struct ApiDoc;
