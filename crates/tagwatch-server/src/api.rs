//! HTTP API routes and handlers.
//!
//! - `devices` - Discovery, links and per-tag settings
//! - `alarm` - Lost-link alarm policy and phone network state
//! - `health` - Service health checks
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::{get, post, put};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::SharedState;

pub mod alarm;
pub mod devices;
pub mod error;
pub mod health;
pub mod openapi;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                     - Health check
/// /api
/// ├── /devices                - Known tags, links, ring/silence, settings
/// ├── /scan                   - Discovery sweep
/// ├── /alarm-policy           - Lost-link alarm policy
/// ├── /network                - Phone network state
/// └── /openapi.json           - OpenAPI specification
/// /swagger-ui                 - Interactive docs
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .nest("/devices", devices::router())
                .route("/scan", post(devices::start_scan))
                .nest("/alarm-policy", alarm::router())
                .route("/network", put(alarm::set_network_mode))
                .route("/openapi.json", get(openapi::get_openapi_spec)),
        )
        .with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::json;
    use tagwatch_core::{
        event_channel, Address, AlarmConfig, Collaborators, ConnectionState, DeviceRecord,
        DeviceRegistry, DisplayState, Engine, EngineHandle, HealthResponse,
        MemoryDeviceStore, MockTransport, RecordingAlarmSink, RecordingVerifier, StoredDevice,
    };
    use tempfile::TempDir;

    use super::devices::{CommandResponse, DeviceListResponse, ScanResponse};
    use super::*;
    use crate::config::ServerConfig;
    use crate::state::AppState;

    struct Harness {
        server: TestServer,
        engine: EngineHandle,
        transport: Arc<MockTransport>,
        state: SharedState,
    }

    fn addr(last: u8) -> Address {
        Address::parse(&format!("AA:BB:CC:DD:EE:{last:02X}")).unwrap()
    }

    fn stored(last: u8, nickname: &str) -> StoredDevice {
        StoredDevice {
            address: addr(last),
            nickname: nickname.into(),
            alarm_on_disconnect: true,
            ring_index: 0,
            image: None,
            rssi: None,
            last_seen: None,
        }
    }

    fn harness(devices: Vec<StoredDevice>, config_path: Option<std::path::PathBuf>) -> Harness {
        let mut config = ServerConfig::default();
        config.engine.scan.scan_on_start = false;

        let registry = Arc::new(DeviceRegistry::new(Arc::new(
            MemoryDeviceStore::with_devices(devices),
        )));
        registry.load_from_store().unwrap();

        let (tx, rx) = event_channel();
        let transport = Arc::new(MockTransport::with_events(tx));
        let collaborators = Collaborators {
            transport: transport.clone(),
            verifier: Arc::new(RecordingVerifier::new()),
            sink: Arc::new(RecordingAlarmSink::new()),
        };
        let (engine, handle) =
            Engine::new(config.engine.clone(), registry, collaborators, rx).unwrap();
        tokio::spawn(engine.run());

        let state = AppState::shared(handle.clone(), config, config_path);
        let server = TestServer::new(create_router(state.clone())).unwrap();
        Harness {
            server,
            engine: handle,
            transport,
            state,
        }
    }

    async fn wait_for(engine: &EngineHandle, address: &Address, wanted: ConnectionState) {
        let mut changes = engine.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.device(address).unwrap().connection_state != wanted {
                changes.changed().await.unwrap();
            }
        })
        .await
        .expect("tag reached the expected state");
    }

    #[tokio::test]
    async fn test_health_counts_tags() {
        let h = harness(vec![stored(1, "Keys"), stored(2, "Wallet")], None);

        let response = h.server.get("/health").await;
        response.assert_status_ok();
        let body: HealthResponse = response.json();
        assert_eq!(body.status, "ok");
        assert_eq!(body.devices, 2);
        assert_eq!(body.ready, 0);
    }

    #[tokio::test]
    async fn test_list_and_get_devices() {
        let h = harness(vec![stored(1, "Keys")], None);

        let list: DeviceListResponse = h.server.get("/api/devices").await.json();
        assert_eq!(list.count, 1);
        assert_eq!(list.devices[0].nickname, "Keys");

        let device: DeviceRecord = h.server.get("/api/devices/aa:bb:cc:dd:ee:01").await.json();
        assert_eq!(device.address, addr(1));
        assert!(device.is_mine);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_addresses() {
        let h = harness(Vec::new(), None);

        let response = h.server.get("/api/devices/AA:BB:CC:DD:EE:09").await;
        response.assert_status(StatusCode::NOT_FOUND);
        let body: ErrorResponse = response.json();
        assert_eq!(body.error, "UNKNOWN_DEVICE");

        let response = h.server.post("/api/devices/nope/connect").await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: ErrorResponse = response.json();
        assert_eq!(body.error, "INVALID_ADDRESS");
    }

    #[tokio::test]
    async fn test_connect_then_ring_and_silence() {
        let h = harness(vec![stored(1, "Keys")], None);

        let response = h.server.post("/api/devices/AA:BB:CC:DD:EE:01/connect").await;
        response.assert_status_ok();
        let body: CommandResponse = response.json();
        assert!(body.success);
        wait_for(&h.engine, &addr(1), ConnectionState::Ready).await;

        h.server
            .post("/api/devices/AA:BB:CC:DD:EE:01/ring")
            .await
            .assert_status_ok();
        let mut changes = h.engine.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.engine.device(&addr(1)).unwrap().display_state != DisplayState::Ringing {
                changes.changed().await.unwrap();
            }
        })
        .await
        .expect("tag rings");
        assert!(h.transport.writes(&addr(1)).iter().any(|(_, value)| value == &[1]));

        h.server
            .post("/api/devices/AA:BB:CC:DD:EE:01/silence")
            .await
            .assert_status_ok();
    }

    #[tokio::test]
    async fn test_ring_requires_ready_link() {
        let h = harness(vec![stored(1, "Keys")], None);

        let response = h.server.post("/api/devices/AA:BB:CC:DD:EE:01/ring").await;
        response.assert_status(StatusCode::CONFLICT);
        let body: ErrorResponse = response.json();
        assert_eq!(body.error, "DEVICE_NOT_READY");
        assert_eq!(
            body.details,
            Some(json!({ "connection_state": "Disconnected" }))
        );
    }

    #[tokio::test]
    async fn test_disconnect_and_remove() {
        let h = harness(vec![stored(1, "Keys")], None);

        h.server
            .post("/api/devices/AA:BB:CC:DD:EE:01/connect")
            .await
            .assert_status_ok();
        wait_for(&h.engine, &addr(1), ConnectionState::Ready).await;

        h.server
            .post("/api/devices/AA:BB:CC:DD:EE:01/disconnect")
            .await
            .assert_status_ok();
        assert_eq!(
            h.engine.device(&addr(1)).unwrap().connection_state,
            ConnectionState::Disconnected
        );
        assert!(!h.transport.has_session(&addr(1)));

        h.server
            .delete("/api/devices/AA:BB:CC:DD:EE:01")
            .await
            .assert_status_ok();
        h.server
            .get("/api/devices/AA:BB:CC:DD:EE:01")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_settings() {
        let h = harness(vec![stored(1, "Keys")], None);

        let response = h
            .server
            .put("/api/devices/AA:BB:CC:DD:EE:01/settings")
            .json(&json!({ "nickname": "Bike", "alarm_on_disconnect": false, "ring_index": 3 }))
            .await;
        response.assert_status_ok();
        let device: DeviceRecord = response.json();
        assert_eq!(device.nickname, "Bike");
        assert!(!device.alarm_on_disconnect);
        assert_eq!(device.ring_index, 3);

        h.server
            .put("/api/devices/AA:BB:CC:DD:EE:01/settings")
            .json(&json!({ "nickname": "" }))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_scan_reports_running_sweep() {
        let h = harness(Vec::new(), None);

        let first: ScanResponse = h.server.post("/api/scan").await.json();
        assert!(first.started);
        let second: ScanResponse = h.server.post("/api/scan").await.json();
        assert!(!second.started);
    }

    #[tokio::test]
    async fn test_alarm_policy_round_trip_is_saved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let h = harness(Vec::new(), Some(path.clone()));

        let policy: AlarmConfig = h.server.get("/api/alarm-policy").await.json();
        assert_eq!(policy, AlarmConfig::default());

        let update = json!({
            "silence_on_wifi": true,
            "quiet_hours": { "start": "22:00", "end": "07:00" },
            "timezone": "Europe/Berlin"
        });
        h.server
            .put("/api/alarm-policy")
            .json(&update)
            .await
            .assert_status_ok();

        let policy: AlarmConfig = h.server.get("/api/alarm-policy").await.json();
        assert!(policy.silence_on_wifi);
        assert_eq!(policy.timezone, "Europe/Berlin");
        assert_eq!(h.state.read().await.config.engine.alarm, policy);

        let saved = ServerConfig::load(&path).unwrap();
        assert_eq!(saved.engine.alarm, policy);
    }

    #[tokio::test]
    async fn test_invalid_alarm_policy_rejected() {
        let h = harness(Vec::new(), None);

        let response = h
            .server
            .put("/api/alarm-policy")
            .json(&json!({ "silence_on_wifi": false, "timezone": "Mars/Olympus" }))
            .await;
        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        let body: ErrorResponse = response.json();
        assert_eq!(body.error, "CONFIG_VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_network_mode() {
        let h = harness(Vec::new(), None);

        let response = h
            .server
            .put("/api/network")
            .json(&json!({ "mode": "wifi" }))
            .await;
        response.assert_status_ok();
        assert_eq!(response.json::<serde_json::Value>(), json!({ "mode": "wifi" }));

        h.server
            .put("/api/network")
            .json(&json!({ "mode": "satellite" }))
            .await
            .assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_openapi_served() {
        let h = harness(Vec::new(), None);

        let spec: serde_json::Value = h.server.get("/api/openapi.json").await.json();
        assert_eq!(spec["info"]["title"], "tagwatch API");
        assert!(spec["paths"]["/api/scan"].is_object());
    }
}
