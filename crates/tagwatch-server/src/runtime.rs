//! Wiring the engine to its collaborators.

use std::sync::Arc;

use tagwatch_core::{
    event_channel, Collaborators, DeviceRegistry, Engine, EngineHandle, EventSender,
    JsonDeviceStore, NoopVerifier, TagError, Transport, Verifier,
};
use tracing::info;

use crate::audio::LogAlarmSink;
use crate::config::ServerConfig;
use crate::verify::HttpVerifier;

/// Build the engine from configuration.
///
/// Claimed tags are loaded from the data directory. The radio is BlueZ when
/// the `bluetooth` feature is on, otherwise the scripted mock.
///
/// # Errors
///
/// Returns an error if the store cannot be read, the adapter is missing or
/// the configuration is invalid.
pub async fn build_engine(config: &ServerConfig) -> Result<(Engine, EngineHandle), TagError> {
    let data_dir = config.data_dir()?;
    let registry = Arc::new(DeviceRegistry::new(Arc::new(JsonDeviceStore::new(&data_dir))));
    let loaded = registry.load_from_store()?;
    info!(data_dir = %data_dir.display(), loaded, "Device store opened");

    let (events, receiver) = event_channel();
    let transport = transport(events).await?;

    let verifier: Arc<dyn Verifier> = match &config.verify_url {
        Some(url) => Arc::new(HttpVerifier::new(url)?),
        None => Arc::new(NoopVerifier),
    };

    let collaborators = Collaborators {
        transport,
        verifier,
        sink: Arc::new(LogAlarmSink::new()),
    };
    Engine::new(config.engine.clone(), registry, collaborators, receiver)
}

#[cfg(feature = "bluetooth")]
async fn transport(events: EventSender) -> Result<Arc<dyn Transport>, TagError> {
    let transport = tagwatch_core::transport::bluez::BluerTransport::new(events).await?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "bluetooth"))]
#[allow(clippy::unused_async)]
async fn transport(events: EventSender) -> Result<Arc<dyn Transport>, TagError> {
    tracing::warn!("Built without Bluetooth support, using the mock radio");
    Ok(Arc::new(tagwatch_core::MockTransport::with_events(events)))
}
