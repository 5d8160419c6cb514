//! Application state shared across handlers.

use std::path::PathBuf;
use std::sync::Arc;

use tagwatch_core::EngineHandle;
use tokio::sync::RwLock;

use crate::config::ServerConfig;

/// Shared application state.
pub type SharedState = Arc<RwLock<AppState>>;

/// What handlers can reach.
#[derive(Debug)]
pub struct AppState {
    /// Front door to the tag engine.
    pub engine: EngineHandle,

    /// Loaded configuration, kept in sync with runtime changes.
    pub config: ServerConfig,

    /// Where changes to `config` are written back. `None` keeps them in memory.
    pub config_path: Option<PathBuf>,
}

impl AppState {
    /// Bundle state for the router.
    #[must_use]
    pub fn shared(engine: EngineHandle, config: ServerConfig, config_path: Option<PathBuf>) -> SharedState {
        Arc::new(RwLock::new(Self {
            engine,
            config,
            config_path,
        }))
    }
}
