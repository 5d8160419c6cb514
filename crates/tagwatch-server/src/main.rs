//! # tagwatch-server
//!
//! Runs the tag engine and serves its REST API.
//!
//! ## Running
//!
//! ```bash
//! # Development, without a Bluetooth adapter
//! cargo run --package tagwatch-server --no-default-features
//!
//! # Production
//! TAGWATCH_CONFIG=/etc/tagwatch/config.toml ./tagwatch-server
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use tagwatch_server::api::create_router;
use tagwatch_server::config::{config_path, ServerConfig};
use tagwatch_server::logging;
use tagwatch_server::runtime::build_engine;
use tagwatch_server::state::AppState;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path();
    let config = ServerConfig::load(&path)?;

    logging::init(config.production, &config.log_dir())?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        "Starting tagwatch-server"
    );

    let (engine, handle) = build_engine(&config).await?;
    let engine_task = tokio::spawn(engine.run());

    let listen = config.listen.clone();
    let state = AppState::shared(handle, config, Some(path));
    let app = create_router(state.clone());

    let listener = TcpListener::bind(&listen).await?;
    info!(address = %listen, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The engine stops once every handle is gone.
    drop(state);
    if let Err(e) = engine_task.await {
        warn!(error = %e, "Engine task ended abnormally");
    }
    info!("tagwatch-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown requested");
}
