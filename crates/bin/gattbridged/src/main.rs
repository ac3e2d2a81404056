//! # gattbridged — BLE bridge daemon
//!
//! Composition root that wires all adapters together and runs the bridge.
//!
//! ## Responsibilities
//! - Parse configuration (optional path argument, TOML file, env overrides)
//! - Initialize tracing
//! - Construct the btleplug central and the in-process data-model server
//! - Spawn the bridge loop and register the configured devices
//! - Start the out-of-band TCP listener and the HTTP API
//! - Run until ctrl-c, then drain the bridge so links are released cleanly
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It is the wiring layer — no bridge logic belongs here.

mod config;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use gattbridge_adapter_btleplug::BtleplugCentral;
use gattbridge_adapter_http_axum::router;
use gattbridge_adapter_http_axum::state::AppState;
use gattbridge_adapter_oob_tcp::OobTcpServer;
use gattbridge_app::bridge::Bridge;
use gattbridge_app::data_model::InProcessDataModel;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load(std::env::args().nth(1).as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.logging.filter))
        .init();

    // Central + data model
    let (central_tx, central_rx) = mpsc::unbounded_channel();
    let central = BtleplugCentral::create(central_tx, config.ble.known_peers.clone()).await?;
    let server = Arc::new(InProcessDataModel::new(config.data_model.max_dynamic_endpoints));

    // Bridge loop
    let (bridge, handle) = Bridge::new(
        Arc::new(central),
        Arc::clone(&server),
        central_rx,
        config.bridge_config(),
    );
    let bridge_task = tokio::spawn(bridge.run());

    // Devices
    for spec in config.device_specs() {
        let name = spec.name().to_owned();
        match handle.add_device(spec).await {
            Ok(endpoint) => tracing::info!(%endpoint, name = %name, "device registered"),
            Err(err) => tracing::error!(%err, name = %name, "device rejected"),
        }
    }

    // Out-of-band channel
    let oob = OobTcpServer::bind(config.oob.bind.as_str(), handle.clone()).await?;
    tracing::info!(addr = %config.oob.bind, "out-of-band exchange listening");
    tokio::spawn(oob.run());

    // HTTP
    let state = AppState::new(handle.clone(), server);
    let app = router::build(state);
    let listener = tokio::net::TcpListener::bind(config.http.bind.as_str()).await?;
    tracing::info!(addr = %config.http.bind, "http api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Shutdown: disconnect every peripheral and stop the loop before exit.
    tracing::info!("shutting down");
    if let Err(err) = handle.shutdown().await {
        tracing::warn!(%err, "bridge loop already stopped");
    }
    let _ = bridge_task.await;

    Ok(())
}
