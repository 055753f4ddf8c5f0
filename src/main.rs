use std::sync::Arc;

use serde_json::Value;
use tracing_subscriber::EnvFilter;

use driver_sync::alert::LogOutputs;
use driver_sync::api;
use driver_sync::backend::memory::MemoryBackend;
use driver_sync::backend::{Backend, DRIVERS_TABLE, ORDERS_TABLE, row};
use driver_sync::config::Config;
use driver_sync::engine::realtime::{run_fleet_feed, run_order_feed, run_refresh_loop};
use driver_sync::error::AppError;
use driver_sync::finalize::notify::LogLinkOpener;
use driver_sync::state::AppState;
use driver_sync::store::LocalStore;
use driver_sync::tracking::location::PushLocationProvider;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let store = LocalStore::open(&config.store_path, config.recent_receivers_limit);
    let backend = Arc::new(MemoryBackend::new(config.event_buffer_size));
    let location = Arc::new(PushLocationProvider::new(true));

    let shared_state = Arc::new(AppState::new(
        config.clone(),
        backend.clone(),
        location.clone(),
        Arc::new(LogOutputs),
        Arc::new(LogLinkOpener),
        store,
    ));
    let driver_id = shared_state.driver_id;

    if let Err(err) = shared_state.store.set_driver_id(Some(driver_id)) {
        tracing::warn!(error = %err, "could not persist driver id");
    }
    backend.seed(
        DRIVERS_TABLE,
        vec![row([
            ("id", Value::from(driver_id.0)),
            ("name", Value::from(format!("Driver {driver_id}"))),
        ])],
    );

    tokio::spawn(run_order_feed(
        shared_state.clone(),
        backend.subscribe(ORDERS_TABLE),
    ));
    tokio::spawn(run_fleet_feed(
        shared_state.clone(),
        backend.subscribe(DRIVERS_TABLE),
    ));
    tokio::spawn(run_refresh_loop(shared_state.clone()));

    let watch = shared_state.reporter.start(location).await;
    tracing::info!(driver_id = %driver_id, outcome = ?watch, "position reporter ready");

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, driver_id = %driver_id, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
