use std::sync::Arc;

use axum::Router;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use fleet_tracker::api;
use fleet_tracker::config::{Config, Mode};
use fleet_tracker::engine::DriverController;
use fleet_tracker::error::AppError;
use fleet_tracker::fleet::{FleetDirectory, HttpFleetDirectory, StaticFleetDirectory};
use fleet_tracker::hub::{Hub, HubConfig};
use fleet_tracker::ingest;
use fleet_tracker::observability::metrics::Metrics;
use fleet_tracker::state::AppState;
use fleet_tracker::store::{GeoCommandService, MemoryStore, PoolConfig, StorePool, StoreTransport};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;
    init_tracing(&config);

    let metrics = Metrics::new();
    let store = GeoCommandService::new(store_transport(&config), metrics.clone());
    let controller = Arc::new(DriverController::new(store, fleet_directory(&config)?));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (hub, hub_task) = Hub::spawn(
        HubConfig {
            push_interval: config.push_interval,
            queue_size: config.viewer_queue_size,
        },
        controller.clone(),
        metrics.clone(),
        shutdown_rx.clone(),
    );

    if let Some(auth) = &config.auth_server_addr {
        tracing::info!(auth_server = %auth, "auth server configured; requests are not authenticated");
    }

    let state = Arc::new(AppState::new(
        controller.clone(),
        hub,
        config.clone(),
        metrics.clone(),
    ));

    let mut servers: Vec<JoinHandle<Result<(), AppError>>> = Vec::new();

    if config.runs(Mode::Http) {
        let app = api::rest::router(state.clone());
        servers.push(serve("http", &config.http_addr, app, shutdown_rx.clone()).await?);
    }

    if config.runs(Mode::Socket) {
        let app = api::socket::router(state.clone());
        servers.push(serve("socket", &config.socket_addr, app, shutdown_rx.clone()).await?);
    }

    let mut ingest_tasks = None;
    if config.runs(Mode::Udp) {
        let socket = UdpSocket::bind(&config.udp_addr).await.map_err(|err| {
            AppError::Internal(format!("failed to bind {}: {err}", config.udp_addr))
        })?;
        ingest_tasks = Some(ingest::spawn(
            socket,
            controller.clone(),
            metrics.clone(),
            shutdown_rx.clone(),
        ));
    }

    shutdown_signal().await;
    tracing::info!("shutdown requested");

    // The hub closes every viewer on the same signal, which lets the socket
    // listener drain its upgraded connections.
    let _ = shutdown_tx.send(true);

    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(error = %err, "listener failed"),
            Err(err) => tracing::error!(error = %err, "listener task panicked"),
        }
    }
    if let Some((listener, processor)) = ingest_tasks {
        let _ = listener.await;
        let _ = processor.await;
    }

    let _ = hub_task.await;

    tracing::info!("shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false);

    if config.log_format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn store_transport(config: &Config) -> Arc<dyn StoreTransport> {
    if config.uses_memory_store() {
        tracing::warn!("using in-process store; data is lost on exit");
        return Arc::new(MemoryStore::new());
    }

    tracing::info!(store_addr = %config.store_addr, max_idle = config.store_max_idle, "using remote store");
    Arc::new(StorePool::new(PoolConfig {
        addr: config.store_addr.clone(),
        password: config.store_password.clone(),
        max_idle: config.store_max_idle,
        idle_timeout: config.store_idle_timeout,
        timeout: config.store_timeout,
    }))
}

fn fleet_directory(config: &Config) -> Result<Arc<dyn FleetDirectory>, AppError> {
    if config.uses_static_fleet() {
        tracing::warn!("using static fleet directory; every driver gets the default assignment");
        return Ok(Arc::new(StaticFleetDirectory::new().with_fallback(1, 1, 1)));
    }

    tracing::info!(fleet_base_url = %config.fleet_base_url, "using fleet service");
    Ok(Arc::new(HttpFleetDirectory::new(
        &config.fleet_base_url,
        config.fleet_timeout,
    )?))
}

async fn serve(
    name: &'static str,
    addr: &str,
    app: Router,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<Result<(), AppError>>, AppError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {addr}: {err}")))?;
    tracing::info!(listener = name, addr = %addr, "listener started");

    Ok(tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(stopped(shutdown))
            .await
            .map_err(|err| AppError::Internal(format!("{name} server error: {err}")))
    }))
}

async fn stopped(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
