use anyhow::Context;
use event_bus::BrokerConnectionManager;
use event_consumer::spawn_consumers;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use notifications_rs::{
    config::Config,
    connector,
    handlers::{build_dispatcher, TracingSink},
    health::HealthState,
    router, shutdown_signal,
};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    tracing::info!("Starting notifications service...");

    let config = Config::from_env()
        .map_err(anyhow::Error::msg)
        .context("Failed to load configuration from environment")?;

    tracing::info!(
        bus_type = ?config.bus_type,
        exchange = %config.exchange,
        queue = %config.queue,
        patterns = ?config.binding_patterns,
        instances = config.consumer_instances,
        "Configuration loaded"
    );

    // Connecting is lazy; a broker outage at startup only delays the consumers
    let manager = BrokerConnectionManager::new(connector(&config), config.broker_settings());
    let dispatcher = Arc::new(build_dispatcher(Arc::new(TracingSink))?);
    let cancel = CancellationToken::new();

    let consumers = spawn_consumers(
        &manager,
        dispatcher,
        config.consumer_config()?,
        config.consumer_instances,
        &cancel,
    );

    let app = router(Arc::new(HealthState::new(manager.clone(), &consumers)));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.host, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Notifications service listening on {}", addr);

    let signal = shutdown_signal().context("Failed to install signal handlers")?;
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        signal.await;
        shutdown.cancel();
    });

    let server_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_cancel.cancelled().await })
        .await
        .context("Server failed")?;

    // In-flight handlers finish and settle their deliveries before the connection closes
    futures::future::join_all(consumers.into_iter().map(|c| c.join())).await;
    manager.shutdown().await;

    tracing::info!("Notifications service stopped");
    Ok(())
}
