pub mod config;
pub mod handlers;
pub mod health;

use axum::{routing::get, Router};
use event_bus::{Connector, InMemoryBroker, NatsConnector};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use config::{BusType, Config};
use health::{health, HealthState};

/// Broker implementation selected by `BUS_TYPE`
pub fn connector(config: &Config) -> Arc<dyn Connector> {
    match config.bus_type {
        BusType::InMemory => {
            tracing::info!("Using InMemory event bus");
            Arc::new(InMemoryBroker::new())
        }
        BusType::Nats => {
            let settings = config.nats_settings();
            tracing::info!(url = %settings.url(), vhost = %settings.vhost, "Using NATS event bus");
            Arc::new(NatsConnector::new(settings))
        }
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

/// Resolves on SIGINT (Ctrl-C) or SIGTERM
///
/// The SIGTERM handler is installed before this returns, so a stop request
/// that arrives before the future is first polled is not lost.
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            sigterm.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {
                tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
            }
            () = terminate => {
                tracing::info!("Received SIGTERM, starting graceful shutdown");
            }
        }
    })
}
