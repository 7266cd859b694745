use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use event_bus::BrokerConnectionManager;
use event_consumer::{ConsumerHandle, ConsumerHealth, ConsumerStats, StatsSnapshot};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

struct ConsumerProbe {
    instance: usize,
    health: watch::Receiver<ConsumerHealth>,
    stats: Arc<ConsumerStats>,
}

/// Read-only view of the broker connection and every consumer instance
pub struct HealthState {
    manager: BrokerConnectionManager,
    consumers: Vec<ConsumerProbe>,
    started_at: DateTime<Utc>,
}

impl HealthState {
    pub fn new(manager: BrokerConnectionManager, consumers: &[ConsumerHandle]) -> Self {
        Self {
            manager,
            consumers: consumers
                .iter()
                .map(|c| ConsumerProbe {
                    instance: c.instance,
                    health: c.health_receiver(),
                    stats: c.stats_handle(),
                })
                .collect(),
            started_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        !self.consumers.is_empty() && self.consumers.iter().all(|c| c.health.borrow().is_healthy())
    }

    pub fn report(&self) -> HealthReport {
        let consumers: Vec<InstanceReport> = self
            .consumers
            .iter()
            .map(|c| InstanceReport {
                instance: c.instance,
                health: c.health.borrow().clone(),
                stats: c.stats.snapshot(),
            })
            .collect();
        let totals = consumers
            .iter()
            .fold(StatsSnapshot::default(), |acc, c| acc.merge(c.stats));

        HealthReport {
            status: if self.is_healthy() { "healthy" } else { "unhealthy" },
            service: "notifications-rs",
            version: env!("CARGO_PKG_VERSION"),
            broker: self.manager.state(),
            started_at: self.started_at,
            consumers,
            totals,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InstanceReport {
    pub instance: usize,
    pub health: ConsumerHealth,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub broker: event_bus::ConnectionState,
    pub started_at: DateTime<Utc>,
    pub consumers: Vec<InstanceReport>,
    pub totals: StatsSnapshot,
}

/// Health check endpoint handler
///
/// 200 when every consumer instance is subscribed, 503 otherwise.
pub async fn health(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<HealthReport>) {
    let report = state.report();
    let status = if state.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
