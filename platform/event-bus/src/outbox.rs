//! Outbox relay for at-least-once publishing
//!
//! A producer that must not lose events enqueues the envelope in the same
//! transaction as its local change, and the [`OutboxRelay`] publishes pending
//! records to the broker in the background.
//!
//! An unreachable broker never counts against a record: it stays pending for
//! as long as the outage lasts. Only errors tied to the record itself (a bad
//! routing key, an unserializable payload) are counted, and a record that hits
//! `max_retries` of those is marked failed so it stops blocking the ones behind it.

use crate::envelope::EventEnvelope;
use crate::publisher::EventPublisher;
use crate::{BusError, BusResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub id: u64,
    pub envelope: EventEnvelope,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Storage for outbox records
///
/// A database-backed store inserts inside the caller's transaction.
/// [`InMemoryOutbox`] serves tests and single-process deployments.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Store a new pending record and return its id
    async fn enqueue(&self, envelope: EventEnvelope) -> BusResult<u64>;

    /// Oldest pending records first
    async fn fetch_pending(&self, limit: usize) -> BusResult<Vec<OutboxRecord>>;

    /// The store may delete the record once it is published
    async fn mark_published(&self, id: u64) -> BusResult<()>;

    /// Count a failed attempt; the record becomes `Failed` once `max_retries` is reached
    async fn record_failure(
        &self,
        id: u64,
        error: &str,
        max_retries: u32,
    ) -> BusResult<OutboxStatus>;
}

/// Keeps pending and failed records; published records are dropped
#[derive(Default)]
pub struct InMemoryOutbox {
    records: Mutex<BTreeMap<u64, OutboxRecord>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, OutboxRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: u64) -> Option<OutboxRecord> {
        self.lock().get(&id).cloned()
    }

    /// Published records are counted, not kept
    pub fn count(&self, status: OutboxStatus) -> usize {
        match status {
            OutboxStatus::Published => self.published.load(Ordering::Relaxed) as usize,
            _ => self.lock().values().filter(|r| r.status == status).count(),
        }
    }

    /// Records still held (pending or failed)
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return failed records for inspection or replay
    pub fn drain_failed(&self) -> Vec<OutboxRecord> {
        let mut records = self.lock();
        let failed: Vec<u64> = records
            .values()
            .filter(|r| r.status == OutboxStatus::Failed)
            .map(|r| r.id)
            .collect();
        failed
            .into_iter()
            .filter_map(|id| records.remove(&id))
            .collect()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn enqueue(&self, envelope: EventEnvelope) -> BusResult<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(
            id,
            OutboxRecord {
                id,
                envelope,
                status: OutboxStatus::Pending,
                retry_count: 0,
                error_message: None,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn fetch_pending(&self, limit: usize) -> BusResult<Vec<OutboxRecord>> {
        Ok(self
            .lock()
            .values()
            .filter(|r| r.status == OutboxStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, id: u64) -> BusResult<()> {
        if self.lock().remove(&id).is_some() {
            self.published.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        id: u64,
        error: &str,
        max_retries: u32,
    ) -> BusResult<OutboxStatus> {
        let mut records = self.lock();
        let Some(record) = records.get_mut(&id) else {
            return Ok(OutboxStatus::Failed);
        };

        record.retry_count += 1;
        record.error_message = Some(error.to_string());
        if record.retry_count >= max_retries {
            record.status = OutboxStatus::Failed;
        }
        Ok(record.status)
    }
}

#[derive(Debug, Clone)]
pub struct OutboxRelayConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_retries: u32,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
            max_retries: 5,
        }
    }
}

pub struct OutboxRelay<S> {
    store: S,
    publisher: EventPublisher,
    config: OutboxRelayConfig,
}

impl<S: OutboxStore> OutboxRelay<S> {
    pub fn new(store: S, publisher: EventPublisher, config: OutboxRelayConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Poll and publish until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Starting outbox relay");

        let mut interval = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.relay_pending().await {
                Ok(count) if count > 0 => {
                    info!("Published {} events from outbox", count);
                }
                Err(e) => {
                    error!("Error publishing events from outbox: {}", e);
                }
                _ => {}
            }
        }

        info!("Outbox relay stopped");
    }

    /// Publish one batch of pending records, oldest first
    ///
    /// Stops at the first failure so later records are not published ahead of
    /// an earlier one. Broker unavailability leaves the record untouched.
    pub async fn relay_pending(&self) -> BusResult<usize> {
        let records = self.store.fetch_pending(self.config.batch_size).await?;
        let mut published_count = 0;

        for record in records {
            match self.publisher.publish_envelope(&record.envelope).await {
                Ok(()) => {
                    self.store.mark_published(record.id).await?;
                    published_count += 1;
                }
                Err(e) if e.is_connection_loss() || matches!(e, BusError::Closed) => {
                    debug!(
                        error = %e,
                        pending = record.id,
                        "Broker unavailable, outbox relay waiting"
                    );
                    break;
                }
                Err(e) => {
                    let status = self
                        .store
                        .record_failure(record.id, &e.to_string(), self.config.max_retries)
                        .await?;

                    warn!(
                        "Failed to publish outbox record {} (retry {}/{}): {}",
                        record.id,
                        record.retry_count + 1,
                        self.config.max_retries,
                        e
                    );
                    if status == OutboxStatus::Pending {
                        break;
                    }
                    error!(
                        event_type = %record.envelope.event_type,
                        "Outbox record {} marked failed",
                        record.id
                    );
                }
            }
        }

        Ok(published_count)
    }
}
