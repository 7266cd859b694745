//! Fire-and-forget event publishing
//!
//! [`EventPublisher::publish`] is called from a request path right after the
//! local write commits. It never returns an error and never waits longer than
//! [`PublisherConfig::publish_timeout`]: a broken broker costs the caller at
//! most that delay and a warning in the log.
//!
//! This is a dual write. The local transaction and the event are not atomic, so
//! a committed write can lose its event. Producers that cannot accept that use
//! the outbox instead (see [`crate::outbox`]).

use crate::connection::BrokerConnectionManager;
use crate::envelope::EventEnvelope;
use crate::{BusError, BusResult};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// A payload type bound to exactly one routing key
pub trait DomainEvent: Serialize {
    const ROUTING_KEY: &'static str;
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Maximum time a publish may hold up the caller, connecting included
    pub publish_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(2),
        }
    }
}

/// What happened to a publish. Informational only; callers may ignore it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { event_id: Uuid },
    Dropped { reason: String },
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published { .. })
    }
}

/// Publishes on the manager's connection
///
/// Envelope timestamps come from the manager's clock, so every publisher built
/// on the same manager stamps non-decreasing times.
#[derive(Clone)]
pub struct EventPublisher {
    manager: BrokerConnectionManager,
    config: PublisherConfig,
}

impl EventPublisher {
    pub fn new(manager: BrokerConnectionManager, config: PublisherConfig) -> Self {
        Self { manager, config }
    }

    pub fn manager(&self) -> &BrokerConnectionManager {
        &self.manager
    }

    /// Publish `payload` under `routing_key`, logging and swallowing any failure
    pub async fn publish<T>(&self, routing_key: &str, payload: &T) -> PublishOutcome
    where
        T: Serialize + ?Sized,
    {
        let timeout = self.config.publish_timeout;
        let result = match tokio::time::timeout(timeout, self.try_publish(routing_key, payload)).await
        {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(timeout.as_millis() as u64)),
        };

        match result {
            Ok(event_id) => {
                debug!(routing_key, %event_id, "Event published");
                PublishOutcome::Published { event_id }
            }
            Err(e) => {
                warn!(
                    routing_key,
                    error = %e,
                    "Event dropped: publish failed"
                );
                PublishOutcome::Dropped {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Publish a typed event under its own routing key
    pub async fn emit<E: DomainEvent>(&self, event: &E) -> PublishOutcome {
        self.publish(E::ROUTING_KEY, event).await
    }

    /// Publish and report the failure instead of swallowing it. No timeout is applied.
    pub async fn try_publish<T>(&self, routing_key: &str, payload: &T) -> BusResult<Uuid>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_value(payload)
            .map_err(|e| BusError::SerializationError(e.to_string()))?;
        let envelope = EventEnvelope::new(routing_key, data)
            .with_timestamp(self.manager.clock().now())
            .into_json()?;

        self.publish_envelope(&envelope).await?;
        envelope
            .event_id
            .ok_or_else(|| BusError::PublishError("envelope without event_id".to_string()))
    }

    /// Send an already-built envelope, keeping its event_id and timestamp
    ///
    /// Connection-loss errors are reported to the manager so the connection is
    /// repaired in the background.
    pub async fn publish_envelope(&self, envelope: &EventEnvelope) -> BusResult<()> {
        let message = envelope.to_message()?;

        let mut channel = self.manager.acquire_channel().await?;
        if let Err(e) = channel.publish(message).await {
            self.manager.invalidate(&e).await;
            return Err(e);
        }
        Ok(())
    }
}
