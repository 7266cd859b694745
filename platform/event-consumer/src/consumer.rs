//! Long-lived receive loop with explicit acknowledgment
//!
//! Every delivery moves through
//! `Delivered → Processing → {Acked | NackedRequeued | NackedDropped}` and is
//! settled only after its handler has finished (at-least-once).
//!
//! | Situation                                | Settlement                  |
//! |------------------------------------------|-----------------------------|
//! | Body is not a valid envelope (poison)    | dead-letter, reject, drop   |
//! | `event_id` already processed             | ack, handler not called     |
//! | No handler for `event_type`              | ack                         |
//! | Handler succeeded                        | ack                         |
//! | Transient error, deliveries left         | reject, requeue             |
//! | Permanent error, or deliveries exhausted | dead-letter, reject, drop   |

use crate::dispatcher::Dispatcher;
use crate::handler::HandlerError;
use crate::health::ConsumerHealth;
use crate::idempotency::ProcessedEvents;
use event_bus::backoff::sleep_or_cancel;
use event_bus::{
    BrokerConnectionManager, BusError, BusMessage, BusResult, Channel, Delivery, DeliveryStream,
    EventEnvelope, QueueConfig,
};
use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

const DEATH_REASON_HEADER: &str = "x-death-reason";
const ORIGINAL_EXCHANGE_HEADER: &str = "x-original-exchange";

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: QueueConfig,
    /// Exchange that receives dropped messages under their original routing key
    pub dead_letter_exchange: Option<String>,
    /// How many processed event ids to remember for de-duplication
    pub processed_capacity: usize,
}

impl ConsumerConfig {
    pub fn new(queue: QueueConfig) -> Self {
        Self {
            queue,
            dead_letter_exchange: None,
            processed_capacity: 10_000,
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

/// Per-message acknowledgment state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Delivered,
    Processing,
    Acked,
    NackedRequeued,
    NackedDropped,
}

/// Running counters for one consumer instance
#[derive(Debug, Default)]
pub struct ConsumerStats {
    acked: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
    poison: AtomicU64,
    unrouted: AtomicU64,
    duplicates: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub acked: u64,
    pub requeued: u64,
    pub dropped: u64,
    pub poison: u64,
    pub unrouted: u64,
    pub duplicates: u64,
}

impl StatsSnapshot {
    /// Field-wise sum, for totals across instances
    pub fn merge(self, other: StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            acked: self.acked + other.acked,
            requeued: self.requeued + other.requeued,
            dropped: self.dropped + other.dropped,
            poison: self.poison + other.poison,
            unrouted: self.unrouted + other.unrouted,
            duplicates: self.duplicates + other.duplicates,
        }
    }
}

impl ConsumerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, state: DeliveryState) {
        match state {
            DeliveryState::Acked => Self::bump(&self.acked),
            DeliveryState::NackedRequeued => Self::bump(&self.requeued),
            DeliveryState::NackedDropped => Self::bump(&self.dropped),
            DeliveryState::Delivered | DeliveryState::Processing => {}
        }
    }
}

pub struct EventConsumer {
    manager: BrokerConnectionManager,
    dispatcher: Arc<Dispatcher>,
    config: ConsumerConfig,
    processed: Arc<ProcessedEvents>,
    stats: Arc<ConsumerStats>,
    health: watch::Sender<ConsumerHealth>,
    instance: usize,
}

impl EventConsumer {
    pub fn new(
        manager: BrokerConnectionManager,
        dispatcher: Arc<Dispatcher>,
        config: ConsumerConfig,
    ) -> Self {
        let processed = Arc::new(ProcessedEvents::new(config.processed_capacity));
        let (health, _) = watch::channel(ConsumerHealth::Starting);
        Self {
            manager,
            dispatcher,
            config,
            processed,
            stats: Arc::new(ConsumerStats::default()),
            health,
            instance: 0,
        }
    }

    /// Instance number used in logs when several consumers share a queue
    pub fn with_instance(mut self, instance: usize) -> Self {
        self.instance = instance;
        self
    }

    /// Share processed-event tracking with other instances in this process
    pub fn with_processed_events(mut self, processed: Arc<ProcessedEvents>) -> Self {
        self.processed = processed;
        self
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    pub fn health(&self) -> watch::Receiver<ConsumerHealth> {
        self.health.subscribe()
    }

    /// Receive and dispatch until `cancel` fires
    ///
    /// Never returns early because of the broker: subscription failures and
    /// lost connections are retried with backoff while health reports
    /// `Unhealthy`. Cancellation is only observed between deliveries, so a
    /// handler in progress always finishes and is settled.
    pub async fn run(self, cancel: CancellationToken) {
        let queue = self.config.queue.name.clone();
        info!(queue = %queue, instance = self.instance, "Starting event consumer");

        let mut backoff = self.manager.settings().backoff.iter();

        while !cancel.is_cancelled() {
            let error = match self.subscribe().await {
                Ok((mut channel, stream)) => {
                    backoff.reset();
                    self.set_health(ConsumerHealth::Healthy);
                    info!(queue = %queue, instance = self.instance, "Subscribed to queue");

                    match self.receive_loop(&mut channel, stream, &cancel).await {
                        None => break,
                        Some(e) => e,
                    }
                }
                Err(e) => e,
            };

            self.set_health(ConsumerHealth::Unhealthy(error.to_string()));
            self.manager.invalidate(&error).await;

            let delay = backoff.next_delay();
            warn!(
                queue = %queue,
                instance = self.instance,
                attempt = backoff.attempt(),
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Consumer disconnected, retrying"
            );
            if !sleep_or_cancel(delay, &cancel).await {
                break;
            }
        }

        self.set_health(ConsumerHealth::Stopped);
        info!(queue = %queue, instance = self.instance, "Event consumer stopped");
    }

    async fn subscribe(&self) -> BusResult<(Channel, DeliveryStream)> {
        let mut channel = self.manager.acquire_channel().await?;
        channel.declare_queue(&self.config.queue).await?;
        if let Some(exchange) = &self.config.dead_letter_exchange {
            channel.declare_exchange(exchange).await?;
        }
        let stream = channel.consume(&self.config.queue).await?;
        Ok((channel, stream))
    }

    /// Returns `None` when cancelled, or the error that broke the subscription
    async fn receive_loop(
        &self,
        channel: &mut Channel,
        mut stream: DeliveryStream,
        cancel: &CancellationToken,
    ) -> Option<BusError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.process_delivery(channel, delivery).await;
                }
                Some(Err(e)) => return Some(e),
                None => {
                    return Some(BusError::ConnectionError(
                        "delivery stream ended".to_string(),
                    ))
                }
            }
        }
    }

    /// Dispatch one delivery and settle it; returns the final state
    pub async fn process_delivery(&self, channel: &mut Channel, delivery: Delivery) -> DeliveryState {
        trace!(
            routing_key = %delivery.message.routing_key,
            delivery_count = delivery.delivery_count,
            state = ?DeliveryState::Delivered,
            "Delivery received"
        );

        let envelope = match EventEnvelope::from_slice(&delivery.message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    routing_key = %delivery.message.routing_key,
                    error = %e,
                    "Poison message rejected"
                );
                ConsumerStats::bump(&self.stats.poison);
                return self.drop_delivery(channel, delivery, &e.to_string()).await;
            }
        };

        if envelope.event_type != delivery.message.routing_key {
            warn!(
                routing_key = %delivery.message.routing_key,
                event_type = %envelope.event_type,
                "Envelope event_type differs from routing key; dispatching on event_type"
            );
        }

        let span = tracing::info_span!(
            "process_event",
            event_type = %envelope.event_type,
            event_id = %envelope.event_id.map(|id| id.to_string()).unwrap_or_else(|| "none".to_string()),
            delivery_count = delivery.delivery_count,
            instance = self.instance,
        );

        self.dispatch(channel, delivery, envelope)
            .instrument(span)
            .await
    }

    async fn dispatch(
        &self,
        channel: &mut Channel,
        delivery: Delivery,
        envelope: EventEnvelope,
    ) -> DeliveryState {
        if let Some(event_id) = envelope.event_id {
            if self.processed.contains(&event_id) {
                info!("Duplicate event ignored (already processed)");
                ConsumerStats::bump(&self.stats.duplicates);
                return self.ack(delivery).await;
            }
        }

        let Some(handler) = self.dispatcher.route(&envelope.event_type) else {
            debug!("No handler registered, acknowledging");
            ConsumerStats::bump(&self.stats.unrouted);
            return self.ack(delivery).await;
        };

        debug!(state = ?DeliveryState::Processing, "Dispatching event");

        match handler.handle(&envelope).await {
            Ok(()) => {
                if let Some(event_id) = envelope.event_id {
                    self.processed.insert(event_id);
                }
                debug!("Event handled");
                self.ack(delivery).await
            }
            Err(HandlerError::Transient(reason))
                if delivery.delivery_count < self.config.queue.max_deliveries =>
            {
                warn!(
                    attempt = delivery.delivery_count,
                    max_deliveries = self.config.queue.max_deliveries,
                    error = %reason,
                    "Transient handler failure, requeueing"
                );
                self.settle(delivery, DeliveryState::NackedRequeued).await
            }
            Err(e) => {
                error!(
                    attempt = delivery.delivery_count,
                    error = %e,
                    "Event processing failed, dropping"
                );
                self.drop_delivery(channel, delivery, &e.to_string()).await
            }
        }
    }

    async fn ack(&self, delivery: Delivery) -> DeliveryState {
        self.settle(delivery, DeliveryState::Acked).await
    }

    async fn drop_delivery(
        &self,
        channel: &mut Channel,
        delivery: Delivery,
        reason: &str,
    ) -> DeliveryState {
        self.dead_letter(channel, &delivery.message, reason).await;
        self.settle(delivery, DeliveryState::NackedDropped).await
    }

    async fn settle(&self, delivery: Delivery, state: DeliveryState) -> DeliveryState {
        let result = match state {
            DeliveryState::Acked => delivery.ack().await,
            DeliveryState::NackedRequeued => delivery.reject(true).await,
            _ => delivery.reject(false).await,
        };

        match result {
            Ok(()) => {
                self.stats.record(state);
                state
            }
            Err(e) => {
                // The broker redelivers anything left unsettled
                warn!(error = %e, state = ?state, "Failed to settle delivery");
                self.manager.invalidate(&e).await;
                state
            }
        }
    }

    async fn dead_letter(&self, channel: &mut Channel, message: &BusMessage, reason: &str) {
        let Some(exchange) = &self.config.dead_letter_exchange else {
            return;
        };

        let mut headers = message.headers.clone().unwrap_or_default();
        headers.insert(DEATH_REASON_HEADER.to_string(), reason.replace(['\r', '\n'], " "));
        headers.insert(
            ORIGINAL_EXCHANGE_HEADER.to_string(),
            channel.exchange().to_string(),
        );
        let dead = message.clone().with_headers(headers);

        match channel.publish_to(exchange, dead).await {
            Ok(()) => info!(
                dead_letter_exchange = %exchange,
                routing_key = %message.routing_key,
                "Message sent to dead-letter exchange"
            ),
            Err(e) => {
                error!(
                    dead_letter_exchange = %exchange,
                    error = %e,
                    "Failed to dead-letter message"
                );
                self.manager.invalidate(&e).await;
            }
        }
    }

    fn set_health(&self, health: ConsumerHealth) {
        self.health.send_if_modified(|current| {
            if *current == health {
                false
            } else {
                *current = health;
                true
            }
        });
    }
}

/// A spawned consumer instance
pub struct ConsumerHandle {
    pub instance: usize,
    health: watch::Receiver<ConsumerHealth>,
    stats: Arc<ConsumerStats>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn health(&self) -> ConsumerHealth {
        self.health.borrow().clone()
    }

    pub fn health_receiver(&self) -> watch::Receiver<ConsumerHealth> {
        self.health.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Live counters, for readers that outlive the handle
    pub fn stats_handle(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Wait for the receive loop to exit
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(instance = self.instance, error = %e, "Consumer task panicked");
        }
    }
}

/// Start `instances` competing consumers on the same durable queue
///
/// The broker spreads deliveries across them round-robin; each keeps at most
/// `prefetch` deliveries unacknowledged. Processed-event tracking is shared.
pub fn spawn_consumers(
    manager: &BrokerConnectionManager,
    dispatcher: Arc<Dispatcher>,
    config: ConsumerConfig,
    instances: usize,
    cancel: &CancellationToken,
) -> Vec<ConsumerHandle> {
    let processed = Arc::new(ProcessedEvents::new(config.processed_capacity));

    (0..instances.max(1))
        .map(|instance| {
            let consumer = EventConsumer::new(manager.clone(), dispatcher.clone(), config.clone())
                .with_instance(instance)
                .with_processed_events(processed.clone());
            let health = consumer.health();
            let stats = consumer.stats();
            let task = tokio::spawn(consumer.run(cancel.clone()));

            ConsumerHandle {
                instance,
                health,
                stats,
                task,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_record_final_states_only() {
        let stats = ConsumerStats::default();
        stats.record(DeliveryState::Delivered);
        stats.record(DeliveryState::Processing);
        stats.record(DeliveryState::Acked);
        stats.record(DeliveryState::NackedRequeued);
        stats.record(DeliveryState::NackedDropped);
        stats.record(DeliveryState::NackedDropped);

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                acked: 1,
                requeued: 1,
                dropped: 2,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_snapshot_merge() {
        let a = StatsSnapshot {
            acked: 2,
            poison: 1,
            ..Default::default()
        };
        let b = StatsSnapshot {
            acked: 3,
            duplicates: 4,
            ..Default::default()
        };

        let total = a.merge(b);
        assert_eq!(total.acked, 5);
        assert_eq!(total.poison, 1);
        assert_eq!(total.duplicates, 4);
    }

    #[test]
    fn test_config_defaults() {
        let queue = QueueConfig::new("notification_queue", &["user.*"]).unwrap();
        let config = ConsumerConfig::new(queue).with_dead_letter_exchange("dead_letters");

        assert_eq!(config.processed_capacity, 10_000);
        assert_eq!(config.dead_letter_exchange.as_deref(), Some("dead_letters"));
    }
}
