//! # Event Consumer
//!
//! Receiving side of the catalog event bus. A service builds a [`Dispatcher`]
//! mapping event types (exact keys or wildcard patterns) to [`EventHandler`]s,
//! then runs one or more [`EventConsumer`]s on its durable queue.
//!
//! ```rust,no_run
//! use event_bus::{BrokerConnectionManager, BrokerSettings, InMemoryBroker, QueueConfig};
//! use event_consumer::{handler_fn, spawn_consumers, ConsumerConfig, Dispatcher, HandlerError};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = BrokerConnectionManager::new(Arc::new(InMemoryBroker::new()), BrokerSettings::default());
//! let dispatcher = Dispatcher::new().on(
//!     "course.*",
//!     handler_fn(|envelope| async move {
//!         tracing::info!(event_type = %envelope.event_type, "course event");
//!         Ok::<(), HandlerError>(())
//!     }),
//! )?;
//!
//! let queue = QueueConfig::new("notification_queue", &["course.*"])?;
//! let cancel = CancellationToken::new();
//! let consumers = spawn_consumers(&manager, Arc::new(dispatcher), ConsumerConfig::new(queue), 2, &cancel);
//!
//! cancel.cancel();
//! for consumer in consumers {
//!     consumer.join().await;
//! }
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod consumer;
mod dispatcher;
mod handler;
mod health;
mod idempotency;

pub use consumer::{
    spawn_consumers, ConsumerConfig, ConsumerHandle, ConsumerStats, DeliveryState, EventConsumer,
    StatsSnapshot,
};
pub use dispatcher::Dispatcher;
pub use handler::{handler_fn, EventHandler, FnHandler, HandlerError};
pub use health::ConsumerHealth;
pub use idempotency::ProcessedEvents;
