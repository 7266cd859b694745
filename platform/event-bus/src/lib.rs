//! # EventBus Abstraction
//!
//! The messaging layer shared by every catalog service: producers (registration,
//! courses, reviews) publish domain events to a durable topic exchange and the
//! notification service consumes them from its own durable queue.
//!
//! ## Pieces
//!
//! - [`BrokerConnectionManager`]: owns the single logical broker connection of a
//!   process, hands out [`Channel`]s, and repairs the connection in the background
//! - [`EventEnvelope`]: the `{event_type, timestamp, data}` wire format
//! - [`EventPublisher`]: fire-and-forget publish that never fails the caller
//! - [`OutboxRelay`]: optional at-least-once publishing through an outbox
//!
//! ## Implementations
//!
//! - **NatsConnector / NatsBus**: production broker on NATS JetStream
//! - **InMemoryBroker / InMemoryBus**: process-local topic exchange for dev/test
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{BrokerConnectionManager, BrokerSettings, EventPublisher, InMemoryBroker, PublisherConfig};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let broker = InMemoryBroker::new();
//! let manager = BrokerConnectionManager::new(Arc::new(broker), BrokerSettings::default());
//! let publisher = EventPublisher::new(manager.clone(), PublisherConfig::default());
//!
//! // Never fails the caller, whatever the broker is doing
//! publisher
//!     .publish(
//!         "user.registered",
//!         &serde_json::json!({"user_id": 123, "email": "a@b.com", "name": "A"}),
//!     )
//!     .await;
//!
//! manager.shutdown().await;
//! # }
//! ```

pub mod backoff;
mod connection;
mod envelope;
mod inmemory_bus;
mod nats_bus;
pub mod outbox;
mod publisher;
mod topology;

pub use backoff::{Backoff, BackoffPolicy};
pub use connection::{
    BrokerConnectionManager, BrokerSettings, Channel, ConnectionState, DEFAULT_EXCHANGE,
};
pub use envelope::{EnvelopeError, EventClock, EventEnvelope};
pub use inmemory_bus::{InMemoryBroker, InMemoryBus};
pub use nats_bus::{NatsBus, NatsConnector, NatsSettings};
pub use outbox::{
    InMemoryOutbox, OutboxRecord, OutboxRelay, OutboxRelayConfig, OutboxStatus, OutboxStore,
};
pub use publisher::{DomainEvent, EventPublisher, PublishOutcome, PublisherConfig};
pub use topology::{validate_routing_key, QueueConfig, RoutingPattern};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Content type stamped on every envelope
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message travelling through the broker
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// The routing key this message was published with (e.g. "course.enrolled")
    pub routing_key: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// MIME type of the payload
    pub content_type: Option<String>,
    /// Broker-side de-duplication id
    pub message_id: Option<String>,
    /// Whether the broker must keep the message across a restart
    pub persistent: bool,
    /// Optional extra headers
    pub headers: Option<HashMap<String, String>>,
}

impl BusMessage {
    /// Create a new transient bus message
    pub fn new(routing_key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload,
            content_type: None,
            message_id: None,
            persistent: false,
            headers: None,
        }
    }

    /// Set the payload content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set the de-duplication id
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Mark the message for persistent delivery
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Add headers to the message
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid routing key: {0}")]
    InvalidRoutingKey(String),

    #[error("invalid binding pattern: {0}")]
    InvalidPattern(String),

    #[error("failed to settle delivery: {0}")]
    AckError(String),

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("broker connection manager is shut down")]
    Closed,
}

impl BusError {
    /// Whether this error means the underlying connection is gone and must be
    /// re-established before the capability can recover
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, BusError::ConnectionError(_) | BusError::Timeout(_))
    }
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Settles a delivery with the broker
#[async_trait]
pub trait Acker: Send + Sync {
    /// Positively acknowledge; the broker forgets the message
    async fn ack(&self) -> BusResult<()>;

    /// Negatively acknowledge; `requeue` returns it to the queue, otherwise it is dropped
    async fn reject(&self, requeue: bool) -> BusResult<()>;
}

/// A message handed to a consumer, owed exactly one ack or reject
pub struct Delivery {
    /// The delivered message
    pub message: BusMessage,
    /// How many times the broker has delivered this message (1 on first delivery)
    pub delivery_count: u32,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(message: BusMessage, delivery_count: u32, acker: Box<dyn Acker>) -> Self {
        Self {
            message,
            delivery_count,
            acker,
        }
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    /// Acknowledge the delivery
    pub async fn ack(self) -> BusResult<()> {
        self.acker.ack().await
    }

    /// Reject the delivery, optionally returning it to the queue
    pub async fn reject(self, requeue: bool) -> BusResult<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.message.routing_key)
            .field("delivery_count", &self.delivery_count)
            .field("payload_len", &self.message.payload.len())
            .finish()
    }
}

/// Stream of deliveries from a queue. An `Err` item means the subscription is
/// broken and the consumer must re-acquire a channel.
pub type DeliveryStream = BoxStream<'static, BusResult<Delivery>>;

/// One live connection to a topic-exchange broker
///
/// Implementations are shared behind an `Arc` by the connection manager. The
/// per-caller concurrency rule lives in [`Channel`], not here.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Declare a durable topic exchange. Idempotent.
    async fn declare_exchange(&self, exchange: &str) -> BusResult<()>;

    /// Declare a durable queue and bind it to `exchange` with each of its patterns. Idempotent.
    async fn declare_queue(&self, exchange: &str, queue: &QueueConfig) -> BusResult<()>;

    /// Publish a message on `exchange` under its routing key
    ///
    /// Returns once the broker has accepted the message.
    async fn publish(&self, exchange: &str, message: BusMessage) -> BusResult<()>;

    /// Start a competing subscription on a declared queue
    ///
    /// At most `queue.prefetch` deliveries are outstanding (unacknowledged) on the
    /// returned stream at any time.
    async fn consume(&self, exchange: &str, queue: &QueueConfig) -> BusResult<DeliveryStream>;

    /// Whether the connection is still usable
    fn is_connected(&self) -> bool;

    /// Close the connection. Unacknowledged deliveries go back to their queues.
    async fn close(&self) -> BusResult<()>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}

/// Opens new broker connections on behalf of the connection manager
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> BusResult<Arc<dyn EventBus>>;

    /// Human-readable target for logs (never includes credentials)
    fn describe(&self) -> String;
}
