//! NATS JetStream implementation of the EventBus trait
//!
//! Topic-exchange concepts map onto JetStream as follows:
//!
//! - exchange `X` → stream `X` (upper-cased), subjects `X.>`, file storage
//! - routing key `R` on `X` → subject `X.R`
//! - durable queue → durable pull consumer filtered on `X.<pattern>` per binding
//! - ack / requeue / drop → `Ack` / `Nak` / `Term`
//!
//! A virtual host becomes a subject namespace, so two vhosts never see each
//! other's exchanges.

use crate::{
    Acker, BusError, BusMessage, BusResult, Connector, Delivery, DeliveryStream, EventBus,
    QueueConfig,
};
use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy, StorageType};
use async_nats::jetstream::{self, AckKind};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const MESSAGE_ID_HEADER: &str = "Nats-Msg-Id";
const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// Where and how to reach the NATS server
#[derive(Debug, Clone, PartialEq)]
pub struct NatsSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Virtual host; `/` or empty means the root namespace
    pub vhost: String,
    /// Client name reported to the server
    pub connection_name: String,
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4222,
            user: None,
            password: None,
            vhost: "/".to_string(),
            connection_name: "catalog-events".to_string(),
        }
    }
}

impl NatsSettings {
    pub fn url(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }

    /// Subject prefix derived from the vhost (`""` or `"<vhost>."`)
    pub fn namespace(&self) -> String {
        let vhost = self.vhost.trim_matches('/');
        if vhost.is_empty() {
            String::new()
        } else {
            format!("{}.", vhost.replace(['/', '.', ' ', '*', '>'], "_"))
        }
    }
}

/// Opens [`NatsBus`] connections for the connection manager
#[derive(Debug, Clone)]
pub struct NatsConnector {
    settings: NatsSettings,
}

impl NatsConnector {
    pub fn new(settings: NatsSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(&self) -> BusResult<Arc<dyn EventBus>> {
        let mut options = async_nats::ConnectOptions::new().name(&self.settings.connection_name);
        if let (Some(user), Some(password)) = (&self.settings.user, &self.settings.password) {
            options = options.user_and_password(user.clone(), password.clone());
        }

        let url = self.settings.url();
        let client = options
            .connect(url.as_str())
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        Ok(Arc::new(NatsBus::new(client, self.settings.namespace())))
    }

    fn describe(&self) -> String {
        format!("{}{}", self.settings.url(), self.settings.vhost)
    }
}

/// EventBus implementation using NATS JetStream
///
/// This is the production implementation that connects to a NATS server.
/// It wraps an `async_nats::Client` and a JetStream context built from it.
pub struct NatsBus {
    client: Client,
    jetstream: jetstream::Context,
    namespace: String,
    closed: AtomicBool,
}

impl NatsBus {
    /// Wrap an already-connected client. `namespace` is prepended to every subject.
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            namespace: namespace.into(),
            closed: AtomicBool::new(false),
        }
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn stream_name(&self, exchange: &str) -> String {
        stream_name(&self.namespace, exchange)
    }

    fn subject(&self, exchange: &str, routing_key: &str) -> String {
        format!("{}{}.{}", self.namespace, exchange, routing_key)
    }

    /// Errors while disconnected are connection losses; anything else keeps its own kind
    fn classify(&self, error: impl Display, kind: fn(String) -> BusError) -> BusError {
        if self.is_connected() {
            kind(error.to_string())
        } else {
            BusError::ConnectionError(error.to_string())
        }
    }
}

fn stream_name(namespace: &str, exchange: &str) -> String {
    format!("{namespace}{exchange}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn consumer_name(queue: &str) -> String {
    queue
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn routing_key_from_subject<'a>(subject: &'a str, prefix: &str) -> &'a str {
    subject.strip_prefix(prefix).unwrap_or(subject)
}

fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (key, values) in headers.iter() {
        // Take the first value for each header
        if let Some(value) = values.first() {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

fn to_bus_message(message: &async_nats::Message, prefix: &str) -> BusMessage {
    let routing_key = routing_key_from_subject(message.subject.as_str(), prefix);
    let mut bus_message = BusMessage::new(routing_key, message.payload.to_vec()).persistent();

    if let Some(headers) = &message.headers {
        let mut map = headers_to_map(headers);
        if let Some(content_type) = map.remove(CONTENT_TYPE_HEADER) {
            bus_message = bus_message.with_content_type(content_type);
        }
        if let Some(message_id) = map.remove(MESSAGE_ID_HEADER) {
            bus_message = bus_message.with_message_id(message_id);
        }
        if !map.is_empty() {
            bus_message = bus_message.with_headers(map);
        }
    }

    bus_message
}

#[async_trait]
impl EventBus for NatsBus {
    async fn declare_exchange(&self, exchange: &str) -> BusResult<()> {
        let config = StreamConfig {
            name: self.stream_name(exchange),
            subjects: vec![format!("{}{}.>", self.namespace, exchange)],
            storage: StorageType::File,
            // Messages nobody is bound to are discarded, as with a topic exchange
            retention: RetentionPolicy::Interest,
            ..Default::default()
        };

        self.jetstream
            .get_or_create_stream(config)
            .await
            .map_err(|e| self.classify(e, BusError::SubscribeError))?;
        Ok(())
    }

    async fn declare_queue(&self, exchange: &str, queue: &QueueConfig) -> BusResult<()> {
        let stream = self
            .jetstream
            .get_stream(self.stream_name(exchange))
            .await
            .map_err(|e| self.classify(e, BusError::SubscribeError))?;

        let name = consumer_name(&queue.name);
        let config = pull::Config {
            durable_name: Some(name.clone()),
            filter_subjects: queue
                .patterns
                .iter()
                .map(|p| self.subject(exchange, p.as_str()))
                .collect(),
            ack_policy: AckPolicy::Explicit,
            deliver_policy: DeliverPolicy::All,
            max_deliver: i64::from(queue.max_deliveries),
            max_ack_pending: i64::from(queue.prefetch),
            ..Default::default()
        };

        stream
            .get_or_create_consumer(&name, config)
            .await
            .map_err(|e| self.classify(e, BusError::SubscribeError))?;
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: BusMessage) -> BusResult<()> {
        let mut headers = HeaderMap::new();
        if let Some(content_type) = &message.content_type {
            headers.insert(CONTENT_TYPE_HEADER, content_type.as_str());
        }
        if let Some(message_id) = &message.message_id {
            headers.insert(MESSAGE_ID_HEADER, message_id.as_str());
        }
        if let Some(extra) = &message.headers {
            for (key, value) in extra {
                headers.insert(key.as_str(), value.as_str());
            }
        }

        let subject = self.subject(exchange, &message.routing_key);
        let ack = self
            .jetstream
            .publish_with_headers(subject, headers, message.payload.into())
            .await
            .map_err(|e| self.classify(e, BusError::PublishError))?;

        // Wait for the stream to confirm it stored the message
        ack.await
            .map_err(|e| self.classify(e, BusError::PublishError))?;
        Ok(())
    }

    async fn consume(&self, exchange: &str, queue: &QueueConfig) -> BusResult<DeliveryStream> {
        let stream = self
            .jetstream
            .get_stream(self.stream_name(exchange))
            .await
            .map_err(|e| self.classify(e, BusError::SubscribeError))?;
        let consumer: jetstream::consumer::PullConsumer = stream
            .get_consumer(&consumer_name(&queue.name))
            .await
            .map_err(|e| self.classify(e, BusError::SubscribeError))?;

        let mut builder = consumer.stream();
        if queue.prefetch > 0 {
            builder = builder.max_messages_per_batch(queue.prefetch as usize);
        }
        let mut messages = builder
            .messages()
            .await
            .map_err(|e| self.classify(e, BusError::SubscribeError))?;

        let prefix = format!("{}{}.", self.namespace, exchange);
        let stream = async_stream::stream! {
            while let Some(item) = messages.next().await {
                match item {
                    Ok(message) => {
                        let delivery_count = message
                            .info()
                            .map(|info| info.delivered.max(1) as u32)
                            .unwrap_or(1);
                        let bus_message = to_bus_message(&message, &prefix);
                        yield Ok(Delivery::new(
                            bus_message,
                            delivery_count,
                            Box::new(NatsAcker { message }),
                        ));
                    }
                    Err(e) => {
                        yield Err(BusError::ConnectionError(e.to_string()));
                        break;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.client.connection_state() == async_nats::connection::State::Connected
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.client
            .flush()
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> BusResult<()> {
        let kind = if requeue { AckKind::Nak(None) } else { AckKind::Term };
        self.message
            .ack_with(kind)
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}
