//! In-memory topic-exchange broker for testing and development
//!
//! Behaves like a single-node broker: durable queues bound to exchanges by
//! pattern, competing consumers served round-robin, per-consumer prefetch,
//! explicit ack/reject with requeue, and delivery counting. Outages are
//! simulated with [`InMemoryBroker::set_available`].

use crate::{
    Acker, BusError, BusMessage, BusResult, Connector, Delivery, DeliveryStream, EventBus,
    QueueConfig, RoutingPattern,
};
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// A process-local broker shared by every connection opened on it
///
/// # Example
/// ```rust
/// use event_bus::{BusMessage, Connector, EventBus, InMemoryBroker, QueueConfig};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// let bus = broker.connect().await?;
///
/// let queue = QueueConfig::new("enrollments", &["course.*"])?;
/// bus.declare_exchange("events").await?;
/// bus.declare_queue("events", &queue).await?;
/// let mut deliveries = bus.consume("events", &queue).await?;
///
/// bus.publish("events", BusMessage::new("course.enrolled", b"{}".to_vec())).await?;
///
/// let delivery = deliveries.next().await.unwrap()?;
/// assert_eq!(delivery.message.routing_key, "course.enrolled");
/// delivery.ack().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    available: bool,
    live_connections: HashSet<u64>,
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, QueueState>,
    next_connection_id: u64,
    next_consumer_id: u64,
    connections_opened: usize,
}

struct Binding {
    queue: String,
    pattern: RoutingPattern,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<u64, Unacked>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
    next_tag: u64,
}

struct StoredMessage {
    message: BusMessage,
    delivery_count: u32,
}

struct Unacked {
    stored: StoredMessage,
    consumer_id: u64,
}

struct ConsumerSlot {
    id: u64,
    connection_id: u64,
    prefetch: u16,
    in_flight: usize,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < self.prefetch as usize
    }
}

impl QueueState {
    /// Push ready messages to consumers with spare prefetch, round-robin
    fn dispatch(&mut self, broker: &InMemoryBroker, queue: &str) {
        loop {
            if self.ready.is_empty() || self.consumers.is_empty() {
                return;
            }

            let n = self.consumers.len();
            let Some(idx) = (0..n)
                .map(|offset| (self.cursor + offset) % n)
                .find(|&i| self.consumers[i].has_capacity())
            else {
                return;
            };
            let Some(mut stored) = self.ready.pop_front() else {
                return;
            };

            stored.delivery_count += 1;
            let tag = self.next_tag;
            self.next_tag += 1;

            let acker = InMemoryAcker {
                broker: broker.clone(),
                queue: queue.to_string(),
                tag,
                connection_id: self.consumers[idx].connection_id,
            };
            let delivery = Delivery::new(
                stored.message.clone(),
                stored.delivery_count,
                Box::new(acker),
            );

            if self.consumers[idx].tx.send(delivery).is_err() {
                // Receiver dropped without its guard running yet
                stored.delivery_count -= 1;
                self.ready.push_front(stored);
                self.consumers.remove(idx);
                self.cursor = 0;
                continue;
            }

            let consumer = &mut self.consumers[idx];
            consumer.in_flight += 1;
            let consumer_id = consumer.id;
            self.cursor = (idx + 1) % n;
            self.unacked.insert(
                tag,
                Unacked {
                    stored,
                    consumer_id,
                },
            );
        }
    }

    /// Return every unacked message matching `owned_by` to the head of the queue, in delivery order
    fn requeue_unacked(&mut self, owned_by: impl Fn(u64) -> bool) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| owned_by(u.consumer_id))
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.ready.push_front(unacked.stored);
            }
        }
    }

    fn release(&mut self, consumer_id: u64) {
        if let Some(consumer) = self.consumers.iter_mut().find(|c| c.id == consumer_id) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                live_connections: HashSet::new(),
                exchanges: HashMap::new(),
                queues: HashMap::new(),
                next_connection_id: 1,
                next_consumer_id: 1,
                connections_opened: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    ///
    /// Going down drops every live connection; their unacknowledged deliveries
    /// go back to the head of their queues. Queued messages survive.
    pub fn set_available(&self, available: bool) {
        let mut state = self.lock();
        state.available = available;
        if !available {
            let dropped: Vec<u64> = state.live_connections.drain().collect();
            for id in dropped {
                Self::drop_connection(&mut state, self, id);
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.lock().available
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains_key(exchange)
    }

    /// Messages waiting for a consumer
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Ready plus unacked
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len() + q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Total successful connects since creation
    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    fn is_live(&self, connection_id: u64) -> bool {
        let state = self.lock();
        state.available && state.live_connections.contains(&connection_id)
    }

    fn drop_connection(state: &mut BrokerState, broker: &InMemoryBroker, connection_id: u64) {
        state.live_connections.remove(&connection_id);

        for (name, queue) in state.queues.iter_mut() {
            let gone: HashSet<u64> = queue
                .consumers
                .iter()
                .filter(|c| c.connection_id == connection_id)
                .map(|c| c.id)
                .collect();
            if gone.is_empty() {
                continue;
            }

            queue.consumers.retain(|c| !gone.contains(&c.id));
            queue.cursor = 0;
            queue.requeue_unacked(|id| gone.contains(&id));
            queue.dispatch(broker, name);
        }
    }

    fn remove_consumer(&self, queue_name: &str, consumer_id: u64) {
        let mut state = self.lock();
        if let Some(queue) = state.queues.get_mut(queue_name) {
            queue.consumers.retain(|c| c.id != consumer_id);
            queue.cursor = 0;
            queue.requeue_unacked(|id| id == consumer_id);
            queue.dispatch(self, queue_name);
        }
    }

    fn settle(&self, acker: &InMemoryAcker, requeue: Option<bool>) -> BusResult<()> {
        let mut state = self.lock();
        if !state.available || !state.live_connections.contains(&acker.connection_id) {
            return Err(BusError::ConnectionError(
                "connection closed before the delivery was settled".to_string(),
            ));
        }

        let queue = state
            .queues
            .get_mut(&acker.queue)
            .ok_or_else(|| BusError::AckError(format!("queue '{}' not found", acker.queue)))?;
        let unacked = queue.unacked.remove(&acker.tag).ok_or_else(|| {
            BusError::AckError(format!("unknown delivery tag {}", acker.tag))
        })?;

        queue.release(unacked.consumer_id);
        if requeue == Some(true) {
            queue.ready.push_front(unacked.stored);
        }
        queue.dispatch(self, &acker.queue);
        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self) -> BusResult<Arc<dyn EventBus>> {
        let mut state = self.lock();
        if !state.available {
            return Err(BusError::ConnectionError(
                "in-memory broker unavailable".to_string(),
            ));
        }

        let connection_id = state.next_connection_id;
        state.next_connection_id += 1;
        state.live_connections.insert(connection_id);
        state.connections_opened += 1;

        Ok(Arc::new(InMemoryBus {
            broker: self.clone(),
            connection_id,
        }))
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

/// One connection to an [`InMemoryBroker`]
#[derive(Clone)]
pub struct InMemoryBus {
    broker: InMemoryBroker,
    connection_id: u64,
}

impl InMemoryBus {
    fn live_state(&self) -> BusResult<MutexGuard<'_, BrokerState>> {
        let state = self.broker.lock();
        if !state.available || !state.live_connections.contains(&self.connection_id) {
            return Err(BusError::ConnectionError("connection closed".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn declare_exchange(&self, exchange: &str) -> BusResult<()> {
        let mut state = self.live_state()?;
        state.exchanges.entry(exchange.to_string()).or_default();
        Ok(())
    }

    async fn declare_queue(&self, exchange: &str, queue: &QueueConfig) -> BusResult<()> {
        let mut state = self.live_state()?;
        let bindings = state.exchanges.get_mut(exchange).ok_or_else(|| {
            BusError::SubscribeError(format!("exchange '{exchange}' not declared"))
        })?;

        for pattern in &queue.patterns {
            let exists = bindings
                .iter()
                .any(|b| b.queue == queue.name && &b.pattern == pattern);
            if !exists {
                bindings.push(Binding {
                    queue: queue.name.clone(),
                    pattern: pattern.clone(),
                });
            }
        }

        state.queues.entry(queue.name.clone()).or_default();
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: BusMessage) -> BusResult<()> {
        let mut state = self.live_state()?;
        let bindings = state.exchanges.get(exchange).ok_or_else(|| {
            BusError::PublishError(format!("exchange '{exchange}' not declared"))
        })?;

        let mut targets: Vec<String> = Vec::new();
        for binding in bindings {
            if binding.pattern.matches(&message.routing_key) && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }

        // Unroutable messages are dropped, as a topic exchange does
        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.ready.push_back(StoredMessage {
                    message: message.clone(),
                    delivery_count: 0,
                });
                queue.dispatch(&self.broker, &name);
            }
        }

        Ok(())
    }

    async fn consume(&self, _exchange: &str, queue: &QueueConfig) -> BusResult<DeliveryStream> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let consumer_id = {
            let mut state = self.live_state()?;
            let consumer_id = state.next_consumer_id;
            state.next_consumer_id += 1;

            let queue_state = state.queues.get_mut(&queue.name).ok_or_else(|| {
                BusError::SubscribeError(format!("queue '{}' not declared", queue.name))
            })?;
            queue_state.consumers.push(ConsumerSlot {
                id: consumer_id,
                connection_id: self.connection_id,
                prefetch: queue.prefetch,
                in_flight: 0,
                tx,
            });
            queue_state.dispatch(&self.broker, &queue.name);
            consumer_id
        };

        let guard = ConsumerGuard {
            broker: self.broker.clone(),
            queue: queue.name.clone(),
            consumer_id,
        };
        let broker = self.broker.clone();
        let connection_id = self.connection_id;

        let stream = async_stream::stream! {
            let _guard = guard;
            while let Some(delivery) = rx.recv().await {
                // Deliveries buffered before a connection loss were already requeued
                if !broker.is_live(connection_id) {
                    break;
                }
                yield Ok(delivery);
            }
            if !broker.is_live(connection_id) {
                yield Err(BusError::ConnectionError("connection lost".to_string()));
            }
        };

        Ok(stream.boxed())
    }

    fn is_connected(&self) -> bool {
        self.broker.is_live(self.connection_id)
    }

    async fn close(&self) -> BusResult<()> {
        let mut state = self.broker.lock();
        InMemoryBroker::drop_connection(&mut state, &self.broker, self.connection_id);
        Ok(())
    }
}

struct ConsumerGuard {
    broker: InMemoryBroker,
    queue: String,
    consumer_id: u64,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.broker.remove_consumer(&self.queue, self.consumer_id);
    }
}

struct InMemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    tag: u64,
    connection_id: u64,
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(&self) -> BusResult<()> {
        self.broker.settle(self, None)
    }

    async fn reject(&self, requeue: bool) -> BusResult<()> {
        self.broker.settle(self, Some(requeue))
    }
}
