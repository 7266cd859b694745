//! Process-wide broker connection lifecycle
//!
//! The connection is a scoped resource: opened lazily on the first
//! [`BrokerConnectionManager::acquire_channel`], repaired in the background after
//! a loss, and released by [`BrokerConnectionManager::shutdown`]. Every component
//! that talks to the broker goes through the manager.

use crate::backoff::{sleep_or_cancel, BackoffPolicy};
use crate::envelope::EventClock;
use crate::{BusError, BusMessage, BusResult, Connector, DeliveryStream, EventBus, QueueConfig};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exchange shared by every catalog service
pub const DEFAULT_EXCHANGE: &str = "knowledge_nest_events";

/// Observable state of the logical broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Durable topic exchange declared on every new connection
    pub exchange: String,
    /// Upper bound on a single connect + declare attempt
    pub connect_timeout: Duration,
    /// Delay schedule for the background reconnect loop
    pub backoff: BackoffPolicy,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            connect_timeout: Duration::from_secs(2),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Owns the single logical broker connection of a process
///
/// Cloning is cheap; all clones share the same connection and lifecycle.
#[derive(Clone)]
pub struct BrokerConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    settings: BrokerSettings,
    connection: Mutex<Option<Arc<dyn EventBus>>>,
    state: watch::Sender<ConnectionState>,
    reconnecting: AtomicBool,
    shutdown: CancellationToken,
    clock: EventClock,
}

impl BrokerConnectionManager {
    /// Create a manager. No connection is opened until a channel is acquired.
    pub fn new(connector: Arc<dyn Connector>, settings: BrokerSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                settings,
                connection: Mutex::new(None),
                state,
                reconnecting: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                clock: EventClock::new(),
            }),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.inner.settings.exchange
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Timestamp source shared by every publisher on this manager
    pub fn clock(&self) -> &EventClock {
        &self.inner.clock
    }

    /// Return a ready-to-use channel, connecting first if needed
    ///
    /// Fails promptly instead of waiting for the broker: if a connect attempt
    /// fails or times out, or a background reconnect is already running, the
    /// caller gets an error and the background loop keeps retrying. Dropping
    /// the future mid-connect also hands over to the background loop.
    pub async fn acquire_channel(&self) -> BusResult<Channel> {
        if self.is_shut_down() {
            return Err(BusError::Closed);
        }

        let mut connection = self.inner.connection.lock().await;

        if let Some(conn) = connection.as_ref() {
            if conn.is_connected() {
                return Ok(Channel::new(conn.clone(), self.exchange()));
            }
            debug!("Dropping dead broker connection");
            *connection = None;
            self.set_state(ConnectionState::Disconnected);
        }

        if self.inner.reconnecting.load(Ordering::Acquire) {
            return Err(BusError::ConnectionError(format!(
                "broker {} unavailable, reconnect in progress",
                self.inner.connector.describe()
            )));
        }

        let mut attempt = ConnectAttempt {
            manager: self,
            settled: false,
        };
        let result = self.establish().await;
        attempt.settled = true;

        match result {
            Ok(conn) => {
                *connection = Some(conn.clone());
                self.set_state(ConnectionState::Connected);
                info!(
                    broker = %self.inner.connector.describe(),
                    exchange = %self.exchange(),
                    "Connected to broker"
                );
                Ok(Channel::new(conn, self.exchange()))
            }
            Err(e) => {
                drop(connection);
                warn!(
                    broker = %self.inner.connector.describe(),
                    error = %e,
                    "Broker connect failed"
                );
                self.spawn_reconnect();
                Err(e)
            }
        }
    }

    /// Report an error seen on a channel
    ///
    /// Connection-loss errors drop the current connection (if it is really
    /// gone) and start the background reconnect loop. Other errors are ignored.
    pub async fn invalidate(&self, error: &BusError) {
        if !error.is_connection_loss() || self.is_shut_down() {
            return;
        }

        let mut connection = self.inner.connection.lock().await;
        if let Some(conn) = connection.as_ref() {
            if conn.is_connected() {
                return;
            }
            let _ = conn.close().await;
        }
        *connection = None;
        drop(connection);

        warn!(error = %error, "Broker connection lost");
        self.set_state(ConnectionState::Disconnected);
        self.spawn_reconnect();
    }

    /// Close the connection and stop all reconnect attempts
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let connection = self.inner.connection.lock().await.take();
        if let Some(conn) = connection {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "Error closing broker connection");
            }
        }

        self.inner.state.send_replace(ConnectionState::Closed);
        info!("Broker connection manager shut down");
    }

    async fn establish(&self) -> BusResult<Arc<dyn EventBus>> {
        self.set_state(ConnectionState::Connecting);

        let settings = &self.inner.settings;
        let attempt = async {
            let conn = self.inner.connector.connect().await?;
            conn.declare_exchange(&settings.exchange).await?;
            Ok::<_, BusError>(conn)
        };

        let result = match tokio::time::timeout(settings.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(settings.connect_timeout.as_millis() as u64)),
        };

        if result.is_err() {
            self.set_state(ConnectionState::Disconnected);
        }
        result
    }

    fn spawn_reconnect(&self) {
        if self.is_shut_down()
            || self
                .inner
                .reconnecting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager.reconnect_loop().await;
            manager.inner.reconnecting.store(false, Ordering::Release);
        });
    }

    async fn reconnect_loop(&self) {
        let mut backoff = self.inner.settings.backoff.iter();

        loop {
            let delay = backoff.next_delay();
            debug!(
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Scheduling broker reconnect"
            );
            if !sleep_or_cancel(delay, &self.inner.shutdown).await {
                return;
            }

            match self.establish().await {
                Ok(conn) => {
                    let mut connection = self.inner.connection.lock().await;
                    if self.is_shut_down() {
                        let _ = conn.close().await;
                        return;
                    }
                    *connection = Some(conn);
                    self.set_state(ConnectionState::Connected);
                    info!(
                        broker = %self.inner.connector.describe(),
                        attempt = backoff.attempt(),
                        "Reconnected to broker"
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        attempt = backoff.attempt(),
                        error = %e,
                        "Broker reconnect failed"
                    );
                }
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }
}

/// Foreground connect attempt; if the caller drops it before it settles, the
/// state is reset and the background reconnect loop takes over
struct ConnectAttempt<'a> {
    manager: &'a BrokerConnectionManager,
    settled: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        debug!("Connect attempt abandoned by caller");
        self.manager.set_state(ConnectionState::Disconnected);
        if tokio::runtime::Handle::try_current().is_ok() {
            self.manager.spawn_reconnect();
        }
    }
}

/// A publish/consume handle on the live connection
///
/// Operations take `&mut self`, so one channel is never used by two callers at
/// once. Acquire a channel per caller or per task instead of sharing one.
pub struct Channel {
    connection: Arc<dyn EventBus>,
    exchange: String,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("exchange", &self.exchange)
            .finish_non_exhaustive()
    }
}

impl Channel {
    fn new(connection: Arc<dyn EventBus>, exchange: &str) -> Self {
        Self {
            connection,
            exchange: exchange.to_string(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_connected()
    }

    /// Publish on the shared exchange
    pub async fn publish(&mut self, message: BusMessage) -> BusResult<()> {
        self.connection.publish(&self.exchange, message).await
    }

    /// Publish on another, already declared, exchange
    pub async fn publish_to(&mut self, exchange: &str, message: BusMessage) -> BusResult<()> {
        self.connection.publish(exchange, message).await
    }

    pub async fn declare_exchange(&mut self, exchange: &str) -> BusResult<()> {
        self.connection.declare_exchange(exchange).await
    }

    /// Declare a durable queue bound to the shared exchange
    pub async fn declare_queue(&mut self, queue: &QueueConfig) -> BusResult<()> {
        self.connection.declare_queue(&self.exchange, queue).await
    }

    pub async fn consume(&mut self, queue: &QueueConfig) -> BusResult<DeliveryStream> {
        self.connection.consume(&self.exchange, queue).await
    }
}
