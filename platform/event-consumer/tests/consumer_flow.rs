//! End-to-end consumer behaviour against the in-memory broker

use event_bus::{
    BackoffPolicy, BrokerConnectionManager, BrokerSettings, BusMessage, Connector,
    EventEnvelope, EventPublisher, InMemoryBroker, PublisherConfig, QueueConfig,
};
use event_consumer::{
    handler_fn, spawn_consumers, ConsumerConfig, ConsumerHandle, ConsumerHealth, Dispatcher,
    EventConsumer, HandlerError,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const QUEUE: &str = "notification_queue";

fn fast_settings() -> BrokerSettings {
    BrokerSettings {
        connect_timeout: Duration::from_millis(200),
        backoff: BackoffPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            multiplier: 2.0,
            jitter: 0.0,
        },
        ..Default::default()
    }
}

struct Harness {
    broker: InMemoryBroker,
    manager: BrokerConnectionManager,
    publisher: EventPublisher,
    cancel: CancellationToken,
}

impl Harness {
    fn new() -> Self {
        let broker = InMemoryBroker::new();
        let manager = BrokerConnectionManager::new(Arc::new(broker.clone()), fast_settings());
        let publisher = EventPublisher::new(manager.clone(), PublisherConfig::default());
        Self {
            broker,
            manager,
            publisher,
            cancel: CancellationToken::new(),
        }
    }

    fn queue(&self, patterns: &[&str]) -> QueueConfig {
        QueueConfig::new(QUEUE, patterns).unwrap()
    }

    fn spawn(&self, dispatcher: Dispatcher, config: ConsumerConfig, instances: usize) -> Vec<ConsumerHandle> {
        spawn_consumers(
            &self.manager,
            Arc::new(dispatcher),
            config,
            instances,
            &self.cancel,
        )
    }

    async fn stop(self, handles: Vec<ConsumerHandle>) {
        self.cancel.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle.join())
                .await
                .expect("consumer did not stop");
        }
        self.manager.shutdown().await;
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

async fn wait_healthy(handles: &[ConsumerHandle]) {
    for handle in handles {
        let mut rx = handle.health_receiver();
        tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|h| h.is_healthy()))
            .await
            .expect("consumer never became healthy")
            .expect("health channel closed");
    }
}

type Seen = Arc<Mutex<Vec<EventEnvelope>>>;

fn recording(seen: &Seen) -> impl event_consumer::EventHandler {
    let seen = seen.clone();
    handler_fn(move |envelope: EventEnvelope| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(envelope);
            Ok::<(), HandlerError>(())
        }
    })
}

#[tokio::test]
async fn user_registered_is_delivered_once_and_acked() {
    let harness = Harness::new();
    let seen: Seen = Arc::default();
    let dispatcher = Dispatcher::new()
        .on("user.registered", recording(&seen))
        .unwrap();
    let handles = harness.spawn(
        dispatcher,
        ConsumerConfig::new(harness.queue(&["user.*", "course.*", "review.*"])),
        1,
    );
    wait_healthy(&handles).await;

    let outcome = harness
        .publisher
        .publish(
            "user.registered",
            &json!({"user_id": 123, "email": "a@b.com", "name": "A"}),
        )
        .await;
    assert!(outcome.is_published());

    eventually("ack", || handles[0].stats().acked == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].event_type, "user.registered");
    assert_eq!(seen[0].data["user_id"], 123);
    assert_eq!(harness.broker.queue_depth(QUEUE), 0);

    harness.stop(handles).await;
}

#[tokio::test]
async fn course_pattern_queue_never_sees_other_entities() {
    let harness = Harness::new();
    let seen: Seen = Arc::default();
    let dispatcher = Dispatcher::new().on(">", recording(&seen)).unwrap();
    let handles = harness.spawn(dispatcher, ConsumerConfig::new(harness.queue(&["course.*"])), 1);
    wait_healthy(&handles).await;

    for key in ["course.created", "review.created", "user.registered", "course.enrolled"] {
        harness.publisher.publish(key, &json!({"id": 1})).await;
    }

    eventually("two course events", || handles[0].stats().acked == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let types: Vec<String> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.event_type.clone())
        .collect();
    assert_eq!(types, vec!["course.created", "course.enrolled"]);

    harness.stop(handles).await;
}

#[tokio::test]
async fn sequential_publishes_arrive_in_order() {
    let harness = Harness::new();
    let seen: Seen = Arc::default();
    let dispatcher = Dispatcher::new().on("course.enrolled", recording(&seen)).unwrap();
    let handles = harness.spawn(dispatcher, ConsumerConfig::new(harness.queue(&["course.*"])), 1);
    wait_healthy(&handles).await;

    for i in 0..20 {
        harness
            .publisher
            .publish("course.enrolled", &json!({"enrollment_id": i}))
            .await;
    }

    eventually("all enrollments", || handles[0].stats().acked == 20).await;
    let ids: Vec<i64> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.data["enrollment_id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, (0..20).collect::<Vec<_>>());

    harness.stop(handles).await;
}

#[tokio::test]
async fn transient_failures_are_redelivered_then_acked() {
    let harness = Harness::new();
    let attempts = Arc::new(AtomicU32::new(0));
    let dispatcher = Dispatcher::new()
        .on("review.created", {
            let attempts = attempts.clone();
            handler_fn(move |_envelope: EventEnvelope| {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(HandlerError::transient("mail server unavailable"))
                    } else {
                        Ok(())
                    }
                }
            })
        })
        .unwrap();
    let handles = harness.spawn(dispatcher, ConsumerConfig::new(harness.queue(&["review.*"])), 1);
    wait_healthy(&handles).await;

    harness
        .publisher
        .publish(
            "review.created",
            &json!({"review_id": 7, "user_id": 1, "course_id": 2, "rating": 5, "has_comment": true}),
        )
        .await;

    eventually("ack after retries", || handles[0].stats().acked == 1).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(handles[0].stats().requeued, 2);
    assert_eq!(harness.broker.queue_depth(QUEUE), 0);

    harness.stop(handles).await;
}

#[tokio::test]
async fn exhausted_retries_are_dead_lettered_and_loop_continues() {
    let harness = Harness::new();

    let observer = harness.broker.connect().await.unwrap();
    observer.declare_exchange("dead_letters").await.unwrap();
    observer
        .declare_queue(
            "dead_letters",
            &QueueConfig::new("dead_letter_queue", &[">"]).unwrap(),
        )
        .await
        .unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let seen: Seen = Arc::default();
    let dispatcher = Dispatcher::new()
        .on("review.created", {
            let attempts = attempts.clone();
            handler_fn(move |_envelope: EventEnvelope| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(HandlerError::transient("always down"))
                }
            })
        })
        .unwrap()
        .on("user.registered", recording(&seen))
        .unwrap();

    let queue = harness.queue(&["review.*", "user.*"]).with_max_deliveries(3);
    let handles = harness.spawn(
        dispatcher,
        ConsumerConfig::new(queue).with_dead_letter_exchange("dead_letters"),
        1,
    );
    wait_healthy(&handles).await;

    harness.publisher.publish("review.created", &json!({"review_id": 1})).await;
    harness.publisher.publish("user.registered", &json!({"user_id": 2})).await;

    eventually("drop", || handles[0].stats().dropped == 1).await;
    eventually("next message", || seen.lock().unwrap().len() == 1).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(harness.broker.ready_count("dead_letter_queue"), 1);
    assert_eq!(harness.broker.queue_depth(QUEUE), 0);

    harness.stop(handles).await;
}

#[tokio::test]
async fn permanent_failure_is_dropped_without_retry() {
    let harness = Harness::new();
    let attempts = Arc::new(AtomicU32::new(0));
    let dispatcher = Dispatcher::new()
        .on("course.created", {
            let attempts = attempts.clone();
            handler_fn(move |envelope: EventEnvelope| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let _title: String = serde_json::from_value(envelope.data["title"].clone())?;
                    Ok::<(), HandlerError>(())
                }
            })
        })
        .unwrap();
    let handles = harness.spawn(dispatcher, ConsumerConfig::new(harness.queue(&["course.*"])), 1);
    wait_healthy(&handles).await;

    harness
        .publisher
        .publish("course.created", &json!({"course_id": 1, "title": 42}))
        .await;

    eventually("drop", || handles[0].stats().dropped == 1).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    harness.stop(handles).await;
}

#[tokio::test]
async fn poison_message_is_rejected_and_loop_continues() {
    let harness = Harness::new();
    let seen: Seen = Arc::default();
    let dispatcher = Dispatcher::new().on("user.registered", recording(&seen)).unwrap();
    let handles = harness.spawn(dispatcher, ConsumerConfig::new(harness.queue(&["user.*"])), 1);
    wait_healthy(&handles).await;

    let mut channel = harness.manager.acquire_channel().await.unwrap();
    channel
        .publish(BusMessage::new("user.registered", b"not json".to_vec()))
        .await
        .unwrap();
    channel
        .publish(BusMessage::new(
            "user.registered",
            br#"{"event_type":"user.registered","timestamp":"2024-01-01T00:00:00Z","data":"x"}"#
                .to_vec(),
        ))
        .await
        .unwrap();
    harness.publisher.publish("user.registered", &json!({"user_id": 5})).await;

    eventually("valid event", || seen.lock().unwrap().len() == 1).await;
    let stats = handles[0].stats();
    assert_eq!(stats.poison, 2);
    assert_eq!(stats.dropped, 2);
    assert_eq!(harness.broker.queue_depth(QUEUE), 0);

    harness.stop(handles).await;
}

#[tokio::test]
async fn unknown_event_types_are_acknowledged() {
    let harness = Harness::new();
    let dispatcher = Dispatcher::new()
        .on("user.registered", handler_fn(|_e: EventEnvelope| async { Ok::<(), HandlerError>(()) }))
        .unwrap();
    let handles = harness.spawn(dispatcher, ConsumerConfig::new(harness.queue(&["user.*"])), 1);
    wait_healthy(&handles).await;

    harness.publisher.publish("user.deactivated", &json!({"user_id": 1})).await;

    eventually("unrouted ack", || handles[0].stats().unrouted == 1).await;
    assert_eq!(handles[0].stats().acked, 1);
    assert_eq!(harness.broker.queue_depth(QUEUE), 0);

    harness.stop(handles).await;
}

#[tokio::test]
async fn replayed_event_id_does_not_reinvoke_handler() {
    let harness = Harness::new();
    let seen: Seen = Arc::default();
    let dispatcher = Dispatcher::new().on("course.enrolled", recording(&seen)).unwrap();
    let handles = harness.spawn(dispatcher, ConsumerConfig::new(harness.queue(&["course.*"])), 1);
    wait_healthy(&handles).await;

    let envelope = EventEnvelope::new("course.enrolled", json!({"enrollment_id": 3}));
    harness.publisher.publish_envelope(&envelope).await.unwrap();
    harness.publisher.publish_envelope(&envelope).await.unwrap();

    eventually("duplicate detected", || handles[0].stats().duplicates == 1).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(handles[0].stats().acked, 2);

    harness.stop(handles).await;
}

#[tokio::test]
async fn competing_instances_share_the_queue() {
    let harness = Harness::new();
    let seen: Seen = Arc::default();
    let dispatcher = Dispatcher::new().on("course.*", recording(&seen)).unwrap();
    let queue = harness.queue(&["course.*"]).with_prefetch(1);
    let handles = harness.spawn(dispatcher, ConsumerConfig::new(queue), 3);
    wait_healthy(&handles).await;
    assert_eq!(harness.broker.consumer_count(QUEUE), 3);

    for i in 0..30 {
        harness
            .publisher
            .publish("course.created", &json!({"course_id": i}))
            .await;
    }

    eventually("all processed", || seen.lock().unwrap().len() == 30).await;
    let mut ids: Vec<i64> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.data["course_id"].as_i64().unwrap())
        .collect();
    ids.sort();
    assert_eq!(ids, (0..30).collect::<Vec<_>>());

    let per_instance: Vec<u64> = handles.iter().map(|h| h.stats().acked).collect();
    assert_eq!(per_instance.iter().sum::<u64>(), 30);
    assert!(per_instance.iter().all(|&n| n > 0), "{per_instance:?}");

    harness.stop(handles).await;
}

#[tokio::test]
async fn consumer_waits_for_broker_at_startup() {
    let harness = Harness::new();
    harness.broker.set_available(false);

    let seen: Seen = Arc::default();
    let dispatcher = Dispatcher::new().on("user.registered", recording(&seen)).unwrap();
    let handles = harness.spawn(dispatcher, ConsumerConfig::new(harness.queue(&["user.*"])), 1);

    eventually("unhealthy", || {
        matches!(handles[0].health(), ConsumerHealth::Unhealthy(_))
    })
    .await;

    harness.broker.set_available(true);
    wait_healthy(&handles).await;

    harness.publisher.publish("user.registered", &json!({"user_id": 9})).await;
    eventually("delivery after recovery", || seen.lock().unwrap().len() == 1).await;

    harness.stop(handles).await;
}

#[tokio::test]
async fn consumer_resubscribes_after_connection_loss() {
    let harness = Harness::new();
    let seen: Seen = Arc::default();
    let dispatcher = Dispatcher::new().on("course.created", recording(&seen)).unwrap();
    let handles = harness.spawn(dispatcher, ConsumerConfig::new(harness.queue(&["course.*"])), 1);
    wait_healthy(&handles).await;

    harness.broker.set_available(false);
    eventually("unhealthy", || !handles[0].health().is_healthy()).await;

    harness.broker.set_available(true);
    wait_healthy(&handles).await;

    harness.publisher.publish("course.created", &json!({"course_id": 1})).await;
    eventually("delivery after reconnect", || seen.lock().unwrap().len() == 1).await;

    harness.stop(handles).await;
}

#[tokio::test]
async fn cancellation_lets_in_flight_handler_finish() {
    let harness = Harness::new();
    let finished = Arc::new(AtomicU32::new(0));
    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
    let started_tx = Arc::new(Mutex::new(Some(started_tx)));

    let dispatcher = Dispatcher::new()
        .on("course.enrolled", {
            let finished = finished.clone();
            handler_fn(move |_envelope: EventEnvelope| {
                let finished = finished.clone();
                let started_tx = started_tx.clone();
                async move {
                    if let Some(tx) = started_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            })
        })
        .unwrap();

    let consumer = EventConsumer::new(
        harness.manager.clone(),
        Arc::new(dispatcher),
        ConsumerConfig::new(harness.queue(&["course.*"])),
    );
    let stats = consumer.stats();
    let mut health = consumer.health();
    let task = tokio::spawn(consumer.run(harness.cancel.clone()));
    tokio::time::timeout(Duration::from_secs(3), health.wait_for(|h| h.is_healthy()))
        .await
        .unwrap()
        .unwrap();

    harness
        .publisher
        .publish("course.enrolled", &json!({"enrollment_id": 1}))
        .await;
    tokio::time::timeout(Duration::from_secs(2), started_rx)
        .await
        .unwrap()
        .unwrap();

    harness.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(stats.snapshot().acked, 1);
    assert_eq!(*health.borrow(), ConsumerHealth::Stopped);
    assert_eq!(harness.broker.queue_depth(QUEUE), 0);

    harness.manager.shutdown().await;
}
