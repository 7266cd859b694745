//! Notification handlers for catalog events
//!
//! Each handler decodes the typed payload, composes one [`Notification`] and
//! hands it to a [`NotificationSink`]. Composing is pure, so replaying an
//! event produces the same notification again and nothing else.

use async_trait::async_trait;
use catalog_contracts::{CourseCreated, CourseEnrolled, ReviewCreated, UserRegistered};
use event_bus::{BusResult, DomainEvent, EventEnvelope};
use event_consumer::{Dispatcher, EventHandler, HandlerError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_USER_NAME: &str = "User";
const DEFAULT_COURSE_TITLE: &str = "Course";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Welcome,
    NewCourse,
    EnrollmentConfirmation,
    ReviewThanks,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    /// Event that caused this notification, used by sinks to de-duplicate
    pub event_id: Option<Uuid>,
    /// None for broadcasts
    pub user_id: Option<i64>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),

    #[error("notification rejected: {0}")]
    Rejected(String),
}

impl From<SinkError> for HandlerError {
    fn from(e: SinkError) -> Self {
        match e {
            SinkError::Unavailable(_) => HandlerError::transient(e),
            SinkError::Rejected(_) => HandlerError::permanent(e),
        }
    }
}

/// Where composed notifications go
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), SinkError>;
}

/// Writes notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), SinkError> {
        tracing::info!(
            kind = ?notification.kind,
            user_id = ?notification.user_id,
            event_id = ?notification.event_id,
            "{}",
            notification.message
        );
        Ok(())
    }
}

/// A catalog event that turns into a notification
pub trait Notify: DomainEvent + DeserializeOwned + Send + Sync {
    fn compose(&self) -> Result<(NotificationKind, Option<i64>, String), HandlerError>;
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.trim().is_empty() {
        default
    } else {
        value
    }
}

impl Notify for UserRegistered {
    fn compose(&self) -> Result<(NotificationKind, Option<i64>, String), HandlerError> {
        let name = or_default(&self.name, DEFAULT_USER_NAME);
        Ok((
            NotificationKind::Welcome,
            Some(self.user_id),
            format!("Welcome to the course catalog, {name}! A confirmation was sent to {}", self.email),
        ))
    }
}

impl Notify for CourseCreated {
    fn compose(&self) -> Result<(NotificationKind, Option<i64>, String), HandlerError> {
        let title = or_default(&self.title, DEFAULT_COURSE_TITLE);
        Ok((
            NotificationKind::NewCourse,
            None,
            format!("New course available: {title}"),
        ))
    }
}

impl Notify for CourseEnrolled {
    fn compose(&self) -> Result<(NotificationKind, Option<i64>, String), HandlerError> {
        let title = or_default(&self.course_title, DEFAULT_COURSE_TITLE);
        Ok((
            NotificationKind::EnrollmentConfirmation,
            Some(self.user_id),
            format!("You are enrolled in {title} (enrollment {})", self.enrollment_id),
        ))
    }
}

impl Notify for ReviewCreated {
    fn compose(&self) -> Result<(NotificationKind, Option<i64>, String), HandlerError> {
        self.validate().map_err(HandlerError::permanent)?;
        Ok((
            NotificationKind::ReviewThanks,
            Some(self.user_id),
            format!(
                "Thanks for your {}-star review of course {}",
                self.rating, self.course_id
            ),
        ))
    }
}

/// Handler for one event type `E`
pub struct NotificationHandler<E> {
    sink: Arc<dyn NotificationSink>,
    _event: PhantomData<fn() -> E>,
}

impl<E> NotificationHandler<E> {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            _event: PhantomData,
        }
    }
}

#[async_trait]
impl<E: Notify + 'static> EventHandler for NotificationHandler<E> {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let event: E = envelope.decode_data()?;
        let (kind, user_id, message) = event.compose()?;

        let notification = Notification {
            kind,
            event_id: envelope.event_id,
            user_id,
            message,
        };
        self.sink.deliver(&notification).await?;
        Ok(())
    }
}

/// Routing table for the notification queue
pub fn build_dispatcher(sink: Arc<dyn NotificationSink>) -> BusResult<Dispatcher> {
    Dispatcher::new()
        .on(
            UserRegistered::ROUTING_KEY,
            NotificationHandler::<UserRegistered>::new(sink.clone()),
        )?
        .on(
            CourseCreated::ROUTING_KEY,
            NotificationHandler::<CourseCreated>::new(sink.clone()),
        )?
        .on(
            CourseEnrolled::ROUTING_KEY,
            NotificationHandler::<CourseEnrolled>::new(sink.clone()),
        )?
        .on(
            ReviewCreated::ROUTING_KEY,
            NotificationHandler::<ReviewCreated>::new(sink),
        )
}
