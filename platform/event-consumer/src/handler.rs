use async_trait::async_trait;
use event_bus::EventEnvelope;
use std::fmt::Display;
use std::future::Future;

/// Failure reported by a handler
///
/// The handler decides whether retrying can help. Transient errors are
/// requeued up to the queue's delivery bound; permanent errors are dropped at once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Retriable errors (downstream unavailable, timeouts, etc.)
    #[error("transient error: {0}")]
    Transient(String),

    /// Not retriable (bad payload, business rule violation)
    #[error("permanent error: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(reason: impl Display) -> Self {
        Self::Transient(reason.to_string())
    }

    pub fn permanent(reason: impl Display) -> Self {
        Self::Permanent(reason.to_string())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A payload that does not match its event type will never parse on retry
impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Permanent(format!("invalid payload: {e}"))
    }
}

/// Handles one kind of event
///
/// Deliveries are at-least-once, so `handle` may see the same envelope more
/// than once and must tolerate that.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a handler
///
/// ```rust
/// use event_consumer::{handler_fn, Dispatcher, HandlerError};
///
/// let dispatcher = Dispatcher::new()
///     .on("user.registered", handler_fn(|envelope| async move {
///         tracing::info!(event_id = ?envelope.event_id, "welcome");
///         Ok::<(), HandlerError>(())
///     }))
///     .unwrap();
/// assert!(dispatcher.route("user.registered").is_some());
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        (self.f)(envelope.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_errors_are_permanent() {
        let err: HandlerError = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_fn_handler_runs_closure() {
        let handler = handler_fn(|envelope: EventEnvelope| async move {
            if envelope.data["fail"] == true {
                Err(HandlerError::transient("asked to fail"))
            } else {
                Ok(())
            }
        });

        let ok = EventEnvelope::new("user.registered", json!({"fail": false}));
        let bad = EventEnvelope::new("user.registered", json!({"fail": true}));

        assert!(handler.handle(&ok).await.is_ok());
        assert_eq!(
            handler.handle(&bad).await,
            Err(HandlerError::Transient("asked to fail".to_string()))
        );
    }
}
