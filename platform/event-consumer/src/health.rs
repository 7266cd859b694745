use serde::Serialize;

/// Liveness of one consumer instance, as reported to the health endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ConsumerHealth {
    /// Not yet subscribed
    Starting,
    /// Subscribed and receiving
    Healthy,
    /// Waiting for the broker; retrying in the background
    Unhealthy(String),
    /// Receive loop has exited
    Stopped,
}

impl ConsumerHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ConsumerHealth::Healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialized_shape() {
        assert_eq!(
            serde_json::to_value(ConsumerHealth::Healthy).unwrap(),
            json!({"status": "healthy"})
        );
        assert_eq!(
            serde_json::to_value(ConsumerHealth::Unhealthy("broker down".into())).unwrap(),
            json!({"status": "unhealthy", "reason": "broker down"})
        );
    }
}
