//! Static routing from event type to handler
//!
//! Exact keys are looked up first; wildcard patterns are then tried in
//! registration order. An event type with no match is not an error: the
//! consumer acknowledges it and moves on, so producers can add events before
//! consumers learn about them.

use crate::handler::EventHandler;
use event_bus::{BusError, BusResult, RoutingPattern};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct Dispatcher {
    exact: HashMap<String, Arc<dyn EventHandler>>,
    patterns: Vec<(RoutingPattern, Arc<dyn EventHandler>)>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an exact key or a wildcard pattern
    pub fn register(&mut self, pattern: &str, handler: Arc<dyn EventHandler>) -> BusResult<()> {
        let pattern = RoutingPattern::parse(pattern)?;

        if pattern.is_exact() {
            if self.exact.contains_key(pattern.as_str()) {
                return Err(duplicate(&pattern));
            }
            self.exact.insert(pattern.as_str().to_string(), handler);
        } else {
            if self.patterns.iter().any(|(p, _)| p == &pattern) {
                return Err(duplicate(&pattern));
            }
            self.patterns.push((pattern, handler));
        }

        Ok(())
    }

    /// Builder form of [`Dispatcher::register`]
    pub fn on<H: EventHandler + 'static>(mut self, pattern: &str, handler: H) -> BusResult<Self> {
        self.register(pattern, Arc::new(handler))?;
        Ok(self)
    }

    pub fn route(&self, event_type: &str) -> Option<&Arc<dyn EventHandler>> {
        self.exact.get(event_type).or_else(|| {
            self.patterns
                .iter()
                .find(|(pattern, _)| pattern.matches(event_type))
                .map(|(_, handler)| handler)
        })
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn duplicate(pattern: &RoutingPattern) -> BusError {
    BusError::InvalidPattern(format!("handler already registered for '{pattern}'"))
}
