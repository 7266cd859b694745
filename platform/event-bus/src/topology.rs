//! Routing keys, binding patterns, and queue declarations
//!
//! Routing keys are `.`-separated words such as `course.enrolled`. Binding
//! patterns use the same words plus two wildcards:
//!
//! - `*` matches exactly one word (`course.*` matches `course.created`)
//! - `>` matches one or more trailing words and must come last (`>` alone is the catch-all)
//!
//! A routing key that a production queue is bound to must never be renamed:
//! the binding keeps matching the old name and delivery silently stops.

use crate::{BusError, BusResult};
use std::fmt;
use std::str::FromStr;

const SINGLE_WORD: &str = "*";
const TAIL: &str = ">";

/// Validate a concrete routing key (no wildcards, no empty words)
pub fn validate_routing_key(key: &str) -> BusResult<()> {
    if key.is_empty() {
        return Err(BusError::InvalidRoutingKey("routing key is empty".to_string()));
    }

    for word in key.split('.') {
        if word.is_empty() {
            return Err(BusError::InvalidRoutingKey(format!(
                "'{key}' contains an empty word"
            )));
        }
        if word.contains('*') || word.contains('>') || word.chars().any(char::is_whitespace) {
            return Err(BusError::InvalidRoutingKey(format!(
                "'{key}' contains a wildcard or whitespace"
            )));
        }
    }

    Ok(())
}

/// A binding pattern for a queue or a dispatcher entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingPattern {
    raw: String,
}

impl RoutingPattern {
    pub fn parse(pattern: &str) -> BusResult<Self> {
        if pattern.is_empty() {
            return Err(BusError::InvalidPattern("pattern is empty".to_string()));
        }

        let words: Vec<&str> = pattern.split('.').collect();
        for (idx, word) in words.iter().enumerate() {
            match *word {
                "" => {
                    return Err(BusError::InvalidPattern(format!(
                        "'{pattern}' contains an empty word"
                    )))
                }
                SINGLE_WORD => {}
                TAIL if idx == words.len() - 1 => {}
                TAIL => {
                    return Err(BusError::InvalidPattern(format!(
                        "'{pattern}': '>' is only allowed as the last word"
                    )))
                }
                literal if literal.contains('*') || literal.contains('>') => {
                    return Err(BusError::InvalidPattern(format!(
                        "'{pattern}': wildcards must occupy a whole word"
                    )))
                }
                literal if literal.chars().any(char::is_whitespace) => {
                    return Err(BusError::InvalidPattern(format!(
                        "'{pattern}' contains whitespace"
                    )))
                }
                _ => {}
            }
        }

        Ok(Self {
            raw: pattern.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the pattern has no wildcards and therefore names a single routing key
    pub fn is_exact(&self) -> bool {
        self.raw
            .split('.')
            .all(|word| word != SINGLE_WORD && word != TAIL)
    }

    /// Check if a routing key matches this pattern
    ///
    /// # Examples
    /// - `course.*` matches `course.created` and `course.enrolled`
    /// - `course.*` does NOT match `review.created` or `course.enrolled.late`
    /// - `course.>` matches `course.enrolled.late`
    pub fn matches(&self, routing_key: &str) -> bool {
        let key_words: Vec<&str> = routing_key.split('.').collect();
        let pattern_words: Vec<&str> = self.raw.split('.').collect();

        let mut k_idx = 0;
        let mut p_idx = 0;

        while k_idx < key_words.len() && p_idx < pattern_words.len() {
            let pattern_word = pattern_words[p_idx];

            if pattern_word == TAIL {
                // `>` swallows everything left, and there is at least one word left
                return true;
            } else if pattern_word == SINGLE_WORD || key_words[k_idx] == pattern_word {
                k_idx += 1;
                p_idx += 1;
            } else {
                return false;
            }
        }

        k_idx == key_words.len() && p_idx == pattern_words.len()
    }
}

impl FromStr for RoutingPattern {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RoutingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A durable queue owned by one consumer service
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Queue name; an internal deployment concern, not part of the public contract
    pub name: String,
    /// Patterns the queue is bound to on the shared exchange
    pub patterns: Vec<RoutingPattern>,
    /// Maximum unacknowledged deliveries per subscription (0 means unlimited)
    pub prefetch: u16,
    /// Total delivery attempts before a transiently failing message is dropped
    pub max_deliveries: u32,
}

impl QueueConfig {
    pub fn new<S: AsRef<str>>(name: impl Into<String>, patterns: &[S]) -> BusResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(BusError::InvalidPattern("queue name is empty".to_string()));
        }
        if patterns.is_empty() {
            return Err(BusError::InvalidPattern(format!(
                "queue '{name}' needs at least one binding pattern"
            )));
        }

        let patterns = patterns
            .iter()
            .map(|p| RoutingPattern::parse(p.as_ref()))
            .collect::<BusResult<Vec<_>>>()?;

        Ok(Self {
            name,
            patterns,
            prefetch: 10,
            max_deliveries: 5,
        })
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    /// Whether any binding of this queue matches `routing_key`
    pub fn accepts(&self, routing_key: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(routing_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(p: &str) -> RoutingPattern {
        RoutingPattern::parse(p).unwrap()
    }

    #[test]
    fn test_pattern_matching() {
        // Exact match
        assert!(pattern("course.created").matches("course.created"));
        assert!(!pattern("course.created").matches("course.enrolled"));

        // Single wildcard
        assert!(pattern("course.*").matches("course.created"));
        assert!(pattern("course.*").matches("course.enrolled"));
        assert!(pattern("*.created").matches("review.created"));
        assert!(!pattern("course.*").matches("review.created"));
        assert!(!pattern("course.*").matches("user.registered"));
        assert!(!pattern("course.*").matches("course.enrolled.late"));
        assert!(!pattern("course.*").matches("course"));

        // Tail wildcard
        assert!(pattern("course.>").matches("course.enrolled.late"));
        assert!(pattern("course.>").matches("course.created"));
        assert!(!pattern("course.>").matches("course"));
        assert!(pattern(">").matches("user.registered"));
        assert!(pattern(">").matches("single"));
    }

    #[test]
    fn test_pattern_parse_rejects_malformed() {
        assert!(RoutingPattern::parse("").is_err());
        assert!(RoutingPattern::parse("course..created").is_err());
        assert!(RoutingPattern::parse(">.created").is_err());
        assert!(RoutingPattern::parse("course.cre*").is_err());
        assert!(RoutingPattern::parse("course. created").is_err());
        assert!("course.*".parse::<RoutingPattern>().is_ok());
    }

    #[test]
    fn test_is_exact() {
        assert!(pattern("user.registered").is_exact());
        assert!(!pattern("user.*").is_exact());
        assert!(!pattern(">").is_exact());
    }

    #[test]
    fn test_validate_routing_key() {
        assert!(validate_routing_key("review.created").is_ok());
        assert!(validate_routing_key("standalone").is_ok());
        assert!(validate_routing_key("").is_err());
        assert!(validate_routing_key("review.").is_err());
        assert!(validate_routing_key("review.*").is_err());
        assert!(validate_routing_key("review.>").is_err());
        assert!(validate_routing_key("review created").is_err());
    }

    #[test]
    fn test_queue_config() {
        let queue = QueueConfig::new("notification_queue", &["user.*", "course.*"])
            .unwrap()
            .with_prefetch(4)
            .with_max_deliveries(0);

        assert_eq!(queue.prefetch, 4);
        assert_eq!(queue.max_deliveries, 1);
        assert!(queue.accepts("course.enrolled"));
        assert!(!queue.accepts("review.created"));

        let empty: [&str; 0] = [];
        assert!(QueueConfig::new("q", &empty).is_err());
        assert!(QueueConfig::new(" ", &["user.*"]).is_err());
        assert!(QueueConfig::new("q", &["user..x"]).is_err());
    }
}
