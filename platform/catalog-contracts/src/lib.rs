//! Catalog Event Contracts
//!
//! The stable public contract between catalog services: the exchange name,
//! the routing keys, and the `data` payload of each event.
//!
//! IMPORTANT: Routing keys are bound by consumers in production. Never rename
//! one; add a new event type instead.

use event_bus::DomainEvent;
use serde::{Deserialize, Serialize};

/// Durable topic exchange shared by every catalog service
pub const EXCHANGE: &str = event_bus::DEFAULT_EXCHANGE;

pub const USER_REGISTERED: &str = "user.registered";
pub const COURSE_CREATED: &str = "course.created";
pub const COURSE_ENROLLED: &str = "course.enrolled";
pub const REVIEW_CREATED: &str = "review.created";

/// Every routing key in the catalog vocabulary
pub const ALL_EVENT_TYPES: [&str; 4] = [USER_REGISTERED, COURSE_CREATED, COURSE_ENROLLED, REVIEW_CREATED];

/// Emitted by the auth service after a successful registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRegistered {
    pub user_id: i64,
    pub email: String,
    /// Display name; older producers may omit it
    #[serde(default)]
    pub name: String,
}

impl DomainEvent for UserRegistered {
    const ROUTING_KEY: &'static str = USER_REGISTERED;
}

/// Emitted by the course service when a course is added to the catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CourseCreated {
    pub course_id: i64,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
}

impl DomainEvent for CourseCreated {
    const ROUTING_KEY: &'static str = COURSE_CREATED;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CourseEnrolled {
    pub enrollment_id: i64,
    pub user_id: i64,
    pub course_id: i64,
    /// Denormalized so the consumer needs no course lookup
    #[serde(default)]
    pub course_title: String,
}

impl DomainEvent for CourseEnrolled {
    const ROUTING_KEY: &'static str = COURSE_ENROLLED;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewCreated {
    pub review_id: i64,
    pub user_id: i64,
    pub course_id: i64,
    /// Star rating (1-5)
    pub rating: u8,
    /// Whether the review carries free-text feedback
    pub has_comment: bool,
}

impl DomainEvent for ReviewCreated {
    const ROUTING_KEY: &'static str = REVIEW_CREATED;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error("rating {0} is outside 1-5")]
    RatingOutOfRange(u8),
}

impl ReviewCreated {
    /// Reject ratings the review service would never produce
    pub fn validate(&self) -> Result<(), ContractError> {
        if (1..=5).contains(&self.rating) {
            Ok(())
        } else {
            Err(ContractError::RatingOutOfRange(self.rating))
        }
    }
}
