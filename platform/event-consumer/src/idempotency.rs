use moka::sync::Cache;
use std::fmt;
use uuid::Uuid;

/// Bounded record of event ids whose handler already succeeded
///
/// Backed by a size-bounded cache; ids are evicted once `capacity` is reached.
/// Handlers stay idempotent on their own; this only spares them the common
/// redelivery cases.
#[derive(Clone)]
pub struct ProcessedEvents {
    capacity: u64,
    ids: Cache<Uuid, ()>,
}

impl ProcessedEvents {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1) as u64;
        Self {
            capacity,
            ids: Cache::builder().max_capacity(capacity).build(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn contains(&self, event_id: &Uuid) -> bool {
        self.ids.contains_key(event_id)
    }

    /// Record `event_id`; returns `false` if it was already recorded
    pub fn insert(&self, event_id: Uuid) -> bool {
        self.ids.entry(event_id).or_insert(()).is_fresh()
    }

    pub fn len(&self) -> usize {
        self.ids.run_pending_tasks();
        self.ids.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ProcessedEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessedEvents")
            .field("capacity", &self.capacity)
            .field("entries", &self.ids.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_reports_duplicates() {
        let processed = ProcessedEvents::new(10);
        let id = Uuid::new_v4();

        assert!(processed.insert(id));
        assert!(!processed.insert(id));
        assert!(processed.contains(&id));
        assert_eq!(processed.len(), 1);
    }

    #[test]
    fn test_size_stays_within_capacity() {
        let processed = ProcessedEvents::new(50);
        for _ in 0..500 {
            processed.insert(Uuid::new_v4());
        }

        assert!(processed.len() <= 50);
        assert_eq!(processed.capacity(), 50);
    }

    #[test]
    fn test_clones_share_entries() {
        let processed = ProcessedEvents::new(10);
        let other = processed.clone();
        let id = Uuid::new_v4();

        assert!(processed.insert(id));
        assert!(other.contains(&id));
        assert!(!other.insert(id));
    }
}
