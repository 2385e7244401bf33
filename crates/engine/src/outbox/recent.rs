//! Bounded memory of recently delivered server message ids

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Server ids seen recently, with TTL and max-entry bounds
pub struct RecentIds {
    seen: HashMap<String, Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl RecentIds {
    pub fn with_capacity(ttl: Duration, max_entries: usize) -> Self {
        Self {
            seen: HashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    fn is_expired(&self, at: Instant) -> bool {
        at.elapsed() > self.ttl
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.get(id).is_some_and(|at| !self.is_expired(*at))
    }

    /// Remember `id`. Returns false if it was already known (a duplicate).
    /// Evicts expired entries, then the oldest, when at capacity.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.contains(id) {
            return false;
        }

        if self.seen.len() >= self.max_entries {
            let ttl = self.ttl;
            self.seen.retain(|_, at| at.elapsed() <= ttl);
        }

        if self.seen.len() >= self.max_entries {
            if let Some(oldest) = self
                .seen
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(id, _)| id.clone())
            {
                self.seen.remove(&oldest);
            }
        }

        self.seen.insert(id.to_string(), Instant::now());
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
