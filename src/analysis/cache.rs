//! Short-lived memo of computed metrics, one entry per window.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use super::aggregator::Metrics;
use crate::runs::DateWindow;

pub struct MetricsCache {
    ttl: Duration,
    entries: RwLock<HashMap<DateWindow, (Instant, Arc<Metrics>)>>,
}

impl MetricsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, window: &DateWindow, now: Instant) -> Option<Arc<Metrics>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(window)
            .filter(|(stored_at, _)| now.saturating_duration_since(*stored_at) < self.ttl)
            .map(|(_, metrics)| Arc::clone(metrics))
    }

    pub fn put(&self, window: DateWindow, metrics: Arc<Metrics>, now: Instant) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, (stored_at, _)| now.saturating_duration_since(*stored_at) < self.ttl);
        entries.insert(window, (now, metrics));
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
