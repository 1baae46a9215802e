//! Backup metrics: aggregation over stored runs, with a TTL cache.

pub mod aggregator;
pub mod cache;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::runs::DateWindow;
use crate::storage::{RunStore, StoreError};

pub use aggregator::{DailySize, LastBackup, Metrics, MetricsAggregator};
pub use cache::MetricsCache;

/// Metrics backed by the run store. Blocking; call from `spawn_blocking`.
#[derive(Clone)]
pub struct MetricsService {
    store: RunStore,
    cache: Arc<MetricsCache>,
}

impl MetricsService {
    pub fn new(store: RunStore, ttl: Duration) -> Self {
        Self {
            store,
            cache: Arc::new(MetricsCache::new(ttl)),
        }
    }

    pub fn metrics(&self, window: DateWindow) -> Result<Arc<Metrics>, StoreError> {
        let now = Instant::now();
        if let Some(hit) = self.cache.get(&window, now) {
            return Ok(hit);
        }
        let runs = self.store.in_window(&window)?;
        let metrics = Arc::new(MetricsAggregator::compute(&runs, window));
        self.cache.put(window, Arc::clone(&metrics), now);
        Ok(metrics)
    }

    /// Drop cached results after new runs were written.
    pub fn invalidate(&self) {
        self.cache.clear();
    }
}
