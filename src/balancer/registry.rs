use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use super::backend::{BackendDescriptor, BackendState};
use super::stats::{StatsCollector, DEFAULT_STATS_INTERVAL};

struct Entry {
    state: Arc<BackendState>,
    _collector: Option<StatsCollector>,
}

#[derive(Default)]
struct RegistryInner {
    order: Vec<String>,
    entries: HashMap<String, Entry>,
}

/// Concurrency-safe map from backend id to its live state.
///
/// Structural changes take the write lock; everything else reads. Iteration
/// follows insertion order. Dropping the registry stops every stats task.
pub struct BackendRegistry {
    inner: RwLock<RegistryInner>,
    stats_interval: Duration,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::with_stats_interval(DEFAULT_STATS_INTERVAL)
    }

    pub fn with_stats_interval(stats_interval: Duration) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            stats_interval,
        }
    }

    /// Add a backend, replacing any previous entry with the same id
    pub fn add_backend(&self, descriptor: BackendDescriptor) -> Arc<BackendState> {
        debug!("Adding backend: id={}, url={}, weight={:.2}", descriptor.id, descriptor.url, descriptor.weight);

        let id = descriptor.id.clone();
        let state = Arc::new(BackendState::new(descriptor));
        let collector = StatsCollector::spawn(&state, self.stats_interval);

        let mut inner = self.inner.write();
        let previous = inner.entries.insert(
            id.clone(),
            Entry {
                state: state.clone(),
                _collector: collector,
            },
        );
        if previous.is_none() {
            inner.order.push(id.clone());
        }

        debug!("Backend {} added, total backends: {}", id, inner.order.len());
        state
    }

    /// Remove a backend; unknown ids are ignored
    pub fn remove_backend(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.entries.remove(id).is_some() {
            inner.order.retain(|existing| existing != id);
            debug!("Backend {} removed, remaining backends: {}", id, inner.order.len());
            true
        } else {
            debug!("Attempted to remove unknown backend: {}", id);
            false
        }
    }

    pub fn get_backend(&self, id: &str) -> Option<Arc<BackendState>> {
        let inner = self.inner.read();
        let state = inner.entries.get(id).map(|entry| entry.state.clone());
        if state.is_none() {
            debug!("Requested unknown backend: {}", id);
        }
        state
    }

    /// Point-in-time copy of the backend handles, in insertion order
    pub fn get_backends(&self) -> Vec<Arc<BackendState>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id).map(|entry| entry.state.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn inc_active_connections(&self, id: &str) {
        if let Some(state) = self.get_backend(id) {
            let count = state.inc_active_connections();
            debug!("Active connections for backend {}: {}", id, count);
        } else {
            debug!("Attempted to increment connections for unknown backend: {}", id);
        }
    }

    pub fn dec_active_connections(&self, id: &str) {
        if let Some(state) = self.get_backend(id) {
            let count = state.dec_active_connections();
            debug!("Active connections for backend {}: {}", id, count);
        } else {
            debug!("Attempted to decrement connections for unknown backend: {}", id);
        }
    }

    pub fn update_response_time(&self, id: &str, duration: Duration) {
        if let Some(state) = self.get_backend(id) {
            let previous = state.update_response_time(duration);
            debug!(
                "Response time for backend {}: {}ms -> {}ms",
                id,
                previous.as_millis(),
                duration.as_millis()
            );
        } else {
            debug!("Attempted to update response time for unknown backend: {}", id);
        }
    }

    pub fn record_outcome(&self, id: &str, duration: Duration, success: bool) {
        if let Some(state) = self.get_backend(id) {
            state.record_outcome(duration, success);
        } else {
            debug!("Attempted to record outcome for unknown backend: {}", id);
        }
    }

    pub fn set_weight(&self, id: &str, weight: f64) {
        if let Some(state) = self.get_backend(id) {
            state.set_weight(weight);
            debug!("Weight for backend {} set to {:.2}", id, weight);
        } else {
            debug!("Attempted to set weight for unknown backend: {}", id);
        }
    }

    /// Registry statistics for the admin surface
    pub fn statistics(&self) -> serde_json::Value {
        let backends = self.get_backends();
        let total_connections: i64 = backends.iter().map(|b| b.active_connections()).sum();

        serde_json::json!({
            "total_backends": backends.len(),
            "total_active_connections": total_connections,
            "backends": backends.iter().map(|b| b.statistics()).collect::<Vec<_>>(),
        })
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.inner.read().order)
            .finish()
    }
}
