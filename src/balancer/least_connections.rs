use std::sync::Arc;

use tracing::{debug, warn};

use super::{BackendRegistry, BackendState, Strategy};
use crate::proxy::RequestContext;

/// Picks the backend with the fewest active connections and counts the new
/// connection against it. Ties go to the earliest backend in registry order.
pub struct LeastConnections {
    registry: Arc<BackendRegistry>,
}

impl LeastConnections {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self { registry }
    }
}

impl Strategy for LeastConnections {
    fn name(&self) -> &'static str {
        "LeastConnections"
    }

    fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    fn invoke(&self, _request: &RequestContext) -> Option<Arc<BackendState>> {
        let backends = self.registry.get_backends();
        let mut selected = match backends.first() {
            Some(first) => first,
            None => {
                warn!("No backends available");
                return None;
            }
        };

        let mut fewest = selected.active_connections();
        for backend in backends.iter().skip(1) {
            let active = backend.active_connections();
            if active < fewest {
                fewest = active;
                selected = backend;
            }
        }

        let count = selected.inc_active_connections();
        debug!("Least-connections selected backend {} ({} active)", selected.id(), count);
        Some(selected.clone())
    }

    fn counts_connections(&self) -> bool {
        true
    }
}
