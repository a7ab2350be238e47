use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::{BackendRegistry, BackendState, Strategy};
use crate::proxy::RequestContext;

/// Cycles through backends in registry order.
///
/// Under concurrent topology changes the modulo base may shift between the
/// increment and the lookup; fairness is best-effort then.
pub struct RoundRobin {
    registry: Arc<BackendRegistry>,
    current: AtomicUsize,
}

impl RoundRobin {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            current: AtomicUsize::new(0),
        }
    }
}

impl Strategy for RoundRobin {
    fn name(&self) -> &'static str {
        "RoundRobin"
    }

    fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    fn invoke(&self, _request: &RequestContext) -> Option<Arc<BackendState>> {
        let backends = self.registry.get_backends();
        if backends.is_empty() {
            warn!("No backends available");
            return None;
        }

        let index = self.current.fetch_add(1, Ordering::Relaxed) % backends.len();
        let selected = backends[index].clone();
        debug!("Round-robin selected backend {} (index {})", selected.id(), index);
        Some(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::test_support::*;
    use std::collections::HashSet;

    #[test]
    fn test_round_robin() {
        let rr = RoundRobin::new(registry_with(&[("a", 1.0), ("b", 1.0), ("c", 1.0)]));

        let selections: Vec<_> = (0..6)
            .filter_map(|_| rr.invoke(&request()))
            .map(|b| b.id().to_string())
            .collect();

        assert_eq!(selections, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_cyclic_coverage_from_any_offset() {
        for n in 1..=7 {
            let ids: Vec<String> = (0..n).map(|i| format!("b{}", i)).collect();
            let backends: Vec<(&str, f64)> = ids.iter().map(|id| (id.as_str(), 1.0)).collect();
            let rr = RoundRobin::new(registry_with(&backends));

            // shift the cursor so coverage doesn't depend on starting at zero
            for _ in 0..(n * 3 + 1) {
                rr.invoke(&request());
            }

            let picked: HashSet<_> = (0..n)
                .filter_map(|_| rr.invoke(&request()))
                .map(|b| b.id().to_string())
                .collect();
            assert_eq!(picked.len(), n, "every backend picked once for n={}", n);
        }
    }

    #[test]
    fn test_removed_backend_not_selected() {
        let registry = registry_with(&[("a", 1.0), ("b", 1.0)]);
        let rr = RoundRobin::new(registry.clone());
        registry.remove_backend("a");

        for _ in 0..4 {
            assert_eq!(rr.invoke(&request()).unwrap().id(), "b");
        }
    }
}
