use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{BackendDescriptor, BackendRegistry, BackendState, Strategy};
use crate::proxy::RequestContext;

/// Positions per selection cycle
const CYCLE: u64 = 1000;

/// Weighted round-robin over a deterministic 1000-step cycle.
///
/// Each invocation maps the advancing counter onto `[0, total_weight)` and
/// walks backends accumulating weight until the point is reached. Weight
/// changes take the write side of `weights` so a selection always sees a
/// consistent total.
pub struct WeightedRoundRobin {
    registry: Arc<BackendRegistry>,
    current: AtomicU64,
    weights: RwLock<()>,
}

impl WeightedRoundRobin {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            current: AtomicU64::new(0),
            weights: RwLock::new(()),
        }
    }
}

fn effective_weight(weight: f64) -> f64 {
    if weight > 0.0 && weight.is_finite() {
        weight
    } else {
        1.0
    }
}

impl Strategy for WeightedRoundRobin {
    fn name(&self) -> &'static str {
        "WeightedRoundRobin"
    }

    fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    fn add_backend(&self, descriptor: BackendDescriptor) {
        let _guard = self.weights.write();
        let weight = effective_weight(descriptor.weight);
        let state = self.registry.add_backend(descriptor);
        state.set_weight(weight);
    }

    fn set_weight(&self, id: &str, weight: f64) {
        let _guard = self.weights.write();
        self.registry.set_weight(id, effective_weight(weight));
    }

    fn invoke(&self, _request: &RequestContext) -> Option<Arc<BackendState>> {
        let _guard = self.weights.read();

        let backends = self.registry.get_backends();
        let last = match backends.last() {
            Some(last) => last.clone(),
            None => {
                warn!("No backends available");
                return None;
            }
        };

        let total_weight: f64 = backends.iter().map(|b| b.weight()).sum();
        let next = self.current.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let target = (next % CYCLE) as f64 / CYCLE as f64 * total_weight;

        let mut accumulated = 0.0;
        for backend in &backends {
            accumulated += backend.weight();
            if accumulated >= target {
                debug!(
                    "Weighted round-robin selected backend {} (target {:.3} of {:.3})",
                    backend.id(),
                    target,
                    total_weight
                );
                return Some(backend.clone());
            }
        }

        debug!("Weighted round-robin fell back to last backend {}", last.id());
        Some(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::test_support::*;
    use std::collections::HashMap;

    fn weighted(backends: &[(&str, f64)]) -> WeightedRoundRobin {
        let wrr = WeightedRoundRobin::new(Arc::new(BackendRegistry::new()));
        for (id, weight) in backends {
            wrr.add_backend(BackendDescriptor::new(*id, format!("http://{}.local", id), *weight));
        }
        wrr
    }

    fn frequencies(wrr: &WeightedRoundRobin, invocations: usize) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for _ in 0..invocations {
            let backend = wrr.invoke(&request()).unwrap();
            *counts.entry(backend.id().to_string()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_non_positive_weight_defaults_to_one() {
        let wrr = weighted(&[("a", 0.0), ("b", -2.0), ("c", 2.5)]);

        assert_eq!(wrr.registry().get_backend("a").unwrap().weight(), 1.0);
        assert_eq!(wrr.registry().get_backend("b").unwrap().weight(), 1.0);
        assert_eq!(wrr.registry().get_backend("c").unwrap().weight(), 2.5);
    }

    #[test]
    fn test_frequencies_converge_to_weights() {
        let weights = [("a", 1.0), ("b", 2.0), ("c", 5.0)];
        let wrr = weighted(&weights);
        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        let invocations = 10_000;

        let counts = frequencies(&wrr, invocations);
        for (id, weight) in weights {
            let expected = weight / total;
            let observed = counts.get(id).copied().unwrap_or(0) as f64 / invocations as f64;
            assert!(
                (observed - expected).abs() <= expected * 0.10,
                "backend {} observed {:.4}, expected {:.4}",
                id,
                observed,
                expected
            );
        }
    }

    #[test]
    fn test_weight_change_shifts_distribution() {
        let wrr = weighted(&[("a", 1.0), ("b", 1.0)]);
        wrr.set_weight("b", 3.0);

        let counts = frequencies(&wrr, 4_000);
        let share_b = counts["b"] as f64 / 4_000.0;
        assert!((share_b - 0.75).abs() < 0.075, "share of b was {:.3}", share_b);
    }

    #[test]
    fn test_single_backend_always_selected() {
        let wrr = weighted(&[("only", 0.5)]);
        for _ in 0..50 {
            assert_eq!(wrr.invoke(&request()).unwrap().id(), "only");
        }
    }

    #[test]
    fn test_registry_weight_registered_outside_strategy() {
        let registry = registry_with(&[("a", 1.0)]);
        let wrr = WeightedRoundRobin::new(registry);
        assert_eq!(wrr.invoke(&request()).unwrap().id(), "a");
    }

    #[test]
    fn test_unreachable_target_falls_back_to_last() {
        let wrr = weighted(&[("a", 1.0), ("b", 1.0), ("c", 1.0)]);
        // bypasses the strategy's weight normalisation
        wrr.registry().set_weight("a", f64::NAN);

        for _ in 0..20 {
            assert_eq!(wrr.invoke(&request()).unwrap().id(), "c");
        }
    }
}
