//! Backend registry, live stats and the selection strategies built on them.

pub mod backend;
pub mod least_connections;
pub mod registry;
pub mod round_robin;
pub mod stats;
pub mod weighted;

use std::sync::Arc;

use tracing::info;

use crate::config::{Config, LoadBalancingMethod};
use crate::proxy::RequestContext;

pub use backend::{BackendDescriptor, BackendState, LoadStats};
pub use least_connections::LeastConnections;
pub use registry::BackendRegistry;
pub use round_robin::RoundRobin;
pub use weighted::WeightedRoundRobin;

/// A backend selection algorithm over a shared registry.
///
/// `invoke` returning `None` means no backend is available; the caller treats
/// that as terminal for the request.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn registry(&self) -> &Arc<BackendRegistry>;

    fn invoke(&self, request: &RequestContext) -> Option<Arc<BackendState>>;

    fn add_backend(&self, descriptor: BackendDescriptor) {
        self.registry().add_backend(descriptor);
    }

    fn remove_backend(&self, id: &str) {
        self.registry().remove_backend(id);
    }

    fn set_weight(&self, id: &str, weight: f64) {
        self.registry().set_weight(id, weight);
    }

    /// Whether `invoke` already counted the chosen backend's connection
    fn counts_connections(&self) -> bool {
        false
    }
}

pub fn build_strategy(method: LoadBalancingMethod, registry: Arc<BackendRegistry>) -> Arc<dyn Strategy> {
    match method {
        LoadBalancingMethod::RoundRobin => Arc::new(RoundRobin::new(registry)),
        LoadBalancingMethod::WeightedRoundRobin => Arc::new(WeightedRoundRobin::new(registry)),
        LoadBalancingMethod::LeastConnections => Arc::new(LeastConnections::new(registry)),
    }
}

/// Build a fresh registry and strategy populated from the configured backends
pub fn from_config(config: &Config) -> Arc<dyn Strategy> {
    let strategy = build_strategy(config.load_balancer.method, Arc::new(BackendRegistry::new()));
    for backend in &config.backends {
        strategy.add_backend(BackendDescriptor::from_config(backend));
    }

    info!(
        "Created {} balancer with {} backends",
        strategy.name(),
        strategy.registry().len()
    );
    strategy
}
