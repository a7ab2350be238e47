pub mod logging;
pub mod metrics;

pub use logging::LogHandle;
pub use metrics::MetricsCollector;
