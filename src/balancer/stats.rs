use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use super::backend::BackendState;

pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Periodic stats refresh for one backend.
///
/// The task only holds a weak handle; it exits on its own once the state is
/// dropped, and is aborted when the owning registry entry goes away.
#[derive(Debug)]
pub struct StatsCollector {
    handle: JoinHandle<()>,
}

impl StatsCollector {
    /// Start ticking for `state`. Returns `None` outside a tokio runtime.
    pub fn spawn(state: &Arc<BackendState>, period: Duration) -> Option<Self> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let weak: Weak<BackendState> = Arc::downgrade(state);
        let backend_id = state.id().to_string();

        let handle = runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(state) => state.refresh_stats(std::time::Instant::now()),
                    None => break,
                }
            }
            debug!("Stats collector for backend {} exited", backend_id);
        });

        Some(Self { handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for StatsCollector {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::backend::BackendDescriptor;

    #[tokio::test]
    async fn test_collector_refreshes_periodically() {
        let state = Arc::new(BackendState::new(BackendDescriptor::new("b1", "http://localhost:1", 1.0)));
        let _collector = StatsCollector::spawn(&state, Duration::from_millis(20)).unwrap();

        state.record_outcome(Duration::from_millis(40), true);
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(state.load_stats().avg_response_time, Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_collector_stops_when_dropped() {
        let state = Arc::new(BackendState::new(BackendDescriptor::new("b1", "http://localhost:1", 1.0)));
        let collector = StatsCollector::spawn(&state, Duration::from_millis(10)).unwrap();
        let handle_finished = {
            drop(state);
            tokio::time::sleep(Duration::from_millis(60)).await;
            collector.is_finished()
        };

        assert!(handle_finished);
    }

    #[test]
    fn test_no_collector_outside_runtime() {
        let state = Arc::new(BackendState::new(BackendDescriptor::new("b1", "http://localhost:1", 1.0)));
        assert!(StatsCollector::spawn(&state, DEFAULT_STATS_INTERVAL).is_none());
    }
}
