use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::config::BackendConfig;

/// Number of per-request durations kept for the rolling average
pub const RESPONSE_WINDOW: usize = 60;

/// Immutable description of an upstream server
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    pub id: String,
    pub url: String,
    pub weight: f64,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_connections: usize,
}

impl BackendDescriptor {
    pub fn new(id: impl Into<String>, url: impl Into<String>, weight: f64) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            weight,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            max_connections: 0,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            id: config.id.clone(),
            url: config.url.clone(),
            weight: config.weight.unwrap_or(1.0),
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            max_connections: config.max_connections,
        }
    }
}

/// Derived load figures, refreshed by the stats task
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadStats {
    pub active_connections: i64,
    pub avg_response_time: Duration,
    pub requests_per_second: f64,
    pub success_rate: f64,
}

#[derive(Debug)]
struct StatsView {
    requests_per_second: f64,
    success_rate: f64,
    avg_response_time: Duration,
    last_tick: Instant,
}

/// Fixed ring of recent response times; unused slots stay zero
#[derive(Debug)]
struct ResponseWindow {
    samples: [Duration; RESPONSE_WINDOW],
    next: usize,
}

impl ResponseWindow {
    fn new() -> Self {
        Self {
            samples: [Duration::ZERO; RESPONSE_WINDOW],
            next: 0,
        }
    }

    fn push(&mut self, sample: Duration) {
        self.samples[self.next] = sample;
        self.next = (self.next + 1) % RESPONSE_WINDOW;
    }

    fn average(&self) -> Option<Duration> {
        let (total, count) = self
            .samples
            .iter()
            .filter(|d| !d.is_zero())
            .fold((Duration::ZERO, 0u32), |(total, count), d| (total + *d, count + 1));

        if count == 0 {
            None
        } else {
            Some(total / count)
        }
    }
}

/// Mutable per-backend record owned by the registry.
///
/// Counters are independent atomics so connection accounting never waits on
/// the registry's structural lock. Derived stats sit behind their own lock.
#[derive(Debug)]
pub struct BackendState {
    descriptor: BackendDescriptor,
    active_connections: AtomicI64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    response_time_ms: AtomicU64,
    weight_bits: AtomicU64,
    tick_requests: AtomicU64,
    tick_successes: AtomicU64,
    window: Mutex<ResponseWindow>,
    stats: RwLock<StatsView>,
}

impl BackendState {
    pub fn new(descriptor: BackendDescriptor) -> Self {
        let weight = descriptor.weight;
        Self {
            descriptor,
            active_connections: AtomicI64::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            response_time_ms: AtomicU64::new(0),
            weight_bits: AtomicU64::new(weight.to_bits()),
            tick_requests: AtomicU64::new(0),
            tick_successes: AtomicU64::new(0),
            window: Mutex::new(ResponseWindow::new()),
            stats: RwLock::new(StatsView {
                requests_per_second: 0.0,
                success_rate: 1.0,
                avg_response_time: Duration::ZERO,
                last_tick: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn url(&self) -> &str {
        &self.descriptor.url
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    pub fn weight(&self) -> f64 {
        f64::from_bits(self.weight_bits.load(Ordering::Acquire))
    }

    pub fn set_weight(&self, weight: f64) {
        self.weight_bits.store(weight.to_bits(), Ordering::Release);
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn inc_active_connections(&self) -> i64 {
        self.active_connections.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement, saturating at zero
    pub fn dec_active_connections(&self) -> i64 {
        match self.active_connections.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            if current > 0 {
                Some(current - 1)
            } else {
                None
            }
        }) {
            Ok(previous) => previous - 1,
            Err(current) => current,
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn response_time(&self) -> Duration {
        Duration::from_millis(self.response_time_ms.load(Ordering::Relaxed))
    }

    /// Returns the previously stored response time
    pub fn update_response_time(&self, duration: Duration) -> Duration {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(self.response_time_ms.swap(millis, Ordering::Relaxed))
    }

    /// Record a finished request against this backend
    pub fn record_outcome(&self, duration: Duration, success: bool) {
        self.window.lock().push(duration);
        self.update_response_time(duration);

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.tick_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.tick_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fold the counters gathered since the previous tick into the stats view
    pub fn refresh_stats(&self, now: Instant) {
        let mut stats = self.stats.write();

        let elapsed = now.saturating_duration_since(stats.last_tick).as_secs_f64();
        if elapsed > 0.0 {
            let requests = self.tick_requests.swap(0, Ordering::AcqRel);
            let successes = self.tick_successes.swap(0, Ordering::AcqRel);

            stats.requests_per_second = requests as f64 / elapsed;
            if requests > 0 {
                stats.success_rate = successes.min(requests) as f64 / requests as f64;
            }
            stats.last_tick = now;
        }

        if let Some(avg) = self.window.lock().average() {
            stats.avg_response_time = avg;
        }
    }

    pub fn load_stats(&self) -> LoadStats {
        let stats = self.stats.read();
        LoadStats {
            active_connections: self.active_connections(),
            avg_response_time: stats.avg_response_time,
            requests_per_second: stats.requests_per_second,
            success_rate: stats.success_rate,
        }
    }

    pub fn statistics(&self) -> serde_json::Value {
        let load = self.load_stats();
        serde_json::json!({
            "id": self.id(),
            "url": self.url(),
            "weight": self.weight(),
            "active_connections": load.active_connections,
            "total_requests": self.total_requests(),
            "failed_requests": self.failed_requests(),
            "last_response_time_ms": self.response_time().as_millis() as u64,
            "avg_response_time_ms": load.avg_response_time.as_millis() as u64,
            "requests_per_second": load.requests_per_second,
            "success_rate": load.success_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> BackendState {
        BackendState::new(BackendDescriptor::new("b1", "http://127.0.0.1:9001", 1.0))
    }

    #[test]
    fn test_connection_count_never_negative() {
        let backend = state();

        assert_eq!(backend.dec_active_connections(), 0);
        assert_eq!(backend.active_connections(), 0);

        backend.inc_active_connections();
        backend.inc_active_connections();
        assert_eq!(backend.dec_active_connections(), 1);
        assert_eq!(backend.dec_active_connections(), 0);
        assert_eq!(backend.dec_active_connections(), 0);
    }

    #[test]
    fn test_refresh_computes_rps_and_success_rate() {
        let backend = state();
        let start = backend.stats.read().last_tick;

        for _ in 0..3 {
            backend.record_outcome(Duration::from_millis(10), true);
        }
        backend.record_outcome(Duration::from_millis(30), false);

        backend.refresh_stats(start + Duration::from_secs(2));
        let load = backend.load_stats();

        assert!((load.requests_per_second - 2.0).abs() < 1e-9);
        assert!((load.success_rate - 0.75).abs() < 1e-9);
        assert_eq!(load.avg_response_time, Duration::from_millis(15));
        assert_eq!(backend.total_requests(), 4);
        assert_eq!(backend.failed_requests(), 1);

        // an idle tick resets the rate but keeps the last success rate
        backend.refresh_stats(start + Duration::from_secs(3));
        let load = backend.load_stats();
        assert_eq!(load.requests_per_second, 0.0);
        assert!((load.success_rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_response_window_keeps_last_sixty() {
        let backend = state();

        for _ in 0..RESPONSE_WINDOW {
            backend.record_outcome(Duration::from_millis(100), true);
        }
        for _ in 0..RESPONSE_WINDOW {
            backend.record_outcome(Duration::from_millis(20), true);
        }

        backend.refresh_stats(Instant::now() + Duration::from_secs(1));
        assert_eq!(backend.load_stats().avg_response_time, Duration::from_millis(20));
        assert_eq!(backend.response_time(), Duration::from_millis(20));
    }

    #[test]
    fn test_weight_is_mutable() {
        let backend = state();
        assert_eq!(backend.weight(), 1.0);

        backend.set_weight(3.5);
        assert_eq!(backend.weight(), 3.5);
        assert_eq!(backend.descriptor().weight, 1.0);
    }
}
