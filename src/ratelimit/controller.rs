use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{LimitsError, TokenBucket, UserLimits};
use crate::config::TokenBucketConfig;

/// Buckets untouched for this long are dropped once they have refilled
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

struct LimiterEntry {
    bucket: Arc<TokenBucket>,
    /// Milliseconds since the controller's epoch
    last_used: AtomicU64,
}

/// Token-bucket admission keyed by client identity.
///
/// Clients without an override use the defaults. Buckets are created on first
/// use and replaced whenever the client's limits change, so a client restarts
/// at full burst under its new rate. Admin operations on the same client are
/// serialized; different clients never share a lock.
pub struct AdmissionController {
    defaults: UserLimits,
    overrides: DashMap<String, UserLimits>,
    limiters: DashMap<String, LimiterEntry>,
    admin_locks: DashMap<String, Arc<Mutex<()>>>,
    epoch: Instant,
}

impl AdmissionController {
    pub fn new(default_rate: f64, default_burst: u32) -> Self {
        info!(
            "Initializing admission controller: rate={}, burst={}",
            default_rate, default_burst
        );
        Self {
            defaults: UserLimits::new(default_rate, default_burst),
            overrides: DashMap::new(),
            limiters: DashMap::new(),
            admin_locks: DashMap::new(),
            epoch: Instant::now(),
        }
    }

    pub fn from_config(config: &TokenBucketConfig) -> Self {
        Self::new(config.rate, config.burst)
    }

    pub fn defaults(&self) -> UserLimits {
        self.defaults
    }

    pub fn allow(&self, client_id: &str) -> bool {
        let allowed = self.limiter(client_id).allow();
        if !allowed {
            debug!("Client {} has no tokens left", client_id);
        }
        allowed
    }

    /// Take a token now and report the delay before it is covered
    pub fn reserve(&self, client_id: &str) -> Duration {
        self.limiter(client_id).reserve()
    }

    /// Suspend until a token is available; returns the time waited
    pub async fn wait(&self, client_id: &str) -> Duration {
        let limiter = self.limiter(client_id);
        limiter.wait().await
    }

    pub fn tokens(&self, client_id: &str) -> f64 {
        self.limiter(client_id).tokens()
    }

    pub fn rate(&self, client_id: &str) -> f64 {
        self.get_user_limits(client_id).rate
    }

    pub fn burst(&self, client_id: &str) -> u32 {
        self.get_user_limits(client_id).burst
    }

    pub fn has_user_limits(&self, client_id: &str) -> bool {
        self.overrides.contains_key(client_id)
    }

    /// Limits in effect for the client, defaulted when no override exists
    pub fn get_user_limits(&self, client_id: &str) -> UserLimits {
        self.overrides
            .get(client_id)
            .map(|limits| *limits)
            .unwrap_or(self.defaults)
    }

    pub fn set_user_limits(&self, client_id: &str, rate: f64, burst: u32) -> Result<(), LimitsError> {
        let limits = UserLimits::new(rate, burst);
        limits.validate()?;

        let lock = self.admin_lock(client_id);
        let _guard = lock.lock();
        self.store(client_id, limits);
        Ok(())
    }

    /// Drop the client's override. A client without one is left untouched.
    pub fn delete_user_limits(&self, client_id: &str) {
        let lock = self.admin_lock(client_id);
        let _guard = lock.lock();
        if !self.discard(client_id) {
            debug!("No limits set for client {}", client_id);
        }
    }

    /// Apply `mutator` to the limits in effect and store the result as an
    /// override. Nothing changes when the result is invalid.
    pub fn update_user_limits<F>(&self, client_id: &str, mutator: F) -> Result<UserLimits, LimitsError>
    where
        F: FnOnce(&mut UserLimits),
    {
        let lock = self.admin_lock(client_id);
        let _guard = lock.lock();

        let mut limits = self.get_user_limits(client_id);
        mutator(&mut limits);
        limits.validate()?;
        self.store(client_id, limits);
        Ok(limits)
    }

    pub fn create_user_limits(&self, client_id: &str, limits: UserLimits) -> Result<UserLimits, LimitsError> {
        limits.validate()?;
        let lock = self.admin_lock(client_id);
        let _guard = lock.lock();

        if self.has_user_limits(client_id) {
            return Err(LimitsError::AlreadyExists(client_id.to_string()));
        }
        self.store(client_id, limits);
        Ok(limits)
    }

    pub fn replace_user_limits(&self, client_id: &str, limits: UserLimits) -> Result<UserLimits, LimitsError> {
        limits.validate()?;
        let lock = self.admin_lock(client_id);
        let _guard = lock.lock();

        if !self.has_user_limits(client_id) {
            return Err(LimitsError::NotFound(client_id.to_string()));
        }
        self.store(client_id, limits);
        Ok(limits)
    }

    pub fn remove_user_limits(&self, client_id: &str) -> Result<(), LimitsError> {
        let lock = self.admin_lock(client_id);
        let _guard = lock.lock();

        if self.discard(client_id) {
            Ok(())
        } else {
            Err(LimitsError::NotFound(client_id.to_string()))
        }
    }

    /// Drop buckets idle for at least `max_idle` that have refilled to burst,
    /// along with admin locks nobody holds for clients without an override.
    /// Returns the number of buckets removed.
    pub fn cleanup(&self, max_idle: Duration) -> usize {
        let now = self.now_millis();
        let max_idle = max_idle.as_millis() as u64;
        let before = self.limiters.len();

        self.limiters.retain(|_, entry| {
            let idle = now.saturating_sub(entry.last_used.load(Ordering::Relaxed));
            idle < max_idle || entry.bucket.tokens() < entry.bucket.burst() as f64
        });
        self.admin_locks
            .retain(|client_id, lock| Arc::strong_count(lock) > 1 || self.overrides.contains_key(client_id));

        let removed = before.saturating_sub(self.limiters.len());
        debug!(
            "Cleaned up {} idle limiters, {} active, {} admin locks",
            removed,
            self.limiters.len(),
            self.admin_locks.len()
        );
        removed
    }

    /// Sweep idle buckets every `interval` until the controller is dropped.
    /// Returns `None` outside a tokio runtime.
    pub fn spawn_cleanup(controller: &Arc<Self>, interval: Duration, max_idle: Duration) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let weak: Weak<Self> = Arc::downgrade(controller);

        Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(controller) => {
                        controller.cleanup(max_idle);
                    }
                    None => break,
                }
            }
        }))
    }

    pub fn get_statistics(&self) -> serde_json::Value {
        serde_json::json!({
            "default_rate": self.defaults.rate,
            "default_burst": self.defaults.burst,
            "overrides": self.overrides.len(),
            "active_limiters": self.limiters.len(),
        })
    }

    fn admin_lock(&self, client_id: &str) -> Arc<Mutex<()>> {
        self.admin_locks
            .entry(client_id.to_string())
            .or_default()
            .clone()
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn entry_for(&self, limits: UserLimits) -> LimiterEntry {
        LimiterEntry {
            bucket: Arc::new(TokenBucket::new(limits.rate, limits.burst)),
            last_used: AtomicU64::new(self.now_millis()),
        }
    }

    fn store(&self, client_id: &str, limits: UserLimits) {
        self.overrides.insert(client_id.to_string(), limits);
        self.limiters.insert(client_id.to_string(), self.entry_for(limits));
        info!(
            "Set limits for client {}: rate={}, burst={}",
            client_id, limits.rate, limits.burst
        );
    }

    /// Remove the override and its bucket; false when there was no override
    fn discard(&self, client_id: &str) -> bool {
        if self.overrides.remove(client_id).is_none() {
            return false;
        }
        self.limiters.remove(client_id);
        info!("Removed limits for client {}", client_id);
        true
    }

    fn limiter(&self, client_id: &str) -> Arc<TokenBucket> {
        let now = self.now_millis();
        if let Some(entry) = self.limiters.get(client_id) {
            entry.last_used.store(now, Ordering::Relaxed);
            return entry.bucket.clone();
        }

        // overrides are read under the limiter entry so a concurrent store/discard
        // either lands before this insert or overwrites it
        let entry = self
            .limiters
            .entry(client_id.to_string())
            .or_insert_with(|| self.entry_for(self.get_user_limits(client_id)));
        entry.last_used.store(now, Ordering::Relaxed);
        entry.bucket.clone()
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("defaults", &self.defaults)
            .field("overrides", &self.overrides.len())
            .field("limiters", &self.limiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_allow_with_defaults() {
        let controller = AdmissionController::new(10.0, 1);

        assert!(controller.allow("user1"));
        assert!(!controller.allow("user1"));

        thread::sleep(Duration::from_millis(110));
        assert!(controller.allow("user1"));
    }

    #[test]
    fn test_clients_have_independent_buckets() {
        let controller = AdmissionController::new(1.0, 1);

        assert!(controller.allow("a"));
        assert!(controller.allow("b"));
        assert!(!controller.allow("a"));
    }

    #[test]
    fn test_user_limits_override_and_delete() {
        let controller = AdmissionController::new(10.0, 1);
        controller.set_user_limits("user2", 2.0, 2).unwrap();

        assert_eq!(controller.get_user_limits("user2"), UserLimits::new(2.0, 2));
        assert!(controller.allow("user2"));
        assert!(controller.allow("user2"));
        assert!(!controller.allow("user2"));

        controller.delete_user_limits("user2");
        assert_eq!(controller.get_user_limits("user2"), UserLimits::new(10.0, 1));
        assert!(!controller.has_user_limits("user2"));
        // a fresh default bucket
        assert!(controller.allow("user2"));
    }

    #[test]
    fn test_update_keeps_untouched_fields() {
        let controller = AdmissionController::new(10.0, 1);
        controller.set_user_limits("user3", 5.0, 1).unwrap();

        controller.update_user_limits("user3", |limits| limits.rate = 15.0).unwrap();

        assert_eq!(controller.get_user_limits("user3"), UserLimits::new(15.0, 1));
        assert_eq!(controller.rate("user3"), 15.0);
        assert_eq!(controller.burst("user3"), 1);
    }

    #[test]
    fn test_update_starts_from_defaults() {
        let controller = AdmissionController::new(10.0, 4);
        controller.update_user_limits("fresh", |limits| limits.burst = 8).unwrap();

        assert_eq!(controller.get_user_limits("fresh"), UserLimits::new(10.0, 8));
        assert!(controller.has_user_limits("fresh"));
    }

    #[test]
    fn test_limit_change_resets_bucket() {
        let controller = AdmissionController::new(1.0, 1);
        assert!(controller.allow("user"));
        assert!(!controller.allow("user"));

        controller.set_user_limits("user", 1.0, 3).unwrap();
        assert!((controller.tokens("user") - 3.0).abs() < 0.01);
    }

    #[test]
    fn test_concurrent_admin_and_admission() {
        let controller = Arc::new(AdmissionController::new(100.0, 10));

        let workers: Vec<_> = (0..10)
            .map(|_| {
                let controller = controller.clone();
                thread::spawn(move || {
                    for j in 0..100u32 {
                        controller.allow("user4");
                        controller.get_user_limits("user4");
                        controller.set_user_limits("user4", (j % 10 + 1) as f64, j % 5 + 1).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let limits = controller.get_user_limits("user4");
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_concurrent_allow_never_overdraws() {
        let controller = Arc::new(AdmissionController::new(0.001, 50));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let controller = controller.clone();
                thread::spawn(move || (0..20).filter(|_| controller.allow("shared")).count())
            })
            .collect();
        let admitted: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();

        assert_eq!(admitted, 50);
    }

    #[test]
    fn test_reserve_reports_delay() {
        let controller = AdmissionController::new(2.0, 1);

        assert!(controller.reserve("user5") <= Duration::from_millis(1));

        let delay = controller.reserve("user5");
        let expected = Duration::from_millis(500);
        assert!(
            delay >= expected.mul_f64(0.9) && delay <= expected.mul_f64(1.1),
            "delay was {:?}",
            delay
        );
    }

    #[test]
    fn test_checked_admin_operations() {
        let controller = AdmissionController::new(10.0, 1);
        let limits = UserLimits::new(3.0, 2);

        assert_eq!(
            controller.replace_user_limits("u", limits),
            Err(LimitsError::NotFound("u".to_string()))
        );
        assert_eq!(controller.remove_user_limits("u"), Err(LimitsError::NotFound("u".to_string())));

        assert_eq!(controller.create_user_limits("u", limits), Ok(limits));
        assert_eq!(
            controller.create_user_limits("u", limits),
            Err(LimitsError::AlreadyExists("u".to_string()))
        );

        let updated = UserLimits::new(6.0, 4);
        assert_eq!(controller.replace_user_limits("u", updated), Ok(updated));
        assert_eq!(controller.get_user_limits("u"), updated);

        assert!(matches!(
            controller.create_user_limits("v", UserLimits::new(0.0, 1)),
            Err(LimitsError::Invalid { .. })
        ));
        assert!(!controller.has_user_limits("v"));

        assert_eq!(controller.remove_user_limits("u"), Ok(()));
        assert_eq!(controller.get_user_limits("u"), controller.defaults());
    }

    #[test]
    fn test_delete_without_override_keeps_bucket() {
        let controller = AdmissionController::new(0.001, 1);
        assert!(controller.allow("u"));
        assert!(!controller.allow("u"));

        controller.delete_user_limits("u");

        assert!(!controller.allow("u"));
        assert_eq!(controller.get_user_limits("u"), controller.defaults());
    }

    #[test]
    fn test_invalid_limits_leave_state_unchanged() {
        let controller = AdmissionController::new(10.0, 1);
        controller.set_user_limits("u", 2.0, 2).unwrap();
        assert!(controller.allow("u"));

        assert!(matches!(
            controller.update_user_limits("u", |limits| limits.burst = 0),
            Err(LimitsError::Invalid { .. })
        ));
        assert!(matches!(
            controller.set_user_limits("u", -1.0, 3),
            Err(LimitsError::Invalid { .. })
        ));
        assert!(controller.update_user_limits("fresh", |limits| limits.rate = 0.0).is_err());

        assert_eq!(controller.get_user_limits("u"), UserLimits::new(2.0, 2));
        // same bucket, one token already spent
        assert!(controller.allow("u"));
        assert!(!controller.allow("u"));
        assert!(!controller.has_user_limits("fresh"));
    }

    #[test]
    fn test_concurrent_updates_are_atomic() {
        let controller = Arc::new(AdmissionController::new(10.0, 3));
        let threads = 8;
        let rounds = 250;

        let workers: Vec<_> = (0..threads)
            .map(|_| {
                let controller = controller.clone();
                thread::spawn(move || {
                    for _ in 0..rounds {
                        controller.update_user_limits("u", |limits| limits.burst += 1).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(controller.burst("u"), 3 + threads * rounds);
    }

    #[test]
    fn test_cleanup_evicts_idle_full_buckets() {
        let controller = AdmissionController::new(1000.0, 2);
        assert!(controller.allow("idle"));
        controller.set_user_limits("custom", 1000.0, 5).unwrap();
        controller.allow("custom");

        // nothing is idle yet
        assert_eq!(controller.cleanup(Duration::from_secs(60)), 0);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(controller.cleanup(Duration::from_millis(10)), 2);
        assert_eq!(controller.get_statistics()["active_limiters"], 0);

        // overrides survive and apply to the recreated bucket
        assert_eq!(controller.get_user_limits("custom"), UserLimits::new(1000.0, 5));
        assert!((controller.tokens("custom") - 5.0).abs() < 0.01);
    }

    #[test]
    fn test_cleanup_keeps_partially_drained_buckets() {
        let controller = AdmissionController::new(0.001, 3);
        assert!(controller.allow("slow"));

        thread::sleep(Duration::from_millis(20));
        assert_eq!(controller.cleanup(Duration::from_millis(5)), 0);
        assert!(controller.tokens("slow") < 3.0);
    }

    #[tokio::test]
    async fn test_spawned_cleanup_stops_with_controller() {
        let controller = Arc::new(AdmissionController::new(1000.0, 1));
        controller.allow("c");

        let handle = AdmissionController::spawn_cleanup(
            &controller,
            Duration::from_millis(20),
            Duration::from_millis(1),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.get_statistics()["active_limiters"], 0);

        drop(controller);
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_returns_elapsed() {
        let controller = AdmissionController::new(10.0, 1);
        controller.wait("w").await;

        let waited = controller.wait("w").await;
        assert!(waited >= Duration::from_millis(80), "waited {:?}", waited);
    }
}
