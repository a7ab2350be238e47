//! Continuous-refill token bucket for a single client.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

/// Holds up to `burst` tokens, refilled at `rate` tokens per second.
///
/// `reserve` always takes a token, letting the balance go negative, and
/// reports how long the caller must wait before it is covered. `allow` only
/// takes a token that is already there. All mutations happen under one lock,
/// so concurrent callers never consume more tokens than they requested.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: u32,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket that starts full
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Take a token if one is available right now
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Take a token and return how long until it is actually available.
    /// `Duration::MAX` means it never will be and nothing was taken.
    pub fn reserve(&self) -> Duration {
        self.reserve_at(Instant::now())
    }

    /// Suspend the calling task until a token is available. Returns the time spent waiting.
    pub async fn wait(&self) -> Duration {
        let start = tokio::time::Instant::now();
        let delay = self.reserve();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        start.elapsed()
    }

    /// Tokens currently available; negative while reservations are outstanding
    pub fn tokens(&self) -> f64 {
        let state = self.state.lock();
        self.advance(&state, Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        let tokens = self.advance(&state, now);
        if tokens >= 1.0 {
            state.tokens = tokens - 1.0;
            state.last = now;
            true
        } else {
            false
        }
    }

    fn reserve_at(&self, now: Instant) -> Duration {
        if self.burst < 1 {
            return Duration::MAX;
        }

        let mut state = self.state.lock();
        let tokens = self.advance(&state, now) - 1.0;
        let delay = if tokens < 0.0 {
            match self.duration_for(-tokens) {
                Some(delay) => delay,
                None => return Duration::MAX,
            }
        } else {
            Duration::ZERO
        };

        state.tokens = tokens;
        state.last = now;
        delay
    }

    /// Balance at `now` without committing it
    fn advance(&self, state: &BucketState, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        let refilled = state.tokens + elapsed * self.rate;
        refilled.min(self.burst as f64)
    }

    fn duration_for(&self, tokens: f64) -> Option<Duration> {
        if self.rate <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(tokens / self.rate).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_full_and_refills() {
        let bucket = TokenBucket::new(10.0, 1);
        let start = Instant::now();

        assert!(bucket.allow_at(start));
        assert!(!bucket.allow_at(start));
        assert!(!bucket.allow_at(start + Duration::from_millis(50)));
        assert!(bucket.allow_at(start + Duration::from_millis(101)));
    }

    #[test]
    fn test_refill_capped_at_burst() {
        let bucket = TokenBucket::new(100.0, 3);
        let later = Instant::now() + Duration::from_secs(60);

        assert!(bucket.allow_at(later));
        assert!(bucket.allow_at(later));
        assert!(bucket.allow_at(later));
        assert!(!bucket.allow_at(later));
    }

    #[test]
    fn test_reserve_goes_into_debt() {
        let bucket = TokenBucket::new(2.0, 1);
        let now = Instant::now();

        assert_eq!(bucket.reserve_at(now), Duration::ZERO);
        assert_eq!(bucket.reserve_at(now), Duration::from_millis(500));
        assert_eq!(bucket.reserve_at(now), Duration::from_secs(1));

        // outstanding reservations block allow until repaid
        assert!(!bucket.allow_at(now + Duration::from_millis(900)));
        assert!(bucket.allow_at(now + Duration::from_millis(1500)));
    }

    #[test]
    fn test_zero_rate_never_refills() {
        let bucket = TokenBucket::new(0.0, 1);
        let now = Instant::now();

        assert_eq!(bucket.reserve_at(now), Duration::ZERO);
        assert_eq!(bucket.reserve_at(now + Duration::from_secs(3600)), Duration::MAX);
        assert!(!bucket.allow_at(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_tokens_reflects_balance() {
        let bucket = TokenBucket::new(1.0, 5);
        assert!((bucket.tokens() - 5.0).abs() < 1e-6);

        bucket.allow();
        bucket.allow();
        let tokens = bucket.tokens();
        assert!(tokens > 2.9 && tokens < 3.1, "tokens were {}", tokens);
    }

    #[tokio::test]
    async fn test_wait_suspends_until_token() {
        let bucket = TokenBucket::new(20.0, 1);
        assert!(bucket.wait().await < Duration::from_millis(10));

        let waited = bucket.wait().await;
        assert!(waited >= Duration::from_millis(40), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(500), "waited {:?}", waited);
    }
}
