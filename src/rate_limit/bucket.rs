use crate::clock::{Clock, MonotonicClock};
use crate::error::ConfigError;
use crate::rate_limit::Limiter;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const TOKEN_EPSILON: f64 = 1e-6;

/// A continuous token bucket.
///
/// Replenishes tokens at a fixed `rate` per second, up to `capacity`. Tokens
/// are fractional, so rates below one per second (one request every 50s) work
/// without rounding to whole ticks.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    rate: f64,
    capacity: u32,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill_nanos: u64,
}

/// Validate bucket parameters; shared with the limiter store.
pub(crate) fn validate(rate: f64, capacity: u32) -> Result<(), ConfigError> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(ConfigError::InvalidRate { provided: rate });
    }
    if capacity == 0 {
        return Err(ConfigError::InvalidBurst { provided: capacity });
    }
    Ok(())
}

impl TokenBucketLimiter {
    /// Create a full bucket with `rate` tokens/sec and room for `capacity` tokens.
    ///
    /// # Examples
    /// ```
    /// use turnstile::rate_limit::{Limiter, TokenBucketLimiter};
    /// let bucket = TokenBucketLimiter::new(0.02, 1).unwrap();
    /// assert!(bucket.allow());
    /// assert!(!bucket.allow());
    /// ```
    pub fn new(rate: f64, capacity: u32) -> Result<Self, ConfigError> {
        Self::with_clock(rate, capacity, Arc::new(MonotonicClock::default()))
    }

    /// Create a full bucket reading time from `clock`.
    pub fn with_clock(
        rate: f64,
        capacity: u32,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        validate(rate, capacity)?;
        Ok(Self::from_validated(rate, capacity, clock))
    }

    pub(crate) fn from_validated(rate: f64, capacity: u32, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_nanos();
        Self {
            rate,
            capacity,
            state: Mutex::new(BucketState { tokens: f64::from(capacity), last_refill_nanos: now }),
            clock,
        }
    }

    /// Tokens added per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Maximum burst.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Token balance as of the last `allow` call (no refill applied).
    pub fn tokens(&self) -> f64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).tokens
    }
}

impl Limiter for TokenBucketLimiter {
    fn allow(&self) -> bool {
        // Refill and decrement form one critical section.
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now_nanos();

        let elapsed_nanos = now.saturating_sub(state.last_refill_nanos);
        if elapsed_nanos > 0 {
            let refill = Duration::from_nanos(elapsed_nanos).as_secs_f64() * self.rate;
            state.tokens = (state.tokens + refill).min(f64::from(self.capacity));
            state.last_refill_nanos = now;
        }

        // Waiting exactly 1/rate must yield a whole token even when 1/rate
        // is not a whole number of nanoseconds.
        if state.tokens >= 1.0 - TOKEN_EPSILON {
            state.tokens = (state.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn bucket(rate: f64, capacity: u32) -> (TokenBucketLimiter, ManualClock) {
        let clock = ManualClock::new();
        let limiter = TokenBucketLimiter::with_clock(rate, capacity, Arc::new(clock.clone()))
            .expect("valid bucket");
        (limiter, clock)
    }

    #[test]
    fn burst_is_admitted_then_denied() {
        let (limiter, _clock) = bucket(5.0, 3);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow(), "fourth call in zero elapsed time must be denied");
    }

    #[test]
    fn one_interval_after_exhaustion_admits_exactly_one() {
        let (limiter, clock) = bucket(10.0, 2);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());

        clock.advance(Duration::from_millis(100));
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn one_interval_admits_when_it_is_not_whole_milliseconds() {
        let (limiter, clock) = bucket(3.0, 1);
        assert!(limiter.allow());
        assert!(!limiter.allow());

        clock.advance(Duration::from_secs_f64(1.0 / 3.0));
        assert!(limiter.allow(), "1/3 s at 3 rps is one full token");
        assert!(!limiter.allow());
    }

    #[test]
    fn real_clock_refills_after_one_interval() {
        let limiter = TokenBucketLimiter::new(3.0, 1).expect("valid bucket");
        assert!(limiter.allow());
        assert!(!limiter.allow());

        std::thread::sleep(Duration::from_secs_f64(1.0 / 3.0));
        assert!(limiter.allow());
    }

    #[test]
    fn fractional_rates_accumulate() {
        // One token every 50 seconds.
        let (limiter, clock) = bucket(0.02, 1);
        assert!(limiter.allow());
        assert!(!limiter.allow());

        clock.advance(Duration::from_secs(25));
        assert!(!limiter.allow(), "half a token is not enough");

        clock.advance(Duration::from_secs(25));
        assert!(limiter.allow());
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let (limiter, clock) = bucket(100.0, 2);
        clock.advance(Duration::from_secs(60));
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
        assert!(limiter.tokens() >= 0.0);
    }

    #[test]
    fn denial_does_not_consume() {
        let (limiter, clock) = bucket(4.0, 1);
        assert!(limiter.allow());
        for _ in 0..10 {
            assert!(!limiter.allow());
        }
        clock.advance(Duration::from_millis(250));
        assert!(limiter.allow(), "repeated denials must not push the balance negative");
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert_eq!(
            TokenBucketLimiter::new(0.0, 1).unwrap_err(),
            ConfigError::InvalidRate { provided: 0.0 }
        );
        assert!(TokenBucketLimiter::new(-1.0, 1).is_err());
        assert!(TokenBucketLimiter::new(f64::NAN, 1).is_err());
        assert!(TokenBucketLimiter::new(f64::INFINITY, 1).is_err());
        assert_eq!(
            TokenBucketLimiter::new(1.0, 0).unwrap_err(),
            ConfigError::InvalidBurst { provided: 0 }
        );
    }

    #[test]
    fn concurrent_callers_never_exceed_burst() {
        let (limiter, _clock) = bucket(1.0, 50);
        let limiter = Arc::new(limiter);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || (0..20).filter(|_| limiter.allow()).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
