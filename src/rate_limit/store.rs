use crate::clock::{Clock, MonotonicClock};
use crate::error::ConfigError;
use crate::rate_limit::bucket::{self, TokenBucketLimiter};
use crate::rate_limit::{Key, Limiter, LimiterStore, RateInfo};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Keys unseen for this long are evicted.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(15 * 60);

/// How often the background sweeper scans for idle keys.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(2 * 60);

#[derive(Debug)]
struct StoreEntry {
    limiter: Arc<TokenBucketLimiter>,
    last_seen_millis: u64,
}

/// In-memory store holding one token bucket per key.
///
/// Limiters are created lazily on first lookup with the store's rate and
/// burst. Every lookup refreshes the key's last-seen time; keys idle for
/// longer than the TTL are removed by [`sweep`](Self::sweep), which the
/// background task started by [`spawn_sweeper`](Self::spawn_sweeper) calls
/// on a fixed interval. A key that returns after eviction gets a fresh,
/// full bucket.
///
/// Clones share the same map.
#[derive(Debug, Clone)]
pub struct MemoryLimiterStore {
    entries: Arc<Mutex<HashMap<Key, StoreEntry>>>,
    rate: f64,
    burst: u32,
    idle_ttl: Duration,
    sweep_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl MemoryLimiterStore {
    /// Create a store whose limiters refill at `rate` tokens/sec with room for `burst`.
    ///
    /// # Examples
    /// ```
    /// use turnstile::rate_limit::{Key, Limiter, MemoryLimiterStore};
    /// let store = MemoryLimiterStore::new(10.0, 20).unwrap();
    /// let a = store.get_limiter(&Key::from("10.0.0.1"));
    /// let b = store.get_limiter(&Key::from("10.0.0.1"));
    /// assert!(std::sync::Arc::ptr_eq(&a, &b));
    /// assert!(a.allow());
    /// ```
    pub fn new(rate: f64, burst: u32) -> Result<Self, ConfigError> {
        bucket::validate(rate, burst)?;
        Ok(Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            rate,
            burst,
            idle_ttl: DEFAULT_IDLE_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    /// Override the idle TTL. Zero is treated as the default.
    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = if ttl.is_zero() { DEFAULT_IDLE_TTL } else { ttl };
        self
    }

    /// Override the sweep interval. Zero disables the background sweeper.
    pub fn with_sweep_interval(mut self, every: Duration) -> Self {
        self.sweep_interval = every;
        self
    }

    /// Read time from `clock` for both refills and idle tracking.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Return the limiter for `key`, creating it on first use.
    ///
    /// Concurrent first lookups for the same key observe the same instance.
    pub fn get_limiter(&self, key: &Key) -> Arc<TokenBucketLimiter> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(key.clone()).or_insert_with(|| StoreEntry {
            limiter: Arc::new(TokenBucketLimiter::from_validated(
                self.rate,
                self.burst,
                self.clock.clone(),
            )),
            last_seen_millis: now,
        });
        entry.last_seen_millis = now;
        entry.limiter.clone()
    }

    /// Remove every key idle for longer than the TTL. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let ttl = u64::try_from(self.idle_ttl.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now.saturating_sub(ttl);

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.last_seen_millis >= cutoff);
        let evicted = before - entries.len();
        drop(entries);

        if evicted > 0 {
            tracing::debug!(evicted, remaining = before - evicted, "evicted idle rate limit keys");
        }
        evicted
    }

    /// Spawn the background sweeper on the current tokio runtime.
    ///
    /// The task runs until the returned handle is shut down or dropped, or
    /// until `parent` is cancelled. Returns `None` when the sweep interval is
    /// zero.
    pub fn spawn_sweeper(&self, parent: &CancellationToken) -> Option<SweeperHandle> {
        let every = self.sweep_interval;
        if every.is_zero() {
            return None;
        }

        let token = parent.child_token();
        let stop = token.clone();
        let store = self.clone();

        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + every;
            let mut ticker = tokio::time::interval_at(start, every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval = ?every, ttl = ?store.idle_ttl, "rate limit sweeper started");
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        store.sweep();
                    }
                }
            }
            tracing::info!("rate limit sweeper stopped");
        });

        Some(SweeperHandle { token, task: Some(task) })
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rps(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }
}

impl LimiterStore for MemoryLimiterStore {
    fn get(&self, key: &Key) -> Option<Arc<dyn Limiter>> {
        Some(self.get_limiter(key) as Arc<dyn Limiter>)
    }

    fn rate_info(&self) -> Option<RateInfo> {
        Some(RateInfo { rps: self.rate, burst: self.burst })
    }
}

/// Owns the background sweeper task. Dropping the handle stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop without waiting for it.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Stop the sweeper and wait for the task to finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "rate limit sweeper task failed");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
