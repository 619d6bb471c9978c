//! Global concurrency admission.
//!
//! A [`SlotPool`] hands out at most `capacity` [`Slot`]s at once. Each slot is
//! an RAII guard: dropping it (or calling [`Slot::release`]) returns the slot
//! to its pool exactly once, on every exit path including panics and
//! cancelled futures.
//!
//! [`ConcurrencyAdmissionService`] sits in front of a pool and applies the
//! optional acquisition timeout. The pool itself never times out; it only
//! honours the cancellation token it is given.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;

pub mod pool;

pub use pool::SemaphorePool;

/// A held concurrency slot. Released when dropped.
#[must_use = "the slot is released as soon as it is dropped"]
pub struct Slot {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Slot {
    /// Wrap a release callback. The callback runs exactly once.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self { release: Some(Box::new(release)) }
    }

    /// A slot that releases nothing, handed out when concurrency limiting is off.
    pub fn noop() -> Self {
        Self { release: None }
    }

    pub(crate) fn from_permit(permit: OwnedSemaphorePermit) -> Self {
        Self::new(move || drop(permit))
    }

    /// Release now instead of at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot").field("held", &self.release.is_some()).finish()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// A fixed-capacity pool of concurrency slots.
#[async_trait]
pub trait SlotPool: Send + Sync {
    /// Wait for a free slot.
    ///
    /// Returns `None` if `cancel` fires before a slot is obtained. Must not
    /// leak a slot when the returned future is dropped mid-wait.
    async fn acquire(&self, cancel: &CancellationToken) -> Option<Slot>;
}

#[async_trait]
impl<T: SlotPool + ?Sized> SlotPool for Arc<T> {
    async fn acquire(&self, cancel: &CancellationToken) -> Option<Slot> {
        (**self).acquire(cancel).await
    }
}

/// Applies timeout policy in front of a [`SlotPool`].
///
/// Without a pool every acquisition succeeds with [`Slot::noop`]. Without a
/// timeout the wait is bounded only by the caller's cancellation token.
#[derive(Clone, Default)]
pub struct ConcurrencyAdmissionService {
    pool: Option<Arc<dyn SlotPool>>,
    acquire_timeout: Option<Duration>,
}

impl fmt::Debug for ConcurrencyAdmissionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyAdmissionService")
            .field("enabled", &self.pool.is_some())
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

impl ConcurrencyAdmissionService {
    pub fn new<P: SlotPool + 'static>(pool: P) -> Self {
        Self::from_shared(Arc::new(pool))
    }

    pub fn from_shared(pool: Arc<dyn SlotPool>) -> Self {
        Self { pool: Some(pool), acquire_timeout: None }
    }

    /// Admit everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Give up waiting after `limit`. Zero means no timeout.
    pub fn with_acquire_timeout(mut self, limit: Duration) -> Self {
        self.acquire_timeout = (!limit.is_zero()).then_some(limit);
        self
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    /// Acquire a slot, giving up when `cancel` fires or the timeout elapses.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<Slot> {
        let Some(pool) = &self.pool else {
            return Some(Slot::noop());
        };
        let Some(limit) = self.acquire_timeout else {
            return pool.acquire(cancel).await;
        };

        // Cancelling the child leaves the caller's token untouched.
        let bounded = cancel.child_token();
        let acquire = pool.acquire(&bounded);
        tokio::pin!(acquire);

        tokio::select! {
            biased;
            slot = &mut acquire => slot,
            _ = tokio::time::sleep(limit) => {
                bounded.cancel();
                acquire.await
            }
        }
    }
}
