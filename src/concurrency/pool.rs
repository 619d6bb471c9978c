use super::{Slot, SlotPool};
use crate::error::ConfigError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Fixed-capacity slot pool backed by a tokio [`Semaphore`].
///
/// Waiters are served by the semaphore's queue, which is fair in practice
/// but not part of this type's contract.
#[derive(Debug, Clone)]
pub struct SemaphorePool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl SemaphorePool {
    /// Create a pool with `capacity` slots.
    ///
    /// # Examples
    /// ```
    /// use turnstile::concurrency::SemaphorePool;
    /// let pool = SemaphorePool::new(4).unwrap();
    /// assert_eq!(pool.available(), 4);
    /// assert!(SemaphorePool::new(0).is_err());
    /// ```
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 || capacity > Semaphore::MAX_PERMITS {
            return Err(ConfigError::InvalidCapacity {
                provided: capacity,
                max: Semaphore::MAX_PERMITS,
            });
        }
        Ok(Self { semaphore: Arc::new(Semaphore::new(capacity)), capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}

#[async_trait]
impl SlotPool for SemaphorePool {
    async fn acquire(&self, cancel: &CancellationToken) -> Option<Slot> {
        if cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            permit = self.semaphore.clone().acquire_owned() => permit.ok().map(Slot::from_permit),
            _ = cancel.cancelled() => None,
        }
    }
}
