//! Error types for admission control.
//!
//! Only construction can fail. Once a limiter, pool, or layer exists, every
//! request resolves to admit or reject; rejections are responses, not errors.

/// Boxed error used where heterogeneous collaborator errors are erased.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Invalid configuration detected while building admission components.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Refill rate must be finite and > 0.
    #[error("rate must be a finite number of tokens per second > 0 (got {provided})")]
    InvalidRate {
        /// Value provided by caller.
        provided: f64,
    },
    /// Burst capacity must be >= 1.
    #[error("burst must be >= 1 (got {provided})")]
    InvalidBurst {
        /// Value provided by caller.
        provided: u32,
    },
    /// Concurrency pools need at least one slot and at most the semaphore maximum.
    #[error("pool capacity must be between 1 and {max} (got {provided})")]
    InvalidCapacity {
        /// Value provided by caller.
        provided: usize,
        /// Largest capacity the pool supports.
        max: usize,
    },
    /// Rejection statuses must be client or server errors.
    #[error("rejection status must be 4xx or 5xx (got {provided})")]
    InvalidRejectStatus {
        /// Value provided by caller.
        provided: u16,
    },
}

impl ConfigError {
    /// Check if this error concerns the token-bucket parameters.
    pub fn is_rate_config(&self) -> bool {
        matches!(self, Self::InvalidRate { .. } | Self::InvalidBurst { .. })
    }
}
