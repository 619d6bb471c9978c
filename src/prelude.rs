//! Convenient re-exports for common Turnstile types.
pub use crate::{
    concurrency::{ConcurrencyAdmissionService, SemaphorePool, Slot, SlotPool},
    error::ConfigError,
    key::{ExtractKey, KeyExtractor, RemoteAddr},
    middleware::{AdmissionLayer, AdmissionService},
    rate_limit::{
        Decision, Key, Limiter, LimiterStore, MemoryLimiterStore, RateDecisionService,
        TokenBucketLimiter,
    },
    stats::{LogStats, MemoryStats, NonBlockingStats, NullStats, StatsEvent},
};
