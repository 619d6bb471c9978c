#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Turnstile
//!
//! Admission control for HTTP gateways: per-key token buckets, a global
//! concurrency pool, and a tower layer that composes them in front of any
//! downstream service.
//!
//! ## Features
//!
//! - **Continuous token buckets** with fractional refill (one request every 50s works)
//! - **Per-key limiter store** with lazy creation and idle eviction on a background sweep
//! - **Concurrency slots** as RAII guards, with cancellable and time-bounded waits
//! - **Key derivation** from an API key header, `X-Forwarded-For`, or the peer address
//! - **Best-effort statistics** via `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use turnstile::prelude::*;
//!
//! # fn main() -> Result<(), turnstile::ConfigError> {
//! let store = MemoryLimiterStore::new(10.0, 20)?;
//! let layer = AdmissionLayer::builder()
//!     .key_extractor(KeyExtractor::new().trust_forwarded_for(true))
//!     .rate_limit(RateDecisionService::new(store).with_retry_after(Duration::from_secs(2)))
//!     .concurrency(
//!         ConcurrencyAdmissionService::new(SemaphorePool::new(100)?)
//!             .with_acquire_timeout(Duration::from_millis(250)),
//!     )
//!     .rate_limit_headers(true)
//!     .build()?;
//! # let _ = layer;
//! # Ok(())
//! # }
//! ```
//!
//! Wrap any `Service<http::Request<B>>` whose response body implements
//! `From<String>` with `layer.layer(service)`, or hand the layer to a router.

pub mod clock;
pub mod concurrency;
pub mod error;
pub mod key;
pub mod middleware;
pub mod prelude;
pub mod rate_limit;
pub mod stats;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use concurrency::{ConcurrencyAdmissionService, SemaphorePool, Slot, SlotPool};
pub use error::{BoxError, ConfigError};
pub use key::{ExtractKey, KeyExtractor, RemoteAddr, UNKNOWN_KEY};
pub use middleware::{AdmissionLayer, AdmissionLayerBuilder, AdmissionService};
pub use rate_limit::{
    Decision, Key, Limiter, LimiterStore, MemoryLimiterStore, RateDecisionService, RateInfo,
    SweeperHandle, TokenBucketLimiter,
};
pub use stats::{emit_best_effort, StatsEvent, StatsSink};
