//! Per-key rate limiting primitives.
//!
//! This module provides the building blocks for rate limiting:
//! - [`Limiter`]: decides instantaneously whether one unit of work may proceed.
//! - [`LimiterStore`]: maps a [`Key`] to its limiter.
//! - [`Decision`]: the protocol-agnostic result of a rate check.
//!
//! # Architecture
//!
//! The system is designed to be modular:
//! - **Logic**: [`TokenBucketLimiter`] (in the `bucket` module) handles the token math.
//! - **Storage**: [`MemoryLimiterStore`] (in the `store` module) caches one limiter per key
//!   and evicts idle keys on a background sweep.
//! - **Decisions**: [`RateDecisionService`] (in the `decision` module) turns a limiter
//!   outcome into a [`Decision`]. It knows nothing about HTTP.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod bucket;
pub mod decision;
pub mod store;

pub use bucket::TokenBucketLimiter;
pub use decision::{RateDecisionService, DEFAULT_RETRY_AFTER};
pub use store::{MemoryLimiterStore, SweeperHandle, DEFAULT_IDLE_TTL, DEFAULT_SWEEP_INTERVAL};

/// Opaque identity a rate budget is tracked under (API key, client IP, peer address).
///
/// Equality is exact byte equality. Clones are cheap.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize), serde(transparent))]
pub struct Key(Arc<str>);

impl Key {
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(Arc::from(value.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", &*self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// The decision returned by a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allowed,
    /// The request is over budget.
    Denied {
        /// How long the caller should wait before retrying.
        /// Surfaced as the `Retry-After` header.
        retry_after: Duration,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    /// Retry hint; zero when allowed.
    pub fn retry_after(&self) -> Duration {
        match self {
            Decision::Allowed => Duration::ZERO,
            Decision::Denied { retry_after } => *retry_after,
        }
    }
}

/// Something that can decide whether one unit of work is permitted right now.
///
/// Implementations must be non-blocking: `allow` is called on the request path
/// while no other suspension point is pending.
pub trait Limiter: Send + Sync {
    /// Consume one unit of budget if available.
    fn allow(&self) -> bool;
}

/// Configured refill rate and burst, for informational response headers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateInfo {
    /// Tokens added per second.
    pub rps: f64,
    /// Maximum burst.
    pub burst: u32,
}

/// Looks up the limiter for a key (IP, API key, user).
///
/// Implementations may cache, expire, or share state however they like, but
/// must never hand two different limiters to concurrent callers for one key.
pub trait LimiterStore: Send + Sync {
    /// Limiter for `key`. `None` means "no opinion" and callers fail open.
    fn get(&self, key: &Key) -> Option<Arc<dyn Limiter>>;

    /// Rate/burst introspection. Stores that cannot describe their
    /// configuration return `None` and the corresponding headers are omitted.
    fn rate_info(&self) -> Option<RateInfo> {
        None
    }
}

impl<T: LimiterStore + ?Sized> LimiterStore for Arc<T> {
    fn get(&self, key: &Key) -> Option<Arc<dyn Limiter>> {
        (**self).get(key)
    }

    fn rate_info(&self) -> Option<RateInfo> {
        (**self).rate_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn decision_retry_after_is_zero_when_allowed() {
        assert_eq!(Decision::Allowed.retry_after(), Duration::ZERO);
        let denied = Decision::Denied { retry_after: Duration::from_secs(3) };
        assert!(!denied.is_allowed());
        assert_eq!(denied.retry_after(), Duration::from_secs(3));
    }

    #[test]
    fn key_equality_is_exact() {
        assert_eq!(Key::from("k1"), Key::new(String::from("k1")));
        assert_ne!(Key::from("k1"), Key::from("K1"));
        assert_ne!(Key::from("k1"), Key::from("k1 "));
    }

    #[test]
    fn key_can_be_looked_up_by_str() {
        let mut map = HashMap::new();
        map.insert(Key::from("10.0.0.1"), 1);
        assert_eq!(map.get("10.0.0.1"), Some(&1));
    }
}
