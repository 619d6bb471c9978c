use crate::rate_limit::{Decision, Key, LimiterStore, RateInfo};
use std::sync::Arc;
use std::time::Duration;

/// Retry hint used when none (or zero) is configured.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Turns "is this key over budget?" into a [`Decision`].
///
/// Protocol agnostic: the HTTP layer maps [`Decision::Denied`] to a 429 with
/// `Retry-After`. Fails open when no store is configured or the store has no
/// limiter for a key.
#[derive(Clone)]
pub struct RateDecisionService {
    store: Option<Arc<dyn LimiterStore>>,
    retry_after: Duration,
}

impl std::fmt::Debug for RateDecisionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateDecisionService")
            .field("enabled", &self.store.is_some())
            .field("retry_after", &self.retry_after)
            .finish()
    }
}

impl RateDecisionService {
    pub fn new<S: LimiterStore + 'static>(store: S) -> Self {
        Self::from_shared(Arc::new(store))
    }

    pub fn from_shared(store: Arc<dyn LimiterStore>) -> Self {
        Self { store: Some(store), retry_after: DEFAULT_RETRY_AFTER }
    }

    /// A service that allows everything.
    pub fn disabled() -> Self {
        Self { store: None, retry_after: DEFAULT_RETRY_AFTER }
    }

    /// Retry hint attached to denials. Zero selects [`DEFAULT_RETRY_AFTER`].
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = if retry_after.is_zero() { DEFAULT_RETRY_AFTER } else { retry_after };
        self
    }

    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Consult the limiter for `key`. Consumes one token when allowed.
    pub fn decide(&self, key: &Key) -> Decision {
        let Some(store) = &self.store else {
            return Decision::Allowed;
        };
        match store.get(key) {
            Some(limiter) if !limiter.allow() => Decision::Denied { retry_after: self.retry_after },
            _ => Decision::Allowed,
        }
    }

    /// Configured rate and burst, when the store can describe them.
    pub fn rate_info(&self) -> Option<RateInfo> {
        self.store.as_ref().and_then(|store| store.rate_info())
    }
}

impl Default for RateDecisionService {
    fn default() -> Self {
        Self::disabled()
    }
}
