//! Admission statistics.
//!
//! The middleware emits one [`StatsEvent`] per rate decision to an optional
//! sink. Sinks are plain `tower::Service<StatsEvent>`s so they compose with
//! the rest of the tower ecosystem (buffering, fan-out, error mapping).
//!
//! Delivery is best effort. [`emit_best_effort`] waits for the sink to become
//! ready, sends the event, and discards any error after a `debug!` record.
//! A failing sink never changes whether a request is admitted.

use crate::error::BoxError;
use crate::rate_limit::Key;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceExt};

pub mod sinks;

pub use sinks::{
    Counters, LogStats, MemoryStats, MulticastStats, MulticastStatsError, NonBlockingStats,
    NullStats,
};

/// One rate decision, as reported to a stats sink.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StatsEvent {
    pub key: Key,
    pub allowed: bool,
    pub method: String,
    pub path: String,
    pub at: SystemTime,
}

impl StatsEvent {
    /// An event stamped with the current wall-clock time.
    pub fn new(
        key: Key,
        allowed: bool,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self { key, allowed, method: method.into(), path: path.into(), at: SystemTime::now() }
    }

    /// `"METHOD /path"`, the route label counters are grouped by.
    pub fn route(&self) -> String {
        format!("{} {}", self.method, self.path)
    }

    /// Milliseconds since the Unix epoch; zero for pre-epoch clocks.
    pub fn at_millis(&self) -> u64 {
        self.at
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

impl fmt::Display for StatsEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = if self.allowed { "allowed" } else { "denied" };
        write!(f, "{outcome} key={} {} {}", self.key, self.method, self.path)
    }
}

/// A stats sink consumes [`StatsEvent`]s.
pub trait StatsSink:
    Service<StatsEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + Sync + 'static;
}

/// Type-erased sink as stored by the admission layer.
pub type BoxStatsSink = BoxCloneSyncService<StatsEvent, (), BoxError>;

/// Erase a sink's concrete type and error.
pub fn boxed<S>(sink: S) -> BoxStatsSink
where
    S: Service<StatsEvent, Response = ()> + Clone + Send + Sync + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    BoxCloneSyncService::new(sink.map_err(Into::<BoxError>::into))
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: StatsEvent)
where
    S: Service<StatsEvent, Response = ()>,
    S::Error: Into<BoxError>,
{
    match sink.ready_oneshot().await {
        Ok(mut ready) => {
            if let Err(err) = ready.call(event).await {
                let err: BoxError = err.into();
                tracing::debug!(error = %err, "stats sink failed; event dropped");
            }
        }
        Err(err) => {
            let err: BoxError = err.into();
            tracing::debug!(error = %err, "stats sink not ready; event dropped");
        }
    }
}
