use super::{StatsEvent, StatsSink};
use crate::rate_limit::Key;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tower::Service;

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// A no-op sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullStats;

impl Service<StatsEvent> for NullStats {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: StatsEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl StatsSink for NullStats {
    type SinkError = Infallible;
}

/// A sink that records each decision with `tracing` at info level.
#[derive(Clone, Debug, Default)]
pub struct LogStats;

impl Service<StatsEvent> for LogStats {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: StatsEvent) -> Self::Future {
        tracing::info!(
            key = %event.key,
            allowed = event.allowed,
            method = %event.method,
            path = %event.path,
            "rate_limit_decision"
        );
        Box::pin(async { Ok(()) })
    }
}

impl StatsSink for LogStats {
    type SinkError = Infallible;
}

/// Cumulative allowed/denied counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Counters {
    pub allowed: u64,
    pub denied: u64,
}

impl Counters {
    fn record(&mut self, allowed: bool) {
        if allowed {
            self.allowed += 1;
        } else {
            self.denied += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.allowed + self.denied
    }
}

#[derive(Debug, Default)]
struct Tally {
    total: Counters,
    by_route: HashMap<String, Counters>,
    by_key: HashMap<Key, Counters>,
}

/// In-process counters: in total, per route (`"METHOD /path"`), and
/// optionally per key.
///
/// Counters never expire. Per-key tracking grows with the number of distinct
/// keys, so it is off unless enabled with [`with_track_keys`](Self::with_track_keys).
/// Snapshots are copies; clones share the same counters.
#[derive(Clone, Debug, Default)]
pub struct MemoryStats {
    tally: Arc<Mutex<Tally>>,
    track_keys: bool,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_track_keys(mut self, track: bool) -> Self {
        self.track_keys = track;
        self
    }

    pub fn record(&self, event: &StatsEvent) {
        let route = event.route();
        let mut tally = self.tally.lock().unwrap_or_else(PoisonError::into_inner);
        tally.total.record(event.allowed);
        tally.by_route.entry(route).or_default().record(event.allowed);
        if self.track_keys {
            tally.by_key.entry(event.key.clone()).or_default().record(event.allowed);
        }
    }

    pub fn total(&self) -> Counters {
        self.tally.lock().unwrap_or_else(PoisonError::into_inner).total
    }

    pub fn by_route(&self) -> HashMap<String, Counters> {
        self.tally.lock().unwrap_or_else(PoisonError::into_inner).by_route.clone()
    }

    /// Empty unless key tracking is enabled.
    pub fn by_key(&self) -> HashMap<Key, Counters> {
        self.tally.lock().unwrap_or_else(PoisonError::into_inner).by_key.clone()
    }
}

impl Service<StatsEvent> for MemoryStats {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: StatsEvent) -> Self::Future {
        self.record(&event);
        Box::pin(async { Ok(()) })
    }
}

impl StatsSink for MemoryStats {
    type SinkError = Infallible;
}

/// Offloads emission to a bounded channel and worker task.
///
/// `call` never waits: when the channel is full the event is dropped and
/// counted. Must be created inside a tokio runtime.
#[derive(Clone, Debug)]
pub struct NonBlockingStats {
    tx: tokio::sync::mpsc::Sender<StatsEvent>,
    dropped: Arc<AtomicU64>,
}

impl NonBlockingStats {
    pub fn with_capacity<S>(mut sink: S, capacity: usize) -> Self
    where
        S: Service<StatsEvent, Response = ()> + Send + 'static,
        S::Error: Into<crate::error::BoxError>,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));

        tokio::spawn(async move {
            use tower::ServiceExt;
            while let Some(event) = rx.recv().await {
                let ready = match sink.ready().await {
                    Ok(ready) => ready,
                    Err(err) => {
                        let err: crate::error::BoxError = err.into();
                        tracing::debug!(error = %err, "stats worker sink closed");
                        break;
                    }
                };
                if let Err(err) = ready.call(event).await {
                    let err: crate::error::BoxError = err.into();
                    tracing::debug!(error = %err, "stats sink failed; event dropped");
                }
            }
        });

        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Events discarded because the channel was full or the worker stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Service<StatsEvent> for NonBlockingStats {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: StatsEvent) -> Self::Future {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl StatsSink for NonBlockingStats {
    type SinkError = Infallible;
}

/// Error from one side of a [`MulticastStats`].
#[derive(Debug, thiserror::Error)]
#[error("stats sink error: {0}")]
pub struct MulticastStatsError(#[source] crate::error::BoxError);

/// Sends every event to two sinks concurrently.
#[derive(Clone, Debug)]
pub struct MulticastStats<A, B> {
    first: A,
    second: B,
}

impl<A, B> MulticastStats<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A, B> Service<StatsEvent> for MulticastStats<A, B>
where
    A: Service<StatsEvent, Response = ()> + Clone + Send + 'static,
    A::Error: Into<crate::error::BoxError> + Send,
    A::Future: Send + 'static,
    B: Service<StatsEvent, Response = ()> + Clone + Send + 'static,
    B::Error: Into<crate::error::BoxError> + Send,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = MulticastStatsError;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: StatsEvent) -> Self::Future {
        let first = self.first.clone();
        let second = self.second.clone();
        let copy = event.clone();

        Box::pin(async move {
            use tower::ServiceExt;
            let (a, b) = tokio::join!(first.oneshot(event), second.oneshot(copy));
            a.map_err(|e| MulticastStatsError(e.into()))?;
            b.map_err(|e| MulticastStatsError(e.into()))?;
            Ok(())
        })
    }
}

impl<A, B> StatsSink for MulticastStats<A, B>
where
    A: Service<StatsEvent, Response = ()> + Clone + Send + 'static,
    A::Error: Into<crate::error::BoxError> + Send,
    A::Future: Send + 'static,
    B: Service<StatsEvent, Response = ()> + Clone + Send + 'static,
    B::Error: Into<crate::error::BoxError> + Send,
    B::Future: Send + 'static,
{
    type SinkError = MulticastStatsError;
}
