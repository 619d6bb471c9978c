//! HTTP gateway that applies `turnstile` admission control in front of a
//! single upstream.
//!
//! [`Gateway::build`] turns a [`Config`] into a router; `main` binds it,
//! drives the idle sweeper and handles shutdown.

pub mod config;
pub mod error;
pub mod proxy;

use std::future::IntoFuture;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use turnstile::stats::{MemoryStats, MulticastStats, NonBlockingStats};
use turnstile::{
    AdmissionLayer, ConcurrencyAdmissionService, KeyExtractor, MemoryLimiterStore,
    RateDecisionService, SemaphorePool, SweeperHandle,
};
use turnstile_jsonl::JsonlSink;

pub use config::{Config, LogFormat};
pub use error::StartupError;
pub use proxy::Upstream;

const JSONL_QUEUE: usize = 1024;

/// A fully wired gateway, ready to be served.
pub struct Gateway {
    router: Router,
    store: Option<MemoryLimiterStore>,
    stats: Option<MemoryStats>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Validates `config` and wires store, pool, stats and proxy together.
    ///
    /// Must be called inside a tokio runtime when a JSONL stats path is set.
    pub fn build(config: &Config, shutdown: CancellationToken) -> Result<Self, StartupError> {
        let upstream = Upstream::new(config.upstream()?).with_timeout(config.upstream_timeout);

        let key_extractor = KeyExtractor::new()
            .with_key_header_str(&config.rate_key_header)?
            .trust_forwarded_for(config.trust_xff);

        // Rate settings are validated even when limiting is off.
        let store = MemoryLimiterStore::new(config.rate_rps(), config.rate_burst())?
            .with_idle_ttl(config.rate_idle_ttl)
            .with_sweep_interval(config.rate_sweep_interval);
        let store = config.rate_enabled.then_some(store);
        let decisions = match &store {
            Some(store) => {
                RateDecisionService::new(store.clone()).with_retry_after(config.retry_after)
            }
            None => RateDecisionService::disabled(),
        };

        let concurrency = if config.concurrency_max > 0 {
            ConcurrencyAdmissionService::new(SemaphorePool::new(config.concurrency_max as usize)?)
                .with_acquire_timeout(config.concurrency_timeout)
        } else {
            ConcurrencyAdmissionService::disabled()
        };

        let mut admission = AdmissionLayer::builder()
            .key_extractor(key_extractor)
            .rate_limit(decisions)
            .concurrency(concurrency)
            .rate_limit_headers(config.rate_enabled && config.add_ratelimit_headers);

        // With limiting off there are no decisions worth recording.
        let stats = if config.rate_enabled && config.rate_stats_enabled {
            let memory = MemoryStats::new().with_track_keys(config.rate_stats_track_keys);
            admission = match &config.rate_stats_jsonl_path {
                Some(path) => admission.stats(MulticastStats::new(
                    memory.clone(),
                    NonBlockingStats::with_capacity(JsonlSink::new(path.clone()), JSONL_QUEUE),
                )),
                None => admission.stats(memory.clone()),
            };
            Some(memory)
        } else {
            None
        };

        tracing::info!(
            upstream = %upstream.base(),
            rate_enabled = config.rate_enabled,
            rps = config.rate_rps(),
            burst = config.rate_burst(),
            key_header = %config.rate_key_header,
            trust_xff = config.trust_xff,
            "rate limiting configured"
        );
        tracing::info!(
            max = config.concurrency_max,
            acquire_timeout = ?config.concurrency_timeout,
            "concurrency configured"
        );
        tracing::info!(
            enabled = stats.is_some(),
            track_keys = config.rate_stats_track_keys,
            jsonl = ?config.rate_stats_jsonl_path,
            "rate stats configured"
        );

        let router = Router::new()
            .fallback(proxy::forward)
            .with_state(upstream)
            .layer(admission.build()?)
            .layer(middleware::from_fn_with_state(shutdown.clone(), attach_request_context));

        Ok(Self { router, store, stats, shutdown })
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Starts the idle-limiter sweeper, tied to the gateway's shutdown token.
    pub fn spawn_sweeper(&self) -> Option<SweeperHandle> {
        self.store.as_ref().and_then(|store| store.spawn_sweeper(&self.shutdown))
    }

    pub fn store(&self) -> Option<&MemoryLimiterStore> {
        self.store.as_ref()
    }

    pub fn stats(&self) -> Option<&MemoryStats> {
        self.stats.as_ref()
    }

    /// Logs cumulative decision counters, if stats are enabled.
    pub fn log_stats(&self) {
        let Some(stats) = &self.stats else { return };
        let total = stats.total();
        tracing::info!(allowed = total.allowed, denied = total.denied, "rate decisions");
        for (route, counters) in stats.by_route() {
            tracing::info!(%route, allowed = counters.allowed, denied = counters.denied, "rate decisions by route");
        }
    }
}

/// Serves `router` until `shutdown` fires, then waits at most `grace` for
/// in-flight requests before abandoning them.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
    grace: Duration,
) -> io::Result<()> {
    let signal = shutdown.clone();
    let server = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .into_future();
    let deadline = async {
        shutdown.cancelled().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        served = server => served,
        () = deadline => {
            tracing::warn!(?grace, "shutdown grace period elapsed; abandoning open connections");
            Ok(())
        }
    }
}

/// Exposes the peer address and the shutdown signal to the admission layer.
async fn attach_request_context(
    State(shutdown): State<CancellationToken>,
    mut req: Request,
    next: Next,
) -> Response {
    if let Some(ConnectInfo(peer)) = req.extensions().get::<ConnectInfo<SocketAddr>>().copied() {
        req.extensions_mut().insert(peer);
    }
    req.extensions_mut().insert(shutdown);
    next.run(req).await
}
