//! Tower middleware composing the admission gates.
//!
//! Per request, in order:
//!
//! 1. derive the key with the configured [`ExtractKey`];
//! 2. acquire a concurrency [`Slot`](crate::concurrency::Slot), honouring a
//!    [`CancellationToken`] request extension when the transport provides one
//!    (rejected with 503 by default when none is granted);
//! 3. ask the [`RateDecisionService`] for a [`Decision`] and report it to the
//!    optional stats sink;
//! 4. reject with 429 and `Retry-After` when denied, otherwise call the inner
//!    service, optionally adding `X-RateLimit-*` headers to its response.
//!
//! The slot is held by the request future, so it is released when the inner
//! service finishes, fails, panics, or the future is dropped.
//!
//! Stats are delivered before the response is produced. A sink that stays
//! pending stalls the request, so slow sinks belong behind
//! [`NonBlockingStats`](crate::stats::NonBlockingStats).
//!
//! # Example
//!
//! ```rust
//! use std::convert::Infallible;
//! use http::{Request, Response, StatusCode};
//! use tower::{service_fn, Layer, ServiceExt};
//! use turnstile::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = MemoryLimiterStore::new(0.02, 1).unwrap();
//! let layer = AdmissionLayer::builder()
//!     .rate_limit(RateDecisionService::new(store))
//!     .build()
//!     .unwrap();
//!
//! let svc = layer.layer(service_fn(|_req: Request<String>| async {
//!     Ok::<_, Infallible>(Response::new(String::from("ok")))
//! }));
//!
//! let first = svc.clone().oneshot(Request::new(String::new())).await.unwrap();
//! assert_eq!(first.status(), StatusCode::OK);
//! let second = svc.oneshot(Request::new(String::new())).await.unwrap();
//! assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
//! # }
//! ```

use crate::concurrency::ConcurrencyAdmissionService;
use crate::error::{BoxError, ConfigError};
use crate::key::{ExtractKey, KeyExtractor};
use crate::rate_limit::{Decision, Key, RateDecisionService, RateInfo};
use crate::stats::{self, emit_best_effort, BoxStatsSink, StatsEvent};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_layer::Layer;
use tower_service::Service;

/// Default status for requests over their rate budget.
pub const DEFAULT_RATE_REJECT_STATUS: StatusCode = StatusCode::TOO_MANY_REQUESTS;

/// Default status for requests that found no free concurrency slot.
pub const DEFAULT_CONCURRENCY_REJECT_STATUS: StatusCode = StatusCode::SERVICE_UNAVAILABLE;

pub const X_RATELIMIT_KEY: HeaderName = HeaderName::from_static("x-ratelimit-key");
pub const X_RATELIMIT_RPS: HeaderName = HeaderName::from_static("x-ratelimit-rps");
pub const X_RATELIMIT_BURST: HeaderName = HeaderName::from_static("x-ratelimit-burst");

struct Shared {
    key_extractor: Arc<dyn ExtractKey>,
    concurrency: ConcurrencyAdmissionService,
    decisions: RateDecisionService,
    stats: Option<BoxStatsSink>,
    rate_reject_status: StatusCode,
    concurrency_reject_status: StatusCode,
    rate_limit_headers: bool,
}

/// Layer that applies concurrency and rate admission to HTTP requests.
///
/// Cloning is cheap; all clones share the same store, pool and sink.
#[derive(Clone)]
pub struct AdmissionLayer {
    shared: Arc<Shared>,
}

impl AdmissionLayer {
    pub fn builder() -> AdmissionLayerBuilder {
        AdmissionLayerBuilder::default()
    }
}

impl fmt::Debug for AdmissionLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionLayer")
            .field("concurrency", &self.shared.concurrency)
            .field("decisions", &self.shared.decisions)
            .field("stats", &self.shared.stats.is_some())
            .field("rate_reject_status", &self.shared.rate_reject_status)
            .field("concurrency_reject_status", &self.shared.concurrency_reject_status)
            .field("rate_limit_headers", &self.shared.rate_limit_headers)
            .finish()
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService { inner, shared: self.shared.clone() }
    }
}

/// Builder for [`AdmissionLayer`]. Every gate is optional.
pub struct AdmissionLayerBuilder {
    key_extractor: Arc<dyn ExtractKey>,
    concurrency: ConcurrencyAdmissionService,
    decisions: RateDecisionService,
    stats: Option<BoxStatsSink>,
    rate_reject_status: StatusCode,
    concurrency_reject_status: StatusCode,
    rate_limit_headers: bool,
}

impl Default for AdmissionLayerBuilder {
    fn default() -> Self {
        Self {
            key_extractor: Arc::new(KeyExtractor::default()),
            concurrency: ConcurrencyAdmissionService::disabled(),
            decisions: RateDecisionService::disabled(),
            stats: None,
            rate_reject_status: DEFAULT_RATE_REJECT_STATUS,
            concurrency_reject_status: DEFAULT_CONCURRENCY_REJECT_STATUS,
            rate_limit_headers: false,
        }
    }
}

impl AdmissionLayerBuilder {
    /// How to derive the rate limiting key. Defaults to peer address.
    pub fn key_extractor<E: ExtractKey + 'static>(mut self, extractor: E) -> Self {
        self.key_extractor = Arc::new(extractor);
        self
    }

    pub fn rate_limit(mut self, decisions: RateDecisionService) -> Self {
        self.decisions = decisions;
        self
    }

    pub fn concurrency(mut self, concurrency: ConcurrencyAdmissionService) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Report every rate decision to `sink`. Sink failures are logged and ignored.
    ///
    /// The event is delivered on the request path while the request holds its
    /// concurrency slot, so `sink` must not block. Wrap sinks that do I/O or
    /// may apply backpressure in [`NonBlockingStats`](crate::stats::NonBlockingStats).
    pub fn stats<S>(mut self, sink: S) -> Self
    where
        S: Service<StatsEvent, Response = ()> + Clone + Send + Sync + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        self.stats = Some(stats::boxed(sink));
        self
    }

    pub fn rate_reject_status(mut self, status: StatusCode) -> Self {
        self.rate_reject_status = status;
        self
    }

    pub fn concurrency_reject_status(mut self, status: StatusCode) -> Self {
        self.concurrency_reject_status = status;
        self
    }

    /// Add `X-RateLimit-Key`, `X-RateLimit-RPS` and `X-RateLimit-Burst` to
    /// admitted responses. The last two need a store that reports its rate.
    pub fn rate_limit_headers(mut self, enabled: bool) -> Self {
        self.rate_limit_headers = enabled;
        self
    }

    pub fn build(self) -> Result<AdmissionLayer, ConfigError> {
        for status in [self.rate_reject_status, self.concurrency_reject_status] {
            if !(status.is_client_error() || status.is_server_error()) {
                return Err(ConfigError::InvalidRejectStatus { provided: status.as_u16() });
            }
        }
        Ok(AdmissionLayer {
            shared: Arc::new(Shared {
                key_extractor: self.key_extractor,
                concurrency: self.concurrency,
                decisions: self.decisions,
                stats: self.stats,
                rate_reject_status: self.rate_reject_status,
                concurrency_reject_status: self.concurrency_reject_status,
                rate_limit_headers: self.rate_limit_headers,
            }),
        })
    }
}

/// Middleware service produced by [`AdmissionLayer`].
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S: fmt::Debug> fmt::Debug for AdmissionService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionService").field("inner", &self.inner).finish_non_exhaustive()
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let shared = self.shared.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let key = shared.key_extractor.extract(&parts);
            let cancel = parts.extensions.get::<CancellationToken>().cloned().unwrap_or_default();
            let method = parts.method.to_string();
            let path = parts.uri.path().to_owned();
            let req = Request::from_parts(parts, body);

            let Some(_slot) = shared.concurrency.acquire(&cancel).await else {
                tracing::debug!(key = %key, reason = "concurrency", "request rejected");
                return Ok(reject(shared.concurrency_reject_status, None));
            };

            let decision = shared.decisions.decide(&key);
            if let Some(sink) = &shared.stats {
                let event = StatsEvent::new(key.clone(), decision.is_allowed(), method, path);
                emit_best_effort(sink.clone(), event).await;
            }

            if let Decision::Denied { retry_after } = decision {
                tracing::debug!(key = %key, reason = "rate", ?retry_after, "request rejected");
                return Ok(reject(shared.rate_reject_status, Some(retry_after)));
            }

            let mut response = inner.call(req).await?;
            if shared.rate_limit_headers {
                add_rate_limit_headers(response.headers_mut(), &key, shared.decisions.rate_info());
            }
            Ok(response)
        })
    }
}

/// Plain-text rejection naming the status, e.g. `"Too Many Requests\n"`.
fn reject<B: From<String>>(status: StatusCode, retry_after: Option<Duration>) -> Response<B> {
    let reason = status.canonical_reason().unwrap_or("Request Rejected");
    let mut response = Response::new(B::from(format!("{reason}\n")));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    if let Some(retry_after) = retry_after {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after.as_secs()));
    }
    response
}

/// Informational headers. Values the inner service already set are kept.
fn add_rate_limit_headers(headers: &mut HeaderMap, key: &Key, info: Option<RateInfo>) {
    if let Ok(value) = HeaderValue::from_str(key.as_str()) {
        headers.entry(X_RATELIMIT_KEY).or_insert(value);
    }
    if let Some(RateInfo { rps, burst }) = info {
        if let Ok(value) = HeaderValue::from_str(&rps.to_string()) {
            headers.entry(X_RATELIMIT_RPS).or_insert(value);
        }
        headers.entry(X_RATELIMIT_BURST).or_insert(HeaderValue::from(burst));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_sets_plain_text_and_retry_after() {
        let res: Response<String> =
            reject(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_millis(2500)));
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers()[header::RETRY_AFTER], "2");
        assert_eq!(res.headers()[header::CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(res.body(), "Too Many Requests\n");
    }

    #[test]
    fn concurrency_reject_has_no_retry_after() {
        let res: Response<String> = reject(StatusCode::SERVICE_UNAVAILABLE, None);
        assert!(res.headers().get(header::RETRY_AFTER).is_none());
        assert_eq!(res.body(), "Service Unavailable\n");
    }

    #[test]
    fn rate_headers_format_fractional_rates_plainly() {
        let mut headers = HeaderMap::new();
        add_rate_limit_headers(
            &mut headers,
            &Key::from("10.0.0.1"),
            Some(RateInfo { rps: 0.02, burst: 1 }),
        );
        assert_eq!(headers[X_RATELIMIT_KEY], "10.0.0.1");
        assert_eq!(headers[X_RATELIMIT_RPS], "0.02");
        assert_eq!(headers[X_RATELIMIT_BURST], "1");

        let mut headers = HeaderMap::new();
        add_rate_limit_headers(&mut headers, &Key::from("k"), Some(RateInfo { rps: 10.0, burst: 20 }));
        assert_eq!(headers[X_RATELIMIT_RPS], "10");
    }

    #[test]
    fn rate_headers_keep_inner_values_and_skip_unknown_rates() {
        let mut headers = HeaderMap::new();
        headers.insert(X_RATELIMIT_KEY, HeaderValue::from_static("from-upstream"));
        add_rate_limit_headers(&mut headers, &Key::from("k"), None);
        assert_eq!(headers[X_RATELIMIT_KEY], "from-upstream");
        assert!(headers.get(X_RATELIMIT_RPS).is_none());
        assert!(headers.get(X_RATELIMIT_BURST).is_none());
    }

    #[test]
    fn builder_rejects_non_error_statuses() {
        let err = AdmissionLayer::builder().rate_reject_status(StatusCode::OK).build().unwrap_err();
        assert_eq!(err, ConfigError::InvalidRejectStatus { provided: 200 });

        let err = AdmissionLayer::builder()
            .concurrency_reject_status(StatusCode::PERMANENT_REDIRECT)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidRejectStatus { provided: 308 });

        assert!(AdmissionLayer::builder()
            .rate_reject_status(StatusCode::SERVICE_UNAVAILABLE)
            .build()
            .is_ok());
    }
}
