//! Single-upstream reverse proxy.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{PathAndQuery, Uri};
use http::StatusCode;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

// Connection-scoped headers that must not be forwarded in either direction.
const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    KEEP_ALIVE,
    PROXY_CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Forwarding target plus the pooled client used to reach it.
#[derive(Clone, Debug)]
pub struct Upstream {
    client: Client<HttpConnector, Body>,
    base: Uri,
    timeout: Option<Duration>,
}

impl Upstream {
    /// `base` must be an absolute `http://` URI; see [`Config::upstream`](crate::config::Config::upstream).
    pub fn new(base: Uri) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client, base, timeout: None }
    }

    /// Bound each upstream call. Zero leaves calls unbounded.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn base(&self) -> &Uri {
        &self.base
    }

    /// Target URI for an inbound request: the base path joined with the
    /// request path by a single slash, queries concatenated with `&`.
    pub fn target(&self, inbound: &Uri) -> Result<Uri, http::Error> {
        let base_path = self.base.path();
        let path = inbound.path();
        let joined = match (base_path.ends_with('/'), path.starts_with('/')) {
            (true, true) => format!("{}{}", base_path, &path[1..]),
            (false, false) => format!("{base_path}/{path}"),
            _ => format!("{base_path}{path}"),
        };

        let query = match (self.base.query().filter(|q| !q.is_empty()), inbound.query()) {
            (Some(base), Some(q)) if !q.is_empty() => Some(format!("{base}&{q}")),
            (Some(base), _) => Some(base.to_string()),
            (None, q) => q.map(str::to_string),
        };
        let path_and_query: PathAndQuery = match query {
            Some(q) => format!("{joined}?{q}").parse()?,
            None => joined.parse()?,
        };

        let mut parts = self.base.clone().into_parts();
        parts.path_and_query = Some(path_and_query);
        Ok(Uri::from_parts(parts)?)
    }
}

/// Fallback handler: forwards the request and relays the upstream response.
/// Upstream failures become `502 Bad Gateway`.
pub async fn forward(State(upstream): State<Upstream>, req: Request) -> Response {
    let (mut parts, body) = req.into_parts();

    let target = match upstream.target(&parts.uri) {
        Ok(target) => target,
        Err(err) => {
            tracing::warn!(error = %err, uri = %parts.uri, "cannot build upstream uri");
            return bad_gateway();
        }
    };

    strip_hop_by_hop(&mut parts.headers);
    parts.headers.remove(header::HOST);
    if let Some(peer) = parts.extensions.get::<SocketAddr>() {
        append_forwarded_for(&mut parts.headers, peer);
    }
    parts.uri = target;

    let outbound = Request::from_parts(parts, body);
    let call = upstream.client.request(outbound);
    let result = match upstream.timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(upstream = %upstream.base, timeout = ?limit, "upstream timed out");
                return (StatusCode::GATEWAY_TIMEOUT, "gateway timeout\n").into_response();
            }
        },
        None => call.await,
    };
    match result {
        Ok(res) => {
            let (mut parts, incoming) = res.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            Response::from_parts(parts, Body::new(incoming))
        }
        Err(err) => {
            tracing::warn!(error = %err, upstream = %upstream.base, "proxy error");
            bad_gateway()
        }
    }
}

fn bad_gateway() -> Response {
    (StatusCode::BAD_GATEWAY, "bad gateway\n").into_response()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in `Connection` are hop-by-hop too.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: &SocketAddr) {
    let ip = peer.ip().to_string();
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.trim().is_empty() => format!("{prior}, {ip}"),
        _ => ip,
    };
    if let Ok(value) = HeaderValue::try_from(value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
