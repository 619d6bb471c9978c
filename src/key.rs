//! Request key derivation.
//!
//! [`KeyExtractor`] picks the identity a request's rate budget is charged to.
//! The first non-empty candidate wins:
//!
//! 1. the configured key header, trimmed;
//! 2. the first `X-Forwarded-For` entry, trimmed, if forwarded-for is trusted;
//! 3. the peer address with its port stripped;
//! 4. the raw peer address when it cannot be split;
//! 5. [`UNKNOWN_KEY`].
//!
//! The peer address is read from a [`RemoteAddr`] or [`SocketAddr`] request
//! extension, whichever the transport provides.

use crate::rate_limit::Key;
use http::header::{HeaderName, HeaderValue, InvalidHeaderName};
use http::request::Parts;
use http::Extensions;
use std::borrow::Cow;
use std::net::SocketAddr;

/// Key used when a request carries no usable identity.
pub const UNKNOWN_KEY: &str = "unknown";

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Raw peer address as reported by the transport, e.g. `"10.0.0.9:5555"`.
///
/// Unlike [`SocketAddr`] this may hold anything, including strings that do
/// not parse as an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr(pub String);

/// Derives the rate limiting key for a request.
///
/// Implemented for [`KeyExtractor`] and for any `Fn(&Parts) -> Key` closure.
pub trait ExtractKey: Send + Sync {
    fn extract(&self, parts: &Parts) -> Key;
}

impl<F> ExtractKey for F
where
    F: Fn(&Parts) -> Key + Send + Sync,
{
    fn extract(&self, parts: &Parts) -> Key {
        self(parts)
    }
}

/// The default key policy.
#[derive(Debug, Clone, Default)]
pub struct KeyExtractor {
    key_header: Option<HeaderName>,
    trust_forwarded_for: bool,
}

impl KeyExtractor {
    /// Key on peer address only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefer the value of `header` when present and non-empty.
    pub fn with_key_header(mut self, header: HeaderName) -> Self {
        self.key_header = Some(header);
        self
    }

    /// Like [`with_key_header`](Self::with_key_header), parsing the name.
    /// An empty name leaves header keying off.
    pub fn with_key_header_str(self, header: &str) -> Result<Self, InvalidHeaderName> {
        if header.trim().is_empty() {
            return Ok(self);
        }
        Ok(self.with_key_header(HeaderName::try_from(header.trim())?))
    }

    /// Whether to believe the client-supplied `X-Forwarded-For` header.
    /// Only enable this behind a proxy that overwrites it.
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn key_header(&self) -> Option<&HeaderName> {
        self.key_header.as_ref()
    }

    fn from_key_header(&self, parts: &Parts) -> Option<Key> {
        let name = self.key_header.as_ref()?;
        let value = header_text(parts.headers.get(name)?);
        let value = value.trim();
        (!value.is_empty()).then(|| Key::from(value))
    }

    fn from_forwarded_for(&self, parts: &Parts) -> Option<Key> {
        if !self.trust_forwarded_for {
            return None;
        }
        let header = header_text(parts.headers.get(X_FORWARDED_FOR)?);
        let first = header.split(',').next()?.trim();
        (!first.is_empty()).then(|| Key::from(first))
    }
}

impl ExtractKey for KeyExtractor {
    fn extract(&self, parts: &Parts) -> Key {
        if let Some(key) = self.from_key_header(parts) {
            return key;
        }
        if let Some(key) = self.from_forwarded_for(parts) {
            return key;
        }

        let Some(remote) = remote_addr_of(&parts.extensions) else {
            return Key::from(UNKNOWN_KEY);
        };
        match split_host_port(remote.trim()) {
            Some((host, _)) if !host.is_empty() => Key::from(host),
            _ if !remote.is_empty() => Key::from(&*remote),
            _ => Key::from(UNKNOWN_KEY),
        }
    }
}

// Header values may carry non-ASCII bytes; keep them rather than dropping the value.
fn header_text(value: &HeaderValue) -> Cow<'_, str> {
    String::from_utf8_lossy(value.as_bytes())
}

/// Peer address recorded by the transport, if any.
pub fn remote_addr_of(extensions: &Extensions) -> Option<Cow<'_, str>> {
    if let Some(RemoteAddr(raw)) = extensions.get::<RemoteAddr>() {
        return Some(Cow::Borrowed(raw.as_str()));
    }
    extensions.get::<SocketAddr>().map(|addr| Cow::Owned(addr.to_string()))
}

/// Split `host:port` or `[v6-host]:port`. Returns `None` when there is no
/// port separator or the host is ambiguous (bare IPv6 without brackets).
fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let close = rest.find(']')?;
        let host = &rest[..close];
        let port = rest[close + 1..].strip_prefix(':')?;
        if port.contains([':', '[', ']']) {
            return None;
        }
        return Some((host, port));
    }

    let colon = addr.rfind(':')?;
    let (host, port) = (&addr[..colon], &addr[colon + 1..]);
    if host.contains([':', '[', ']']) || port.contains(['[', ']']) {
        return None;
    }
    Some((host, port))
}
