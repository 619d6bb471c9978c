//! Startup failures. Anything here aborts the process before it serves traffic.

use std::io;

use http::header::InvalidHeaderName;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid UPSTREAM_URL {url:?}: {reason}")]
    InvalidUpstream { url: String, reason: String },

    #[error(transparent)]
    Config(#[from] turnstile::ConfigError),

    #[error("invalid RATE_KEY_HEADER: {0}")]
    InvalidKeyHeader(#[from] InvalidHeaderName),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] io::Error),
}
