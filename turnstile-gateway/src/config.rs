//! Gateway configuration via CLI args and environment variables.

use std::path::PathBuf;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, ValueEnum};

use crate::error::StartupError;

const DEFAULT_RATE_RPS: f64 = 10.0;
const DEFAULT_RATE_BURST: u32 = 20;

/// Output format for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Reverse-proxy gateway with per-key rate limiting and a global concurrency cap.
#[derive(Parser, Debug, Clone)]
#[command(name = "turnstile-gateway", version, about)]
pub struct Config {
    /// Listen address. A bare `:port` binds every interface.
    #[arg(long, default_value = "0.0.0.0:8080", env = "LISTEN_ADDR")]
    pub listen_addr: String,

    /// Upstream base URL, e.g. `http://127.0.0.1:9000`.
    #[arg(long, env = "UPSTREAM_URL")]
    pub upstream_url: String,

    /// Enable per-key rate limiting.
    #[arg(
        long,
        env = "RATE_ENABLED",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub rate_enabled: bool,

    /// Sustained requests per second per key [default: 10].
    #[arg(long, env = "RATE_RPS")]
    pub rate_rps: Option<f64>,

    /// Bucket capacity per key [default: 20, or 1 when RATE_RPS is below 1].
    #[arg(long, env = "RATE_BURST")]
    pub rate_burst: Option<u32>,

    /// Header whose value identifies the caller (e.g. `X-API-Key`). Empty keys on client IP.
    #[arg(long, env = "RATE_KEY_HEADER", default_value = "")]
    pub rate_key_header: String,

    /// Key on the first `X-Forwarded-For` entry. Only safe behind a trusted proxy.
    #[arg(
        long = "trust-xff",
        env = "TRUST_XFF",
        default_value_t = false,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub trust_xff: bool,

    /// Retry-After advertised on rate rejections.
    #[arg(long, env = "RETRY_AFTER", default_value = "1s", value_parser = parse_duration)]
    pub retry_after: Duration,

    /// Add X-RateLimit-* headers to admitted responses.
    #[arg(
        long,
        env = "ADD_RATELIMIT_HEADERS",
        default_value_t = false,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub add_ratelimit_headers: bool,

    /// Maximum in-flight requests (0 = unlimited).
    #[arg(long, env = "CONCURRENCY_MAX", default_value_t = 100)]
    pub concurrency_max: u32,

    /// How long a request may wait for a slot (0 = as long as the request lives).
    #[arg(long, env = "CONCURRENCY_TIMEOUT", default_value = "0s", value_parser = parse_duration)]
    pub concurrency_timeout: Duration,

    /// Evict per-key limiters idle for longer than this.
    #[arg(long, env = "RATE_IDLE_TTL", default_value = "15m", value_parser = parse_duration)]
    pub rate_idle_ttl: Duration,

    /// How often idle limiters are swept (0 = never).
    #[arg(long, env = "RATE_SWEEP_INTERVAL", default_value = "2m", value_parser = parse_duration)]
    pub rate_sweep_interval: Duration,

    /// Record allowed/denied counters.
    #[arg(
        long,
        env = "RATE_STATS_ENABLED",
        default_value_t = false,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub rate_stats_enabled: bool,

    /// Also count decisions per key. Cardinality grows with the client population.
    #[arg(
        long,
        env = "RATE_STATS_TRACK_KEYS",
        default_value_t = false,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub rate_stats_track_keys: bool,

    /// Append every decision as a JSON line to this file.
    #[arg(long, env = "RATE_STATS_JSONL_PATH")]
    pub rate_stats_jsonl_path: Option<PathBuf>,

    /// Upper bound on a single upstream call (0 = no bound).
    #[arg(long, env = "UPSTREAM_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub upstream_timeout: Duration,

    /// How long shutdown waits for in-flight requests before abandoning them.
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub shutdown_timeout: Duration,

    /// Log level. `RUST_LOG` takes precedence.
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "LOG_FORMAT")]
    pub log_format: LogFormat,
}

impl Config {
    /// Parses configuration from CLI args and env vars.
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn rate_rps(&self) -> f64 {
        self.rate_rps.unwrap_or(DEFAULT_RATE_RPS)
    }

    /// Bucket capacity. With an explicit sub-1 rate and no explicit burst the
    /// default drops to 1, otherwise the first 20 requests would sail through.
    pub fn rate_burst(&self) -> u32 {
        match (self.rate_burst, self.rate_rps) {
            (Some(burst), _) => burst,
            (None, Some(rps)) if rps > 0.0 && rps < 1.0 => 1,
            (None, _) => DEFAULT_RATE_BURST,
        }
    }

    /// Address to bind, with `:port` expanded to all interfaces.
    pub fn bind_addr(&self) -> String {
        let addr = self.listen_addr.trim();
        if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        }
    }

    /// Validated upstream base URL.
    pub fn upstream(&self) -> Result<http::Uri, StartupError> {
        let invalid = |reason: &str| StartupError::InvalidUpstream {
            url: self.upstream_url.clone(),
            reason: reason.to_string(),
        };

        let raw = self.upstream_url.trim();
        if raw.is_empty() {
            return Err(invalid("UPSTREAM_URL is required"));
        }
        let uri: http::Uri = raw.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => return Err(invalid(&format!("unsupported scheme `{other}`"))),
            None => return Err(invalid("missing scheme")),
        }
        if uri.authority().is_none() {
            return Err(invalid("missing host"));
        }
        Ok(uri)
    }
}

/// Parses durations such as `500ms`, `2s`, `1m30s`, `1h` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<f64>() {
        return from_nanos_f64(secs * 1e9).ok_or_else(|| format!("{raw:?}: out of range"));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("{raw:?}: expected a number"));
        }
        let value: f64 = rest[..digits].parse().map_err(|_| format!("{raw:?}: bad number"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let unit_nanos = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("{raw:?}: missing unit")),
            other => return Err(format!("{raw:?}: unknown unit `{other}`")),
        };
        rest = &rest[unit_len..];

        total += from_nanos_f64(value * unit_nanos).ok_or_else(|| format!("{raw:?}: out of range"))?;
    }
    Ok(total)
}

fn from_nanos_f64(nanos: f64) -> Option<Duration> {
    if !nanos.is_finite() || nanos < 0.0 || nanos > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["turnstile-gateway", "--upstream-url", "http://127.0.0.1:9000"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert!(config.rate_enabled);
        assert_eq!(config.rate_rps(), 10.0);
        assert_eq!(config.rate_burst(), 20);
        assert!(!config.trust_xff);
        assert_eq!(config.retry_after, Duration::from_secs(1));
        assert_eq!(config.concurrency_max, 100);
        assert_eq!(config.concurrency_timeout, Duration::ZERO);
        assert_eq!(config.rate_idle_ttl, Duration::from_secs(15 * 60));
        assert_eq!(config.rate_sweep_interval, Duration::from_secs(120));
        assert_eq!(config.upstream_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn low_rate_defaults_burst_to_one() {
        assert_eq!(parse(&["--rate-rps", "0.02"]).rate_burst(), 1);
        assert_eq!(parse(&["--rate-rps", "0.02", "--rate-burst", "5"]).rate_burst(), 5);
        assert_eq!(parse(&["--rate-rps", "3"]).rate_burst(), 20);
    }

    #[test]
    fn booleans_take_values() {
        let config = parse(&["--rate-enabled", "false", "--trust-xff", "yes"]);
        assert!(!config.rate_enabled);
        assert!(config.trust_xff);
    }

    #[test]
    fn upstream_url_is_required() {
        assert!(Config::try_parse_from(["turnstile-gateway"]).is_err());
    }

    #[test]
    fn upstream_validation() {
        assert!(parse(&[]).upstream().is_ok());

        let mut config = parse(&[]);
        config.upstream_url = "https://example.com".into();
        assert!(matches!(config.upstream(), Err(StartupError::InvalidUpstream { .. })));

        config.upstream_url = "/just/a/path".into();
        assert!(config.upstream().is_err());

        config.upstream_url = "  ".into();
        assert!(config.upstream().is_err());
    }

    #[test]
    fn bare_port_binds_all_interfaces() {
        let config = parse(&["--listen-addr", ":9090"]);
        assert_eq!(config.bind_addr(), "0.0.0.0:9090");
        let config = parse(&["--listen-addr", "127.0.0.1:9090"]);
        assert_eq!(config.bind_addr(), "127.0.0.1:9090");
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("2s"), Ok(Duration::from_secs(2)));
        assert_eq!(parse_duration("15m"), Ok(Duration::from_secs(900)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("1m30s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("1.5s"), Ok(Duration::from_millis(1500)));
        assert_eq!(parse_duration("3"), Ok(Duration::from_secs(3)));
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("-1").is_err());
    }
}
