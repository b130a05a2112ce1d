//! Divide one upstream rate limit fairly among concurrent callers.

pub mod allocator;
pub mod coordinator;
pub mod forward;
pub mod http;
pub mod internal_event;
pub mod pause;
pub mod registry;
pub mod reqwest_integration;
pub mod retries;
pub mod server;
pub mod status;

use std::{str::FromStr, time::Duration};

use bon::Builder;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use url::Url;

pub use allocator::{Admission, FairShare};
pub use registry::{CallerRecord, derive_identity};

/// Length of the rolling accounting window used for every per-caller and global count.
pub const ACCOUNTING_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("UPSTREAM_BASE_URL is not set"))]
    MissingUpstream,

    #[snafu(display("Invalid upstream address '{}': {}", value, source))]
    InvalidUpstream { value: String, source: url::ParseError },

    #[snafu(display("Upstream address must be http or https, got '{}'", scheme))]
    UnsupportedScheme { scheme: String },

    #[snafu(display("Invalid value for {}: '{}'", key, value))]
    InvalidNumber { key: String, value: String },

    #[snafu(display("Invalid configuration: {}", details))]
    InvalidValue { details: String },

    #[snafu(display("Failed to build upstream client: {}", source))]
    HttpClient { source: reqwest::Error },
}

/// Configuration of the proxy.
///
/// Groups the read-only global window (`limit_per_minute`, `active_window`,
/// `burst_window`) with the backoff, pool and budget tunables. Every field except the
/// upstream address has a default, and [`FairShareSettings::from_env`] maps each one to
/// an environment variable.
///
/// | Parameter | Env | Default |
/// |-----------|-----|---------|
/// | `upstream_base_url` | `UPSTREAM_BASE_URL` | required |
/// | `limit_per_minute` | `LIMIT_PER_MINUTE` | 200 |
/// | `active_window` | `ACTIVE_WINDOW_SECONDS` | 5s |
/// | `burst_window` | `BURST_WINDOW_SECONDS` | 30s |
/// | `preferred_max_wait` | `PREFER_WAIT_DEFAULT` | 120s |
/// | `max_connections` | `OUTBOUND_MAX_CONNECTIONS` | 30 |
/// | `max_keepalive` | `OUTBOUND_MAX_KEEPALIVE` | 20 |
/// | `throttled_fallback` | `THROTTLED_FALLBACK_SECONDS` | 1s |
/// | `unavailable_fallback_base` | `UNAVAILABLE_FALLBACK_SECONDS` | 5s |
/// | `jitter_percent` | `JITTER_PERCENT` | 10 |
/// | `attempt_timeout` | `UPSTREAM_TIMEOUT_SECONDS` | 60s, zero disables |
/// | `upstream_http2` | `UPSTREAM_HTTP2` | false |
/// | `max_upstream_attempts` | `MAX_UPSTREAM_ATTEMPTS` | 10 |
/// | `max_transport_retries` | `MAX_TRANSPORT_RETRIES` | 2 |
/// | `max_body_bytes` | `MAX_BODY_BYTES` | 10 MiB |
///
/// # Example
///
/// ```rust
/// use fair_share_proxy::fair_share::FairShareSettings;
///
/// let settings = FairShareSettings::builder()
///     .upstream_base_url("http://127.0.0.1:8001".parse().unwrap())
///     .limit_per_minute(120)
///     .jitter_percent(0.0)
///     .build();
/// assert_eq!(settings.limit_per_minute(), 120);
/// ```
#[derive(Clone, Debug, Builder)]
pub struct FairShareSettings {
    /// Base address every proxied path is appended to.
    pub(crate) upstream_base_url: Url,

    /// Global budget the upstream enforces, in requests per minute.
    #[builder(default = default_limit_per_minute())]
    pub(crate) limit_per_minute: u32,

    /// A caller counts toward the fair-share divisor while it was seen within this window.
    #[builder(default = Duration::from_secs(5))]
    pub(crate) active_window: Duration,

    /// A caller silent for longer than this is forgotten entirely.
    #[builder(default = Duration::from_secs(30))]
    pub(crate) burst_window: Duration,

    /// How long a request may stay suspended before a definitive failure is returned.
    /// A `Prefer: wait=<seconds>` request header overrides it per request.
    #[builder(default = Duration::from_secs(120))]
    pub(crate) preferred_max_wait: Duration,

    /// Ceiling on concurrent upstream connections, independent of fairness.
    #[builder(default = 30)]
    pub(crate) max_connections: usize,

    /// Ceiling on idle connections kept alive in the pool.
    #[builder(default = 20)]
    pub(crate) max_keepalive: usize,

    /// Wait after a throttling signal without a usable reset hint.
    #[builder(default = Duration::from_secs(1))]
    pub(crate) throttled_fallback: Duration,

    /// Base of the exponential wait after an unavailability signal without a usable hint.
    #[builder(default = Duration::from_secs(5))]
    pub(crate) unavailable_fallback_base: Duration,

    /// Symmetric jitter applied to fallback waits, in percent (`±jitter_percent`).
    #[builder(default = 10.0)]
    pub(crate) jitter_percent: f64,

    /// Hard per-attempt timeout. `Duration::ZERO` disables it.
    #[builder(default = Duration::from_secs(60))]
    pub(crate) attempt_timeout: Duration,

    /// Speak HTTP/2 to the upstream without negotiation.
    #[builder(default)]
    pub(crate) upstream_http2: bool,

    /// Upper bound on upstream dispatches for one logical request.
    #[builder(default = 10)]
    pub(crate) max_upstream_attempts: u32,

    /// How many transport failures are retried before a gateway error is returned.
    #[builder(default = 2)]
    pub(crate) max_transport_retries: u32,

    /// Request bodies are buffered for replay; larger bodies are rejected.
    #[builder(default = 10 * 1024 * 1024)]
    pub(crate) max_body_bytes: usize,
}

const fn default_limit_per_minute() -> u32 {
    200
}

impl FairShareSettings {
    /// Loads the settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the settings through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_upstream = lookup("UPSTREAM_BASE_URL")
            .filter(|value| !value.trim().is_empty())
            .context(MissingUpstreamSnafu)?;
        let upstream_base_url = parse_upstream(raw_upstream.trim())?;

        let attempt_timeout = parse_number::<f64, _>(&lookup, "UPSTREAM_TIMEOUT_SECONDS")?
            .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO));

        let settings = Self::builder()
            .upstream_base_url(upstream_base_url)
            .maybe_limit_per_minute(parse_number(&lookup, "LIMIT_PER_MINUTE")?)
            .maybe_active_window(parse_seconds(&lookup, "ACTIVE_WINDOW_SECONDS")?)
            .maybe_burst_window(parse_seconds(&lookup, "BURST_WINDOW_SECONDS")?)
            .maybe_preferred_max_wait(parse_seconds(&lookup, "PREFER_WAIT_DEFAULT")?)
            .maybe_max_connections(parse_number(&lookup, "OUTBOUND_MAX_CONNECTIONS")?)
            .maybe_max_keepalive(parse_number(&lookup, "OUTBOUND_MAX_KEEPALIVE")?)
            .maybe_throttled_fallback(parse_seconds(&lookup, "THROTTLED_FALLBACK_SECONDS")?)
            .maybe_unavailable_fallback_base(parse_seconds(
                &lookup,
                "UNAVAILABLE_FALLBACK_SECONDS",
            )?)
            .maybe_jitter_percent(parse_number(&lookup, "JITTER_PERCENT")?)
            .maybe_attempt_timeout(attempt_timeout)
            .maybe_upstream_http2(parse_flag(&lookup, "UPSTREAM_HTTP2")?)
            .maybe_max_upstream_attempts(parse_number(&lookup, "MAX_UPSTREAM_ATTEMPTS")?)
            .maybe_max_transport_retries(parse_number(&lookup, "MAX_TRANSPORT_RETRIES")?)
            .maybe_max_body_bytes(parse_number(&lookup, "MAX_BODY_BYTES")?)
            .build();

        settings.validate()?;
        Ok(settings)
    }

    /// Checks the cross-field constraints the builder cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scheme = self.upstream_base_url.scheme();
        ensure!(
            scheme == "http" || scheme == "https",
            UnsupportedSchemeSnafu { scheme }
        );
        ensure!(
            self.limit_per_minute > 0,
            InvalidValueSnafu {
                details: "LIMIT_PER_MINUTE must be greater than zero",
            }
        );
        ensure!(
            self.burst_window >= self.active_window,
            InvalidValueSnafu {
                details: "BURST_WINDOW_SECONDS must not be shorter than ACTIVE_WINDOW_SECONDS",
            }
        );
        ensure!(
            self.max_connections > 0 && self.max_keepalive <= self.max_connections,
            InvalidValueSnafu {
                details: "OUTBOUND_MAX_KEEPALIVE must not exceed a non-zero OUTBOUND_MAX_CONNECTIONS",
            }
        );
        ensure!(
            (0.0..=100.0).contains(&self.jitter_percent),
            InvalidValueSnafu {
                details: "JITTER_PERCENT must be within 0..=100",
            }
        );
        ensure!(
            self.max_upstream_attempts > 0,
            InvalidValueSnafu {
                details: "MAX_UPSTREAM_ATTEMPTS must be at least 1",
            }
        );
        Ok(())
    }

    pub fn upstream_base_url(&self) -> &Url {
        &self.upstream_base_url
    }

    pub fn limit_per_minute(&self) -> u32 {
        self.limit_per_minute
    }

    pub fn active_window(&self) -> Duration {
        self.active_window
    }

    pub fn burst_window(&self) -> Duration {
        self.burst_window
    }

    pub fn preferred_max_wait(&self) -> Duration {
        self.preferred_max_wait
    }

    /// The per-attempt timeout, or `None` when disabled.
    pub fn attempt_timeout(&self) -> Option<Duration> {
        (!self.attempt_timeout.is_zero()).then_some(self.attempt_timeout)
    }
}

fn parse_upstream(value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).context(InvalidUpstreamSnafu { value })?;
    ensure!(
        url.scheme() == "http" || url.scheme() == "https",
        UnsupportedSchemeSnafu {
            scheme: url.scheme(),
        }
    );
    Ok(url)
}

fn parse_number<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber {
                key: key.to_string(),
                value,
            }),
    }
}

fn parse_seconds<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(secs) = parse_number::<f64, _>(lookup, key)? else {
        return Ok(None);
    };
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|_| ConfigError::InvalidNumber {
            key: key.to_string(),
            value: secs.to_string(),
        })
}

fn parse_flag<F>(lookup: &F, key: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|value| value.trim().to_ascii_lowercase()) {
        None => Ok(None),
        Some(value) => match value.as_str() {
            "" => Ok(None),
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => InvalidNumberSnafu { key, value }.fail(),
        },
    }
}
