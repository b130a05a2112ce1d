use std::time::Duration;

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::{HeaderName, HeaderValue, StatusCode, header::RETRY_AFTER};
use serde_json::json;
use snafu::Snafu;

pub const X_WAIT_REQUIRED: HeaderName = HeaderName::from_static("x-wait-required");
pub const X_ACTIVE_CONNECTIONS: HeaderName = HeaderName::from_static("x-active-connections");
pub const X_RATE_PER_CONNECTION: HeaderName = HeaderName::from_static("x-rate-per-connection");
pub const X_RETRY_ATTEMPTS: HeaderName = HeaderName::from_static("x-retry-attempts");
pub const X_UPSTREAM_RETRY_AFTER: HeaderName = HeaderName::from_static("x-upstream-retry-after");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_RATELIMIT_REMAINING_GLOBAL: HeaderName =
    HeaderName::from_static("x-ratelimit-remaining-global");
pub const X_RATELIMIT_RATE_GLOBAL: HeaderName = HeaderName::from_static("x-ratelimit-rate-global");

/// Failures of a single upstream dispatch.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum UpstreamError {
    #[snafu(display("Failed to reach upstream: {}", source))]
    Transport { source: reqwest::Error },

    #[snafu(display("Upstream request timed out: {}", source))]
    Timeout { source: reqwest::Error },

    #[snafu(display("Invalid upstream request: {}", details))]
    InvalidRequest { details: String },

    #[snafu(display("Upstream connection limiter was closed"))]
    PoolClosed,

    #[snafu(display("Upstream called without a reserved connection"))]
    NotReady,
}

impl UpstreamError {
    pub fn from_reqwest(source: reqwest::Error) -> Self {
        if source.is_timeout() {
            UpstreamError::Timeout { source }
        } else if source.is_builder() {
            UpstreamError::InvalidRequest {
                details: source.to_string(),
            }
        } else {
            UpstreamError::Transport { source }
        }
    }

    pub const fn is_retriable(&self) -> bool {
        match self {
            UpstreamError::InvalidRequest { .. }
            | UpstreamError::PoolClosed
            | UpstreamError::NotReady => false,
            UpstreamError::Transport { .. } | UpstreamError::Timeout { .. } => true,
        }
    }
}

/// Request-time failures that end a logical request without an upstream response.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProxyError {
    #[snafu(display(
        "Local allowance exhausted after {} attempts, {:.3}s wait required",
        attempts,
        wait.as_secs_f64()
    ))]
    AdmissionTimeout {
        wait: Duration,
        attempts: u32,
        active_callers: usize,
        share_per_minute: f64,
    },

    #[snafu(display("Upstream unreachable after {} attempts: {}", attempts, source))]
    UpstreamTransport { attempts: u32, source: crate::Error },

    #[snafu(display("Upstream timed out after {} attempts", attempts))]
    UpstreamTimeout { attempts: u32 },

    #[snafu(display("Request body exceeds {} bytes", limit))]
    BodyTooLarge { limit: usize },

    #[snafu(display("Failed to read request body: {}", source))]
    ReadBody { source: axum::Error },

    #[snafu(display("Invalid request: {}", details))]
    BadRequest { details: String },
}

impl ProxyError {
    pub const fn kind(&self) -> &'static str {
        match self {
            ProxyError::AdmissionTimeout { .. } => "admission_timeout",
            ProxyError::UpstreamTransport { .. } => "upstream_transport",
            ProxyError::UpstreamTimeout { .. } => "upstream_timeout",
            ProxyError::BodyTooLarge { .. } => "body_too_large",
            ProxyError::ReadBody { .. } => "read_body",
            ProxyError::BadRequest { .. } => "bad_request",
        }
    }

    /// Upstream attempts made before the request failed.
    pub const fn attempts(&self) -> u32 {
        match self {
            ProxyError::AdmissionTimeout { attempts, .. }
            | ProxyError::UpstreamTransport { attempts, .. }
            | ProxyError::UpstreamTimeout { attempts } => *attempts,
            ProxyError::BodyTooLarge { .. }
            | ProxyError::ReadBody { .. }
            | ProxyError::BadRequest { .. } => 0,
        }
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            ProxyError::AdmissionTimeout { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::UpstreamTransport { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::ReadBody { .. } | ProxyError::BadRequest { .. } => {
                StatusCode::BAD_REQUEST
            }
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ProxyError::AdmissionTimeout {
                wait,
                attempts,
                active_callers,
                share_per_minute,
            } => {
                let wait_s = wait.as_secs_f64();
                let body = json!({
                    "detail": "rate_limited_local",
                    "wait_required_s": (wait_s * 1000.0).round() / 1000.0,
                    "attempts": attempts,
                });
                let mut response = (status, Json(body)).into_response();
                let headers = response.headers_mut();
                headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(wait)));
                insert_display(headers, X_WAIT_REQUIRED, format!("{wait_s:.3}"));
                headers.insert(X_ACTIVE_CONNECTIONS, HeaderValue::from(active_callers));
                insert_display(
                    headers,
                    X_RATE_PER_CONNECTION,
                    format!("{:.6}", share_per_minute / 60.0),
                );
                response
            }
            ProxyError::UpstreamTransport { .. } => {
                (status, Json(json!({ "detail": "upstream_unreachable" }))).into_response()
            }
            ProxyError::UpstreamTimeout { .. } => {
                (status, Json(json!({ "detail": "upstream_timeout" }))).into_response()
            }
            ProxyError::BodyTooLarge { limit } => (
                status,
                Json(json!({ "detail": "body_too_large", "limit_bytes": limit })),
            )
                .into_response(),
            ProxyError::ReadBody { .. } | ProxyError::BadRequest { .. } => {
                (status, Json(json!({ "detail": "bad_request" }))).into_response()
            }
        }
    }
}

/// Whole seconds for a `Retry-After` value, rounded up and never zero.
pub fn retry_after_secs(wait: Duration) -> u64 {
    (wait.as_secs_f64().ceil() as u64).max(1)
}

pub(crate) fn insert_display(headers: &mut http::HeaderMap, name: HeaderName, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}
