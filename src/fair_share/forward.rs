//! Mapping between inbound requests, outbound upstream requests and the responses
//! handed back to callers.

use std::time::Duration;

use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, Request, Uri,
    header::{CONNECTION, HOST},
};
use url::Url;

use super::http::{UpstreamError, X_REQUEST_ID};

/// Headers that describe a single hop and must not be forwarded in either direction.
/// The body framing headers are dropped as well since the body is re-framed here.
pub const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "content-encoding",
];

fn is_hop_by_hop(name: &HeaderName, listed: &[String]) -> bool {
    HOP_BY_HOP.contains(&name.as_str()) || listed.iter().any(|token| token == name.as_str())
}

/// Tokens named by the `Connection` header are hop-by-hop for this message only.
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// The forwarding-safe subset of inbound request headers, with `X-Request-ID` set.
pub fn forwardable_request_headers(headers: &HeaderMap, request_id: &str) -> HeaderMap {
    let listed = connection_tokens(headers);
    let mut forwarded = HeaderMap::with_capacity(headers.len() + 1);
    for (name, value) in headers {
        if name == HOST || is_hop_by_hop(name, &listed) {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        forwarded.insert(X_REQUEST_ID, value);
    }
    forwarded
}

/// Strips hop-by-hop headers from an upstream response in place.
pub fn filter_response_headers(headers: &mut HeaderMap) {
    let listed = connection_tokens(headers);
    let drop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name, &listed))
        .cloned()
        .collect();
    for name in drop {
        headers.remove(name);
    }
}

/// Appends the inbound path and query to the upstream base address.
pub fn upstream_uri(base: &Url, path_and_query: &str) -> Result<Uri, UpstreamError> {
    let base = base.as_str().trim_end_matches('/');
    let path_and_query = if path_and_query.starts_with('/') {
        path_and_query.to_string()
    } else {
        format!("/{path_and_query}")
    };
    format!("{base}{path_and_query}")
        .parse::<Uri>()
        .map_err(|error| UpstreamError::InvalidRequest {
            details: error.to_string(),
        })
}

/// Reads the `wait=<seconds>` preference of a `Prefer` header, falling back to `default`.
pub fn preferred_wait(headers: &HeaderMap, default: Duration) -> Duration {
    headers
        .get_all("prefer")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split([',', ';']))
        .filter_map(|pref| {
            let (key, value) = pref.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("wait")
                .then(|| value.trim().trim_matches('"').parse::<f64>().ok())
                .flatten()
        })
        .find_map(|secs| {
            (secs.is_finite() && secs >= 0.0)
                .then(|| Duration::try_from_secs_f64(secs).ok())
                .flatten()
        })
        .unwrap_or(default)
}

/// A fully buffered outbound request that can be replayed on every attempt.
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    pub fn to_request(&self) -> Request<Bytes> {
        let mut request = Request::new(self.body.clone());
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.headers_mut() = self.headers.clone();
        request
    }
}
