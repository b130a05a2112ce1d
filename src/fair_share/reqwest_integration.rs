use std::{
    fmt,
    sync::Arc,
    task::{Context, Poll, ready},
    time::Duration,
};

use axum::body::Body;
use bytes::Bytes;
use futures::{StreamExt, future::BoxFuture};
use http::{Request, Response};
use snafu::ResultExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower::{
    Service, ServiceBuilder,
    timeout::{Timeout, TimeoutLayer},
    util::Either,
};
use tokio_util::sync::PollSemaphore;

use super::{
    ConfigError, FairShareSettings, HttpClientSnafu, forward::filter_response_headers,
    http::UpstreamError,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// The upstream stack used in production: [`ReqwestService`] with an optional
/// per-attempt timeout in front of it.
pub type UpstreamService = Either<Timeout<ReqwestService>, ReqwestService>;

/// A `tower::Service` wrapper for `reqwest::Client`.
///
/// Concurrency towards the upstream is capped by a semaphore sized to the maximum
/// number of connections. `poll_ready` only resolves once a permit is held, and the
/// permit then lives until the response body has been streamed or dropped. Each clone
/// acquires its own permit.
pub struct ReqwestService {
    client: reqwest::Client,
    connections: PollSemaphore,
    permit: Option<OwnedSemaphorePermit>,
}

impl Clone for ReqwestService {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            connections: self.connections.clone(),
            permit: None,
        }
    }
}

impl fmt::Debug for ReqwestService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestService")
            .field("available_connections", &self.available_connections())
            .field("ready", &self.permit.is_some())
            .finish()
    }
}

impl ReqwestService {
    pub fn new(settings: &FairShareSettings) -> Result<Self, ConfigError> {
        Ok(Self::new_with_client(
            build_client(settings)?,
            settings.max_connections,
        ))
    }

    pub fn new_with_client(client: reqwest::Client, max_connections: usize) -> Self {
        Self {
            client,
            connections: PollSemaphore::new(Arc::new(Semaphore::new(max_connections))),
            permit: None,
        }
    }

    /// Connections currently free under the ceiling.
    pub fn available_connections(&self) -> usize {
        self.connections.available_permits()
    }
}

impl Service<Request<Bytes>> for ReqwestService {
    type Response = Response<Body>;
    type Error = UpstreamError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.permit.is_none() {
            let permit = ready!(self.connections.poll_acquire(cx));
            self.permit = Some(permit.ok_or(UpstreamError::PoolClosed)?);
        }
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, http_request: Request<Bytes>) -> Self::Future {
        let Some(permit) = self.permit.take() else {
            return Box::pin(async { Err(UpstreamError::NotReady) });
        };
        let (parts, body) = http_request.into_parts();

        let url_str = parts.uri.to_string();
        let url = match reqwest::Url::parse(&url_str) {
            Ok(url) => url,
            Err(parse_err) => {
                let error = UpstreamError::InvalidRequest {
                    details: format!("Invalid URL '{}': {}", url_str, parse_err),
                };
                return Box::pin(async move { Err(error) });
            }
        };

        let request = self
            .client
            .request(parts.method, url)
            .headers(parts.headers)
            .body(body);

        Box::pin(async move {
            let response = request.send().await.map_err(|error| {
                warn!(%error, "Upstream request failed");
                UpstreamError::from_reqwest(error)
            })?;

            let status = response.status();
            let version = response.version();
            let mut headers = response.headers().clone();
            filter_response_headers(&mut headers);

            let stream = response.bytes_stream().map(move |chunk| {
                let _connection = &permit;
                chunk
            });

            let mut proxied = Response::new(Body::from_stream(stream));
            *proxied.status_mut() = status;
            *proxied.version_mut() = version;
            *proxied.headers_mut() = headers;
            Ok(proxied)
        })
    }
}

/// Builds the pooled client. Idle connections are capped by `max_keepalive`.
pub fn build_client(settings: &FairShareSettings) -> Result<reqwest::Client, ConfigError> {
    let mut builder = reqwest::Client::builder()
        .tcp_nodelay(true)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(settings.max_keepalive)
        .connect_timeout(CONNECT_TIMEOUT)
        // Redirects belong to the caller.
        .redirect(reqwest::redirect::Policy::none());

    if settings.upstream_http2 {
        builder = builder.http2_prior_knowledge();
    }

    builder.build().context(HttpClientSnafu)
}

/// Assembles [`UpstreamService`] from the settings.
pub fn upstream_service(settings: &FairShareSettings) -> Result<UpstreamService, ConfigError> {
    let service = ReqwestService::new(settings)?;
    Ok(ServiceBuilder::new()
        .option_layer(settings.attempt_timeout().map(TimeoutLayer::new))
        .service(service))
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use axum::body::to_bytes;
    use futures::future::join_all;
    use http::StatusCode;
    use tokio::net::TcpListener;
    use tokio_test::{assert_pending, assert_ready_ok, task};
    use tower::ServiceExt;

    use super::*;

    #[derive(Default)]
    struct InFlight {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    /// An upstream answering `hello` after `delay`, tracking concurrent requests.
    async fn spawn_upstream(delay: Duration) -> (SocketAddr, Arc<InFlight>) {
        let in_flight = Arc::new(InFlight::default());
        let tracked = Arc::clone(&in_flight);
        let app = axum::Router::new().fallback(move || {
            let tracked = Arc::clone(&tracked);
            async move {
                let now = tracked.current.fetch_add(1, Ordering::SeqCst) + 1;
                tracked.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                tracked.current.fetch_sub(1, Ordering::SeqCst);
                "hello"
            }
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (addr, in_flight)
    }

    fn get(addr: SocketAddr) -> Request<Bytes> {
        Request::builder()
            .uri(format!("http://{addr}/"))
            .body(Bytes::new())
            .unwrap()
    }

    fn settings(pairs: &[(&str, &str)]) -> FairShareSettings {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        FairShareSettings::from_lookup(move |key| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })
        .unwrap()
    }

    #[tokio::test]
    async fn timeout_layer_is_optional() {
        let with_timeout = upstream_service(&settings(&[("UPSTREAM_BASE_URL", "http://127.0.0.1:9")]))
            .unwrap();
        assert!(matches!(with_timeout, Either::A(_)));

        let without = upstream_service(&settings(&[
            ("UPSTREAM_BASE_URL", "http://127.0.0.1:9"),
            ("UPSTREAM_TIMEOUT_SECONDS", "0"),
        ]))
        .unwrap();
        assert!(matches!(without, Either::B(_)));
    }

    #[tokio::test]
    async fn invalid_uri_is_not_dispatched() {
        let service = ReqwestService::new_with_client(reqwest::Client::new(), 1);
        let request = Request::builder()
            .uri("/relative/only")
            .body(Bytes::new())
            .unwrap();

        let error = service.clone().oneshot(request).await.unwrap_err();
        assert!(matches!(error, UpstreamError::InvalidRequest { .. }));
        assert!(!error.is_retriable());
        assert_eq!(service.available_connections(), 1);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let service = ReqwestService::new_with_client(reqwest::Client::new(), 2);
        let request = Request::builder()
            .uri(format!("http://{addr}/"))
            .body(Bytes::new())
            .unwrap();

        let error = service.clone().oneshot(request).await.unwrap_err();
        assert!(error.is_retriable());
        assert_eq!(service.available_connections(), 2);
    }

    #[tokio::test]
    async fn concurrent_calls_never_exceed_max_connections() {
        let (addr, in_flight) = spawn_upstream(Duration::from_millis(100)).await;
        let service = ReqwestService::new_with_client(reqwest::Client::new(), 2);

        let calls = (0..5).map(|_| {
            let service = service.clone();
            async move {
                let response = service.oneshot(get(addr)).await.unwrap();
                to_bytes(response.into_body(), usize::MAX).await.unwrap()
            }
        });
        for body in join_all(calls).await {
            assert_eq!(&body[..], b"hello");
        }

        assert_eq!(in_flight.peak.load(Ordering::SeqCst), 2);
        assert_eq!(service.available_connections(), 2);
    }

    #[tokio::test]
    async fn connection_is_held_until_the_body_is_consumed() {
        let (addr, _) = spawn_upstream(Duration::ZERO).await;
        let service = ReqwestService::new_with_client(reqwest::Client::new(), 1);

        let mut first = service.clone();
        ServiceExt::<Request<Bytes>>::ready(&mut first).await.unwrap();
        assert_eq!(service.available_connections(), 0);

        let mut second = service.clone();
        let mut second_ready = task::spawn(ServiceExt::<Request<Bytes>>::ready(&mut second));
        assert_pending!(second_ready.poll());

        let response = first.call(get(addr)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_pending!(second_ready.poll());
        assert_eq!(service.available_connections(), 0);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"hello");
        assert!(second_ready.is_woken());
        assert_ready_ok!(second_ready.poll());
    }

    #[tokio::test]
    async fn call_without_readiness_is_refused() {
        let mut service = ReqwestService::new_with_client(reqwest::Client::new(), 1);
        let error = service
            .call(get("127.0.0.1:9".parse().unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(error, UpstreamError::NotReady));
        assert_eq!(service.available_connections(), 1);
    }
}
