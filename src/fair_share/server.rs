//! HTTP surface of the proxy.
//!
//! `GET /__status` serves the ledger snapshot; every other request is forwarded to
//! the upstream through the [`Coordinator`].

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::{Body, Bytes, to_bytes},
    extract::{ConnectInfo, Request, State},
    response::{IntoResponse, Response},
    routing::get,
};
use http::{HeaderValue, request::Parts};
use http_body_util::LengthLimitError;
use tokio::{net::TcpListener, time::Instant};
use tower::Service;
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use uuid::Uuid;

use super::{
    ConfigError, FairShare, FairShareSettings,
    coordinator::{Completed, Coordinator},
    derive_identity,
    forward::{OutboundRequest, forwardable_request_headers, preferred_wait, upstream_uri},
    http::{
        ProxyError, X_ACTIVE_CONNECTIONS, X_RATE_PER_CONNECTION, X_REQUEST_ID, X_RETRY_ATTEMPTS,
        X_RATELIMIT_RATE_GLOBAL, X_RATELIMIT_REMAINING_GLOBAL, X_UPSTREAM_RETRY_AFTER,
        insert_display,
    },
    reqwest_integration::{UpstreamService, upstream_service},
    status::StatusSnapshot,
};

pub const STATUS_PATH: &str = "/__status";

pub struct AppState<S> {
    coordinator: Arc<Coordinator<S>>,
    settings: Arc<FairShareSettings>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
            settings: Arc::clone(&self.settings),
        }
    }
}

/// The proxy: shared fair-share ledger, upstream stack and router.
pub struct ProxyServer<S = UpstreamService> {
    state: AppState<S>,
}

impl ProxyServer<UpstreamService> {
    /// Builds the proxy with the pooled `reqwest` upstream described by `settings`.
    pub fn new(settings: FairShareSettings) -> Result<Self, ConfigError> {
        let upstream = upstream_service(&settings)?;
        Ok(Self::with_upstream(settings, upstream))
    }
}

impl<S> ProxyServer<S>
where
    S: Service<http::Request<Bytes>, Response = Response<Body>> + Clone + Send + Sync + 'static,
    S::Future: Send,
    S::Error: Into<crate::Error>,
{
    pub fn with_upstream(settings: FairShareSettings, upstream: S) -> Self {
        let fair_share = Arc::new(FairShare::from_settings(&settings));
        let coordinator = Arc::new(Coordinator::new(fair_share, upstream, &settings));
        Self {
            state: AppState {
                coordinator,
                settings: Arc::new(settings),
            },
        }
    }

    pub fn fair_share(&self) -> &Arc<FairShare> {
        self.state.coordinator.fair_share()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(STATUS_PATH, get(status::<S>))
            .fallback(proxy::<S>)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Binds `addr` and serves until ctrl-c.
    pub async fn run(self, addr: SocketAddr) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(
            addr = %listener.local_addr()?,
            upstream = %self.state.settings.upstream_base_url(),
            limit_per_minute = self.state.settings.limit_per_minute(),
            "Proxy listening"
        );
        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(error) => {
            error!(%error, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}

async fn status<S>(State(state): State<AppState<S>>) -> Json<StatusSnapshot>
where
    S: Service<http::Request<Bytes>, Response = Response<Body>> + Clone,
    S::Error: Into<crate::Error>,
{
    Json(state.coordinator.fair_share().snapshot(Instant::now()))
}

async fn proxy<S>(
    State(state): State<AppState<S>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response
where
    S: Service<http::Request<Bytes>, Response = Response<Body>> + Clone + Send + Sync + 'static,
    S::Future: Send,
    S::Error: Into<crate::Error>,
{
    let started = Instant::now();
    let (parts, body) = request.into_parts();

    let request_id = parts
        .headers
        .get(X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let connection_id = derive_identity(
        &parts.headers,
        connect_info.map(|ConnectInfo(addr)| addr),
    );

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %parts.method,
        path = %parts.uri.path(),
    );

    async move {
        let result = forward(&state, &parts, body, &connection_id, &request_id).await;

        let (mut response, attempts) = match result {
            Ok(completed) => {
                let attempts = completed.attempts;
                (decorate(completed), attempts)
            }
            Err(error) => {
                let attempts = error.attempts();
                warn!(
                    connection_id = %connection_id,
                    kind = error.kind(),
                    attempts,
                    %error,
                    "Request failed"
                );
                (error.into_response(), attempts)
            }
        };

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }

        let now = Instant::now();
        let fair_share = state.coordinator.fair_share();
        info!(
            target: "fair_share::access",
            status = response.status().as_u16(),
            latency_ms = now.duration_since(started).as_millis() as u64,
            connection_id = %connection_id,
            attempts,
            active_conns = fair_share.active_count(now),
            rate_per_conn = fair_share.share(now) / 60.0,
            "Request completed"
        );
        response
    }
    .instrument(span)
    .await
}

async fn forward<S>(
    state: &AppState<S>,
    parts: &Parts,
    body: Body,
    connection_id: &str,
    request_id: &str,
) -> Result<Completed, ProxyError>
where
    S: Service<http::Request<Bytes>, Response = Response<Body>> + Clone,
    S::Error: Into<crate::Error>,
{
    let settings = &state.settings;
    let max_wait = preferred_wait(&parts.headers, settings.preferred_max_wait());

    let body = to_bytes(body, settings.max_body_bytes)
        .await
        .map_err(|error| body_error(error, settings.max_body_bytes))?;

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or("/");
    let uri = upstream_uri(settings.upstream_base_url(), path_and_query).map_err(|error| {
        ProxyError::BadRequest {
            details: error.to_string(),
        }
    })?;

    let outbound = OutboundRequest {
        method: parts.method.clone(),
        uri,
        headers: forwardable_request_headers(&parts.headers, request_id),
        body,
    };
    state
        .coordinator
        .execute(connection_id, outbound, max_wait)
        .await
}

fn body_error(error: axum::Error, limit: usize) -> ProxyError {
    let too_large = std::error::Error::source(&error)
        .is_some_and(|source| source.is::<LengthLimitError>());
    if too_large {
        ProxyError::BodyTooLarge { limit }
    } else {
        ProxyError::ReadBody { source: error }
    }
}

/// Adds the diagnostic headers to an upstream response.
fn decorate(completed: Completed) -> Response {
    let Completed {
        mut response,
        attempts,
        active_callers,
        share_per_minute,
        global_remaining,
        global_per_minute,
        upstream_retry_after,
    } = completed;

    let headers = response.headers_mut();
    headers.insert(X_RETRY_ATTEMPTS, HeaderValue::from(attempts));
    headers.insert(X_ACTIVE_CONNECTIONS, HeaderValue::from(active_callers));
    insert_display(
        headers,
        X_RATE_PER_CONNECTION,
        format!("{:.6}", share_per_minute / 60.0),
    );
    headers.insert(X_RATELIMIT_REMAINING_GLOBAL, HeaderValue::from(global_remaining));
    insert_display(
        headers,
        X_RATELIMIT_RATE_GLOBAL,
        format!("{:.4}", global_per_minute as f64 / 60.0),
    );
    if let Some(wait) = upstream_retry_after {
        insert_display(headers, X_UPSTREAM_RETRY_AFTER, format_secs(wait));
    }
    response
}

fn format_secs(duration: Duration) -> String {
    format!("{:.3}", duration.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use http::{Method, StatusCode};
    use tower::ServiceExt;
    use tower_test::mock::{self, Handle, Mock};

    use super::*;

    type UpstreamMock = Mock<http::Request<Bytes>, Response<Body>>;
    type UpstreamHandle = Handle<http::Request<Bytes>, Response<Body>>;

    fn server(settings: FairShareSettings) -> (ProxyServer<UpstreamMock>, UpstreamHandle) {
        let (service, handle) = mock::pair::<http::Request<Bytes>, Response<Body>>();
        (ProxyServer::with_upstream(settings, service), handle)
    }

    fn settings() -> FairShareSettings {
        FairShareSettings::builder()
            .upstream_base_url("http://upstream.test/base/".parse().unwrap())
            .jitter_percent(0.0)
            .build()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn status_reports_empty_ledger() {
        let (server, _handle) = server(settings());
        let response = server
            .router()
            .oneshot(http::Request::get(STATUS_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({
                "callers": [],
                "paused": false,
                "pause_resume_in_seconds": null,
            })
        );
    }

    #[tokio::test]
    async fn requests_are_forwarded_and_decorated() {
        let (server, mut handle) = server(settings());
        let router = server.router();

        let call = tokio::spawn(
            router.oneshot(
                http::Request::post("/v1/items?page=2")
                    .header("host", "proxy.local")
                    .header("x-connection-id", "worker-1")
                    .header("x-request-id", "req-42")
                    .header("content-type", "text/plain")
                    .body(Body::from("hello"))
                    .unwrap(),
            ),
        );

        let (sent, reply) = handle.next_request().await.unwrap();
        assert_eq!(sent.method(), Method::POST);
        assert_eq!(sent.uri(), "http://upstream.test/base/v1/items?page=2");
        assert_eq!(sent.headers()["x-request-id"], "req-42");
        assert_eq!(sent.headers()["x-connection-id"], "worker-1");
        assert!(!sent.headers().contains_key("host"));
        assert_eq!(sent.body(), &Bytes::from_static(b"hello"));
        reply.send_response(
            Response::builder()
                .status(StatusCode::CREATED)
                .body(Body::from("created"))
                .unwrap(),
        );

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let headers = response.headers();
        assert_eq!(headers[X_REQUEST_ID], "req-42");
        assert_eq!(headers[X_RETRY_ATTEMPTS], "1");
        assert_eq!(headers[X_ACTIVE_CONNECTIONS], "1");
        assert_eq!(headers[X_RATE_PER_CONNECTION], "3.333333");
        assert_eq!(headers[X_RATELIMIT_REMAINING_GLOBAL], "199");
        assert_eq!(headers[X_RATELIMIT_RATE_GLOBAL], "3.3333");
        assert!(!headers.contains_key(X_UPSTREAM_RETRY_AFTER));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"created");

        let snapshot = server.fair_share().snapshot(Instant::now());
        assert_eq!(snapshot.callers.len(), 1);
        assert_eq!(snapshot.callers[0].connection_id, "worker-1");
    }

    #[tokio::test]
    async fn request_id_is_generated_when_missing() {
        let (server, mut handle) = server(settings());
        let call = tokio::spawn(
            server
                .router()
                .oneshot(http::Request::get("/").body(Body::empty()).unwrap()),
        );

        let (sent, reply) = handle.next_request().await.unwrap();
        let forwarded_id = sent.headers()["x-request-id"].clone();
        assert!(Uuid::parse_str(forwarded_id.to_str().unwrap()).is_ok());
        reply.send_response(Response::new(Body::empty()));

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.headers()[X_REQUEST_ID], forwarded_id);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let mut settings = settings();
        settings.max_body_bytes = 4;
        let (server, _handle) = server(settings);

        let response = server
            .router()
            .oneshot(http::Request::post("/upload").body(Body::from("too large")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn exhausted_allowance_with_no_wait_is_rate_limited_locally() {
        let mut settings = settings();
        settings.limit_per_minute = 1;
        let (server, mut handle) = server(settings);
        let router = server.router();

        let first = tokio::spawn(router.clone().oneshot(
            http::Request::get("/a").header("x-connection-id", "solo").body(Body::empty()).unwrap(),
        ));
        let (_, reply) = handle.next_request().await.unwrap();
        reply.send_response(Response::new(Body::empty()));
        assert_eq!(first.await.unwrap().unwrap().status(), StatusCode::OK);

        let response = router
            .oneshot(
                http::Request::get("/a")
                    .header("x-connection-id", "solo")
                    .header("prefer", "wait=0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        assert!(response.headers().contains_key(X_REQUEST_ID));
        let body = json_body(response).await;
        assert_eq!(body["detail"], "rate_limited_local");
        assert_eq!(body["attempts"], 0);
    }
}
