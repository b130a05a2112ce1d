//! Per-request retry loop.
//!
//! A logical request moves `ADMITTED -> SENT -> {SUCCESS, THROTTLED, UNAVAILABLE,
//! TRANSPORT_FAILURE}`. Throttling and unavailability install or extend the shared
//! pause and send the request back through admission once it lifts, so fairness is
//! re-applied after every pause. Every suspension is bounded by the request deadline.
//!
//! Dropping the future returned by [`Coordinator::execute`] is how a caller disconnect
//! is observed: no further upstream attempt is issued, an undispatched reservation is
//! handed back and the ledger stays consistent wherever the drop happens.

use std::{sync::Arc, time::Duration};

use axum::body::Body;
use bytes::Bytes;
use http::{Request, Response};
use tokio::time::{Instant, sleep, timeout_at};
use tower::{Service, ServiceExt};

use super::{
    FairShare, FairShareSettings,
    allocator::Reservation,
    forward::OutboundRequest,
    http::ProxyError,
    internal_event::{
        AdmissionWaited, CallerDisconnected, DisconnectData, FailureData, RequestFailed,
        WaitCause, WaitData,
    },
    pause::wait_until_resumed,
    retries::{BackoffPolicy, RetryAction, UpstreamAttempt, UpstreamRetryLogic},
};

/// An upstream response that is handed to the caller, together with what it took.
#[derive(Debug)]
pub struct Completed {
    pub response: Response<Body>,
    pub attempts: u32,
    pub active_callers: usize,
    pub share_per_minute: f64,
    /// Dispatches left in the proxy-wide window.
    pub global_remaining: u32,
    pub global_per_minute: u32,
    /// Set when the attempt budget ran out on a throttling or unavailability signal.
    pub upstream_retry_after: Option<Duration>,
}

pub struct Coordinator<S> {
    fair_share: Arc<FairShare>,
    upstream: S,
    retry_logic: UpstreamRetryLogic,
    backoff: BackoffPolicy,
    max_upstream_attempts: u32,
    max_transport_retries: u32,
    waited: AdmissionWaited,
    failed: RequestFailed,
    disconnected: CallerDisconnected,
}

impl<S> Coordinator<S>
where
    S: Service<Request<Bytes>, Response = Response<Body>> + Clone,
    S::Error: Into<crate::Error>,
{
    pub fn new(fair_share: Arc<FairShare>, upstream: S, settings: &FairShareSettings) -> Self {
        Self {
            fair_share,
            upstream,
            retry_logic: UpstreamRetryLogic,
            backoff: BackoffPolicy::from_settings(settings),
            max_upstream_attempts: settings.max_upstream_attempts,
            max_transport_retries: settings.max_transport_retries,
            waited: AdmissionWaited::register(),
            failed: RequestFailed::register(),
            disconnected: CallerDisconnected::register(),
        }
    }

    pub fn fair_share(&self) -> &Arc<FairShare> {
        &self.fair_share
    }

    /// Drives `request` for `connection_id` until the upstream produces a response the
    /// caller should see, or a budget runs out. `max_wait` bounds the total time the
    /// request may spend suspended.
    pub async fn execute(
        &self,
        connection_id: &str,
        request: OutboundRequest,
        max_wait: Duration,
    ) -> Result<Completed, ProxyError> {
        let started = Instant::now();
        let mut guard = DisconnectGuard {
            connection_id,
            event: &self.disconnected,
            attempt: UpstreamAttempt::new(started + max_wait, &self.backoff),
            started,
            armed: true,
        };

        let result = self.run(connection_id, &request, &mut guard.attempt).await;
        guard.armed = false;

        if let Err(error) = &result {
            self.failed.emit(FailureData {
                connection_id,
                kind: error.kind(),
                attempts: guard.attempt.attempts,
                waited: started.elapsed(),
            });
        }
        result
    }

    async fn run(
        &self,
        connection_id: &str,
        request: &OutboundRequest,
        attempt: &mut UpstreamAttempt,
    ) -> Result<Completed, ProxyError> {
        loop {
            self.wait_for_pause(connection_id, attempt).await?;

            // A connection is held before admission is decided, so a pause installed
            // while this request queued for the pool is seen by `reserve`.
            let service = self.ready_upstream(attempt).await?;
            let reservation = match self.fair_share.reserve(connection_id, Instant::now()) {
                Ok(reservation) => reservation,
                Err((_, WaitCause::Paused)) => continue,
                Err((wait, cause)) => {
                    drop(service);
                    self.suspend(connection_id, attempt, wait, cause).await?;
                    continue;
                }
            };

            attempt.attempts += 1;
            let outcome = self.dispatch(service, reservation, request.to_request()).await;
            let now = Instant::now();

            let error = match outcome {
                Ok(response) => {
                    let action = self
                        .retry_logic
                        .should_retry_response(response.status(), response.headers());
                    let RetryAction::Backoff { reason, hint } = action else {
                        attempt.observe(None);
                        return Ok(self.completed(response, attempt, None, now));
                    };

                    attempt.observe(Some(reason));
                    let wait = self.backoff.wait_for(reason, hint, &mut attempt.unavailable);
                    let proposal = self
                        .fair_share
                        .propose_pause(wait, reason, hint.is_some(), now);
                    let resume_in = proposal.resume_at.saturating_duration_since(now);

                    if attempt.attempts >= self.max_upstream_attempts
                        || !attempt.fits(now, resume_in)
                    {
                        self.failed.emit(FailureData {
                            connection_id,
                            kind: reason.as_str(),
                            attempts: attempt.attempts,
                            waited: attempt.accumulated_wait,
                        });
                        return Ok(self.completed(response, attempt, Some(resume_in), now));
                    }

                    debug!(
                        connection_id,
                        status = response.status().as_u16(),
                        reason = %reason,
                        resume_in_ms = resume_in.as_millis() as u64,
                        attempts = attempt.attempts,
                        "Upstream pushed back, retrying after pause"
                    );
                    continue;
                }
                Err(error) => error,
            };

            attempt.observe(None);
            match self.retry_logic.should_retry_error(&error) {
                RetryAction::Transport { reason, timed_out } => {
                    attempt.transport_failures += 1;
                    let wait = attempt.transport.next().unwrap_or_default();

                    if attempt.transport_failures > self.max_transport_retries
                        || !attempt.fits(now, wait)
                    {
                        let attempts = attempt.attempts;
                        return Err(if timed_out {
                            ProxyError::UpstreamTimeout { attempts }
                        } else {
                            ProxyError::UpstreamTransport {
                                attempts,
                                source: error,
                            }
                        });
                    }

                    warn!(
                        connection_id,
                        reason = %reason,
                        failures = attempt.transport_failures,
                        "Upstream transport failure, retrying"
                    );
                    self.suspend(connection_id, attempt, wait, WaitCause::Transport)
                        .await?;
                }
                RetryAction::DontRetry(reason) => {
                    return Err(ProxyError::BadRequest {
                        details: reason.into_owned(),
                    });
                }
                RetryAction::Backoff { .. } | RetryAction::Successful => {
                    return Err(ProxyError::UpstreamTransport {
                        attempts: attempt.attempts,
                        source: error,
                    });
                }
            }
        }
    }

    /// Waits, within the deadline, for an upstream service that can take one request.
    async fn ready_upstream(&self, attempt: &mut UpstreamAttempt) -> Result<S, ProxyError> {
        let started = Instant::now();
        let ready = timeout_at(attempt.deadline, self.upstream.clone().ready_oneshot()).await;
        attempt.accumulated_wait += started.elapsed();

        match ready {
            Ok(Ok(service)) => Ok(service),
            Ok(Err(error)) => Err(ProxyError::UpstreamTransport {
                attempts: attempt.attempts,
                source: error.into(),
            }),
            Err(_) => {
                let now = Instant::now();
                let remaining = self.fair_share.pause_remaining(now).unwrap_or_default();
                Err(self.admission_timeout(remaining, attempt, now))
            }
        }
    }

    async fn dispatch(
        &self,
        mut service: S,
        reservation: Reservation,
        request: Request<Bytes>,
    ) -> Result<Response<Body>, crate::Error> {
        reservation.commit();
        service.call(request).await.map_err(Into::into)
    }

    async fn wait_for_pause(
        &self,
        connection_id: &str,
        attempt: &mut UpstreamAttempt,
    ) -> Result<(), ProxyError> {
        let now = Instant::now();
        let Some(remaining) = self.fair_share.pause_remaining(now) else {
            return Ok(());
        };
        if !attempt.fits(now, remaining) {
            return Err(self.admission_timeout(remaining, attempt, now));
        }

        self.waited.emit(WaitData {
            connection_id,
            wait: remaining,
            cause: WaitCause::Paused,
        });

        let resumed = timeout_at(
            attempt.deadline,
            wait_until_resumed(self.fair_share.subscribe_pause()),
        )
        .await;
        attempt.accumulated_wait += now.elapsed();

        match resumed {
            Ok(()) => Ok(()),
            // Extended past the deadline while waiting.
            Err(_) => {
                let now = Instant::now();
                let remaining = self.fair_share.pause_remaining(now).unwrap_or_default();
                Err(self.admission_timeout(remaining, attempt, now))
            }
        }
    }

    async fn suspend(
        &self,
        connection_id: &str,
        attempt: &mut UpstreamAttempt,
        wait: Duration,
        cause: WaitCause,
    ) -> Result<(), ProxyError> {
        let now = Instant::now();
        if !attempt.fits(now, wait) {
            return Err(self.admission_timeout(wait, attempt, now));
        }

        self.waited.emit(WaitData {
            connection_id,
            wait,
            cause,
        });
        sleep(wait).await;
        attempt.accumulated_wait += wait;
        Ok(())
    }

    fn admission_timeout(
        &self,
        wait: Duration,
        attempt: &UpstreamAttempt,
        now: Instant,
    ) -> ProxyError {
        ProxyError::AdmissionTimeout {
            wait,
            attempts: attempt.attempts,
            active_callers: self.fair_share.active_count(now),
            share_per_minute: self.fair_share.share(now),
        }
    }

    fn completed(
        &self,
        response: Response<Body>,
        attempt: &UpstreamAttempt,
        upstream_retry_after: Option<Duration>,
        now: Instant,
    ) -> Completed {
        Completed {
            response,
            attempts: attempt.attempts,
            active_callers: self.fair_share.active_count(now),
            share_per_minute: self.fair_share.share(now),
            global_remaining: self.fair_share.global_remaining(now),
            global_per_minute: self.fair_share.window().limit_per_minute,
            upstream_retry_after,
        }
    }
}

/// Reports a request whose future was dropped before it finished.
struct DisconnectGuard<'a> {
    connection_id: &'a str,
    event: &'a CallerDisconnected,
    attempt: UpstreamAttempt,
    started: Instant,
    armed: bool,
}

impl Drop for DisconnectGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.event.emit(DisconnectData {
                connection_id: self.connection_id,
                attempts: self.attempt.attempts,
                waited: self.started.elapsed(),
            });
        }
    }
}
