use std::{borrow::Cow, time::Duration};

use chrono::{DateTime, Utc};
use http::{HeaderMap, StatusCode};
use rand::Rng;
use tokio::time::Instant;
use tower::timeout::error::Elapsed;

use super::{FairShareSettings, http::UpstreamError, pause::PauseReason};

/// Headers carrying a machine-readable reset hint, in order of preference.
pub const RESET_HINT_HEADERS: [&str; 4] = [
    "retry-after",
    "ratelimit-reset",
    "x-ratelimit-reset",
    "x-rate-limit-reset",
];

pub enum RetryAction {
    /// The upstream pushed back; wait (shared pause) and go through admission again.
    Backoff {
        reason: PauseReason,
        hint: Option<Duration>,
    },
    /// No response was obtained; retry a bounded number of times.
    Transport {
        reason: Cow<'static, str>,
        timed_out: bool,
    },
    /// Indicate that this request should not be retried with a reason
    DontRetry(Cow<'static, str>),
    /// Pass the response through to the caller.
    Successful,
}

impl RetryAction {
    pub const fn is_backoff(&self) -> bool {
        matches!(self, RetryAction::Backoff { .. })
    }

    pub const fn is_successful(&self) -> bool {
        matches!(self, RetryAction::Successful)
    }
}

/// Maps an upstream status to the pause it asks for. Only `429` and `503` are signals;
/// every other status, other 5xx included, belongs to the caller.
pub fn classify_status(status: StatusCode) -> Option<PauseReason> {
    match status {
        StatusCode::TOO_MANY_REQUESTS => Some(PauseReason::Throttled),
        StatusCode::SERVICE_UNAVAILABLE => Some(PauseReason::Unavailable),
        _ => None,
    }
}

/// Decides how an upstream attempt continues.
#[derive(Clone, Copy, Debug, Default)]
pub struct UpstreamRetryLogic;

impl UpstreamRetryLogic {
    pub fn should_retry_response(&self, status: StatusCode, headers: &HeaderMap) -> RetryAction {
        match classify_status(status) {
            Some(reason) => RetryAction::Backoff {
                reason,
                hint: reset_hint(headers, Utc::now()),
            },
            None => RetryAction::Successful,
        }
    }

    pub fn should_retry_error(&self, error: &crate::Error) -> RetryAction {
        if error.downcast_ref::<Elapsed>().is_some() {
            return RetryAction::Transport {
                reason: Cow::Borrowed("Attempt timed out"),
                timed_out: true,
            };
        }

        match error.downcast_ref::<UpstreamError>() {
            Some(UpstreamError::Timeout { .. }) => RetryAction::Transport {
                reason: Cow::Borrowed("Upstream request timed out"),
                timed_out: true,
            },
            Some(error) if !error.is_retriable() => {
                RetryAction::DontRetry(Cow::Owned(error.to_string()))
            }
            Some(error) => RetryAction::Transport {
                reason: Cow::Owned(error.to_string()),
                timed_out: false,
            },
            // Anything else reached us from below the pool and is treated as network level.
            None => RetryAction::Transport {
                reason: Cow::Owned(error.to_string()),
                timed_out: false,
            },
        }
    }
}

/// Reads the first parsable reset hint from `headers`.
///
/// Each header may carry delta-seconds (fractions allowed) or an HTTP-date, which is
/// measured against `now`. Dates in the past yield a zero wait.
pub fn reset_hint(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    RESET_HINT_HEADERS.iter().find_map(|name| {
        let value = headers.get(*name)?.to_str().ok()?.trim();
        parse_delta_seconds(value).or_else(|| parse_http_date(value, now))
    })
}

fn parse_delta_seconds(value: &str) -> Option<Duration> {
    let secs = value.parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

fn parse_http_date(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// The jitter mode to use for fallback waits.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum JitterMode {
    /// No jitter.
    #[default]
    None,

    /// Symmetric jitter.
    ///
    /// The wait is scaled by a uniformly random factor in `[1 - percent/100, 1 + percent/100]`.
    Symmetric { percent: f64 },
}

impl JitterMode {
    pub fn from_percent(percent: f64) -> Self {
        if percent > 0.0 {
            JitterMode::Symmetric { percent }
        } else {
            JitterMode::None
        }
    }

    pub fn apply(&self, base: Duration) -> Duration {
        match *self {
            JitterMode::None => base,
            JitterMode::Symmetric { percent } => {
                if base.is_zero() {
                    return base;
                }
                let percent = percent.clamp(0.0, 100.0);
                let offset = rand::rng().random_range(-percent..=percent);
                base.mul_f64(1.0 + offset / 100.0)
            }
        }
    }

    /// The `[low, high]` band a jittered `base` falls into.
    pub fn band(&self, base: Duration) -> (Duration, Duration) {
        match *self {
            JitterMode::None => (base, base),
            JitterMode::Symmetric { percent } => {
                let fraction = percent.clamp(0.0, 100.0) / 100.0;
                (base.mul_f64(1.0 - fraction), base.mul_f64(1.0 + fraction))
            }
        }
    }
}

/// A retry strategy driven by exponential back-off.
///
/// Yields `initial`, `initial * factor`, `initial * factor^2`, ... capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,
    initial: Duration,
    factor: u32,
    max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    pub const fn new(initial: Duration, factor: u32) -> ExponentialBackoff {
        ExponentialBackoff {
            current: initial,
            initial,
            factor,
            max_delay: None,
        }
    }

    /// Apply a maximum delay. No retry delay will be longer than this `Duration`.
    pub const fn max_delay(mut self, duration: Duration) -> ExponentialBackoff {
        self.max_delay = Some(duration);
        self
    }

    /// Resets the exponential back-off strategy to its initial state.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let duration = match self.max_delay {
            Some(max_delay) if self.current > max_delay => max_delay,
            _ => self.current,
        };
        self.current = self
            .current
            .checked_mul(self.factor)
            .unwrap_or(Duration::MAX);
        Some(duration)
    }
}

/// Fallback waits used when the upstream gives no usable reset hint.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    throttled_fallback: Duration,
    unavailable_base: Duration,
    jitter_mode: JitterMode,
}

impl BackoffPolicy {
    pub fn new(throttled_fallback: Duration, unavailable_base: Duration, jitter_mode: JitterMode) -> Self {
        Self {
            throttled_fallback,
            unavailable_base,
            jitter_mode,
        }
    }

    pub fn from_settings(settings: &FairShareSettings) -> Self {
        Self::new(
            settings.throttled_fallback,
            settings.unavailable_fallback_base,
            JitterMode::from_percent(settings.jitter_percent),
        )
    }

    pub fn jitter_mode(&self) -> JitterMode {
        self.jitter_mode
    }

    /// A fresh unavailability schedule: `base * 2^(attempt - 1)`.
    pub fn unavailable_schedule(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.unavailable_base, 2)
    }

    /// The wait after a signal. A parsable hint wins; otherwise throttling waits the
    /// constant fallback and unavailability the next step of `schedule`, both jittered.
    pub fn wait_for(
        &self,
        reason: PauseReason,
        hint: Option<Duration>,
        schedule: &mut ExponentialBackoff,
    ) -> Duration {
        if let Some(hint) = hint {
            return hint;
        }
        let base = match reason {
            PauseReason::Throttled => self.throttled_fallback,
            PauseReason::Unavailable => schedule.next().unwrap_or(self.unavailable_base),
        };
        self.jitter_mode.apply(base)
    }
}

/// Execution context of one logical request across its upstream attempts.
#[derive(Debug, Clone)]
pub struct UpstreamAttempt {
    /// Upstream dispatches issued so far.
    pub attempts: u32,
    /// Time spent suspended (allowance, pause and transport backoff).
    pub accumulated_wait: Duration,
    /// No suspension may extend past this instant.
    pub deadline: Instant,
    /// Transport failures seen so far.
    pub transport_failures: u32,
    pub(crate) unavailable: ExponentialBackoff,
    pub(crate) transport: ExponentialBackoff,
}

impl UpstreamAttempt {
    pub fn new(deadline: Instant, policy: &BackoffPolicy) -> Self {
        Self {
            attempts: 0,
            accumulated_wait: Duration::ZERO,
            deadline,
            transport_failures: 0,
            unavailable: policy.unavailable_schedule(),
            transport: ExponentialBackoff::new(Duration::from_millis(250), 2)
                .max_delay(Duration::from_secs(8)),
        }
    }

    /// Whether a suspension of `wait` starting at `now` still ends before the deadline.
    pub fn fits(&self, now: Instant, wait: Duration) -> bool {
        now + wait <= self.deadline
    }

    /// Consecutive unavailability only counts while nothing else happens in between.
    pub fn observe(&mut self, reason: Option<PauseReason>) {
        if reason != Some(PauseReason::Unavailable) {
            self.unavailable.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(*value));
        }
        headers
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn only_429_and_503_are_signals() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Some(PauseReason::Throttled)
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            Some(PauseReason::Unavailable)
        );
        for status in [
            StatusCode::OK,
            StatusCode::NOT_FOUND,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::GATEWAY_TIMEOUT,
        ] {
            assert_eq!(classify_status(status), None, "{status}");
        }
    }

    #[test]
    fn delta_seconds_hint() {
        assert_eq!(
            reset_hint(&headers(&[("retry-after", "7")]), now()),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            reset_hint(&headers(&[("x-ratelimit-reset", "1.5")]), now()),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn http_date_hint() {
        let hint = reset_hint(
            &headers(&[("retry-after", "Wed, 21 Oct 2015 07:28:30 GMT")]),
            now(),
        );
        assert_eq!(hint, Some(Duration::from_secs(30)));

        let past = reset_hint(
            &headers(&[("retry-after", "Wed, 21 Oct 2015 07:00:00 GMT")]),
            now(),
        );
        assert_eq!(past, Some(Duration::ZERO));
    }

    #[test]
    fn unparsable_hint_falls_through_to_next_header() {
        let hint = reset_hint(
            &headers(&[("retry-after", "soon"), ("ratelimit-reset", "4")]),
            now(),
        );
        assert_eq!(hint, Some(Duration::from_secs(4)));

        assert_eq!(reset_hint(&headers(&[("retry-after", "-3")]), now()), None);
        assert_eq!(reset_hint(&headers(&[("retry-after", "inf")]), now()), None);
        assert_eq!(reset_hint(&HeaderMap::new(), now()), None);
    }

    #[test]
    fn hint_determines_the_wait() {
        let policy = BackoffPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
            JitterMode::from_percent(50.0),
        );
        let mut schedule = policy.unavailable_schedule();
        let hint = Some(Duration::from_secs(12));
        assert_eq!(
            policy.wait_for(PauseReason::Throttled, hint, &mut schedule),
            Duration::from_secs(12)
        );
        assert_eq!(
            policy.wait_for(PauseReason::Unavailable, hint, &mut schedule),
            Duration::from_secs(12)
        );
    }

    #[test]
    fn throttling_fallback_is_constant() {
        let policy = BackoffPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
            JitterMode::None,
        );
        let mut schedule = policy.unavailable_schedule();
        for _ in 0..4 {
            assert_eq!(
                policy.wait_for(PauseReason::Throttled, None, &mut schedule),
                Duration::from_secs(1)
            );
        }
    }

    #[test]
    fn unavailability_fallback_doubles_per_consecutive_attempt() {
        let policy = BackoffPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
            JitterMode::None,
        );
        let mut schedule = policy.unavailable_schedule();
        let waits: Vec<_> = (0..4)
            .map(|_| policy.wait_for(PauseReason::Unavailable, None, &mut schedule))
            .collect();
        assert_eq!(
            waits,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(40),
            ]
        );
    }

    #[test]
    fn jittered_fallback_stays_within_band() {
        let jitter = JitterMode::from_percent(20.0);
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(5), jitter);

        for _ in 0..200 {
            let mut schedule = policy.unavailable_schedule();
            let first = policy.wait_for(PauseReason::Unavailable, None, &mut schedule);
            let second = policy.wait_for(PauseReason::Unavailable, None, &mut schedule);
            let (low, high) = jitter.band(Duration::from_secs(5));
            assert!(first >= low && first <= high, "{first:?}");
            let (low, high) = jitter.band(Duration::from_secs(10));
            assert!(second >= low && second <= high, "{second:?}");

            let throttled = policy.wait_for(PauseReason::Throttled, None, &mut schedule);
            let (low, high) = jitter.band(Duration::from_secs(1));
            assert!(throttled >= low && throttled <= high, "{throttled:?}");
        }
    }

    #[test]
    fn exponential_backoff_respects_max_delay() {
        let delays: Vec<_> = ExponentialBackoff::new(Duration::from_secs(1), 2)
            .max_delay(Duration::from_secs(5))
            .take(5)
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
    }

    #[test]
    fn errors_are_classified() {
        let logic = UpstreamRetryLogic;

        let elapsed: crate::Error = Box::new(Elapsed::new());
        assert!(matches!(
            logic.should_retry_error(&elapsed),
            RetryAction::Transport { timed_out: true, .. }
        ));

        let invalid: crate::Error = Box::new(UpstreamError::InvalidRequest {
            details: "bad uri".to_string(),
        });
        assert!(matches!(
            logic.should_retry_error(&invalid),
            RetryAction::DontRetry(_)
        ));

        let io: crate::Error = Box::new(std::io::Error::other("connection reset"));
        assert!(matches!(
            logic.should_retry_error(&io),
            RetryAction::Transport { timed_out: false, .. }
        ));
    }

    #[test]
    fn responses_are_classified() {
        let logic = UpstreamRetryLogic;
        assert!(logic.should_retry_response(StatusCode::OK, &HeaderMap::new()).is_successful());
        assert!(logic
            .should_retry_response(StatusCode::INTERNAL_SERVER_ERROR, &HeaderMap::new())
            .is_successful());
        assert!(logic
            .should_retry_response(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new())
            .is_backoff());
    }
}
