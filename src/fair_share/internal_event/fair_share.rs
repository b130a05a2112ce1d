use std::time::Duration;

use metrics::{Counter, Gauge, Histogram, counter, gauge, histogram};

use crate::fair_share::pause::PauseReason;
use crate::registered_event;

#[derive(Clone, Copy, Debug)]
pub struct AdmissionData<'a> {
    pub connection_id: &'a str,
    pub active_callers: usize,
    pub share_per_minute: f64,
    pub requests_in_window: usize,
}

/// What a suspended request is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitCause {
    /// The caller consumed its fair share of the current window.
    CallerShare,
    /// The whole proxy consumed `limit_per_minute` in the current window.
    GlobalWindow,
    /// The shared upstream pause is in force.
    Paused,
    /// Backing off after a transport failure.
    Transport,
}

impl WaitCause {
    pub const fn as_str(&self) -> &'static str {
        match self {
            WaitCause::CallerShare => "caller_share",
            WaitCause::GlobalWindow => "global_window",
            WaitCause::Paused => "paused",
            WaitCause::Transport => "transport",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct WaitData<'a> {
    pub connection_id: &'a str,
    pub wait: Duration,
    pub cause: WaitCause,
}

#[derive(Clone, Copy, Debug)]
pub struct PauseData {
    pub reason: PauseReason,
    pub proposed: Duration,
    pub resume_in: Duration,
    pub extended: bool,
    pub from_hint: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct FailureData<'a> {
    pub connection_id: &'a str,
    pub kind: &'static str,
    pub attempts: u32,
    pub waited: Duration,
}

#[derive(Clone, Copy, Debug)]
pub struct DisconnectData<'a> {
    pub connection_id: &'a str,
    pub attempts: u32,
    pub waited: Duration,
}

registered_event! {
    RequestAdmitted => {
        admitted: Counter = counter!("fair_share_admitted_total"),
        active_callers: Gauge = gauge!("fair_share_active_callers"),
        share: Histogram = histogram!("fair_share_share_per_minute"),
    }

    fn emit(&self, data: AdmissionData<'_>) {
        self.admitted.increment(1);
        self.active_callers.set(data.active_callers as f64);
        self.share.record(data.share_per_minute);

        tracing::debug!(
            target: "fair_share::events",
            connection_id = data.connection_id,
            active_callers = data.active_callers,
            share_per_minute = data.share_per_minute,
            requests_in_window = data.requests_in_window,
            "Admitted"
        );
    }
}

registered_event! {
    AdmissionWaited => {
        waits: Counter = counter!("fair_share_waits_total"),
        wait_seconds: Histogram = histogram!("fair_share_wait_seconds"),
    }

    fn emit(&self, data: WaitData<'_>) {
        self.waits.increment(1);
        self.wait_seconds.record(data.wait);

        tracing::debug!(
            target: "fair_share::events",
            connection_id = data.connection_id,
            wait_ms = data.wait.as_millis() as u64,
            cause = data.cause.as_str(),
            "Waiting"
        );
    }
}

registered_event! {
    UpstreamPaused => {
        signals: Counter = counter!("fair_share_upstream_signals_total"),
        extensions: Counter = counter!("fair_share_pause_extensions_total"),
        pause_seconds: Histogram = histogram!("fair_share_pause_seconds"),
    }

    fn emit(&self, data: PauseData) {
        self.signals.increment(1);
        if data.extended {
            self.extensions.increment(1);
            self.pause_seconds.record(data.resume_in);
        }

        tracing::info!(
            target: "fair_share::events",
            reason = data.reason.as_str(),
            proposed_ms = data.proposed.as_millis() as u64,
            resume_in_ms = data.resume_in.as_millis() as u64,
            extended = data.extended,
            from_hint = data.from_hint,
            "Paused"
        );
    }
}

registered_event! {
    PauseLifted => {
        lifted: Counter = counter!("fair_share_pause_lifted_total"),
    }

    fn emit(&self) {
        self.lifted.increment(1);
        tracing::info!(target: "fair_share::events", "Pause lifted");
    }
}

registered_event! {
    RequestFailed => {
        failures: Counter = counter!("fair_share_failed_total"),
    }

    fn emit(&self, data: FailureData<'_>) {
        self.failures.increment(1);

        tracing::warn!(
            target: "fair_share::events",
            connection_id = data.connection_id,
            kind = data.kind,
            attempts = data.attempts,
            waited_ms = data.waited.as_millis() as u64,
            "Failed"
        );
    }
}

registered_event! {
    CallerEvicted => {
        evicted: Counter = counter!("fair_share_evicted_total"),
    }

    fn emit(&self, connection_id: &str) {
        self.evicted.increment(1);
        tracing::debug!(target: "fair_share::events", connection_id, "Caller evicted");
    }
}

registered_event! {
    CallerDisconnected => {
        disconnected: Counter = counter!("fair_share_caller_disconnected_total"),
    }

    fn emit(&self, data: DisconnectData<'_>) {
        self.disconnected.increment(1);

        tracing::debug!(
            target: "fair_share::events",
            connection_id = data.connection_id,
            attempts = data.attempts,
            waited_ms = data.waited.as_millis() as u64,
            "Caller disconnected while suspended"
        );
    }
}
