//! Fair-share admission.
//!
//! `share(now) = limit_per_minute / max(1, active_callers(now))`, recomputed on every
//! check. A caller is admitted while its admissions over the last minute are below the
//! current share (and the proxy as a whole is below `limit_per_minute`). Registry,
//! global window and pause live behind one lock so the active-caller count a decision
//! is based on is the count at the instant the decision is made.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::watch, time::Instant};

use super::{
    ACCOUNTING_WINDOW, FairShareSettings,
    internal_event::{
        AdmissionData, CallerEvicted, PauseData, PauseLifted, RequestAdmitted, UpstreamPaused,
        WaitCause,
    },
    pause::{PauseCell, PauseProposal, PauseReason},
    registry::{Registry, prune_window},
};

/// The read-only global window configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GlobalWindow {
    pub limit_per_minute: u32,
    pub active_window: Duration,
    pub burst_window: Duration,
}

impl From<&FairShareSettings> for GlobalWindow {
    fn from(settings: &FairShareSettings) -> Self {
        Self {
            limit_per_minute: settings.limit_per_minute,
            active_window: settings.active_window,
            burst_window: settings.burst_window,
        }
    }
}

/// Outcome of an admission check.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Admission {
    /// The caller may dispatch now; one unit was recorded against its window.
    Admit,
    /// The caller must wait at least `duration` before checking again.
    Wait { duration: Duration, cause: WaitCause },
}

impl Admission {
    pub const fn is_admit(&self) -> bool {
        matches!(self, Admission::Admit)
    }
}

pub(super) struct Ledger {
    pub(super) registry: Registry,
    pub(super) global: VecDeque<Instant>,
    pub(super) pause: PauseCell,
}

/// Shared fair-share state: registry, global window accounting and pause.
///
/// Created once at startup and handed to every request path behind an `Arc`.
pub struct FairShare {
    window: GlobalWindow,
    pub(super) ledger: Mutex<Ledger>,
    admitted: RequestAdmitted,
    evicted: CallerEvicted,
    paused: UpstreamPaused,
    lifted: PauseLifted,
}

impl FairShare {
    pub fn new(window: GlobalWindow) -> Self {
        Self {
            window,
            ledger: Mutex::new(Ledger {
                registry: Registry::new(window.active_window, window.burst_window),
                global: VecDeque::new(),
                pause: PauseCell::new(),
            }),
            admitted: RequestAdmitted::register(),
            evicted: CallerEvicted::register(),
            paused: UpstreamPaused::register(),
            lifted: PauseLifted::register(),
        }
    }

    pub fn from_settings(settings: &FairShareSettings) -> Self {
        Self::new(GlobalWindow::from(settings))
    }

    pub fn window(&self) -> GlobalWindow {
        self.window
    }

    /// Per-caller allowance in requests per minute at `now`.
    pub fn share(&self, now: Instant) -> f64 {
        let ledger = self.ledger.lock();
        share_for(self.window.limit_per_minute, ledger.registry.active_count(now))
    }

    pub fn active_count(&self, now: Instant) -> usize {
        self.ledger.lock().registry.active_count(now)
    }

    /// Dispatches the proxy may still make in the global window ending at `now`.
    pub fn global_remaining(&self, now: Instant) -> u32 {
        let ledger = self.ledger.lock();
        let used = ledger
            .global
            .iter()
            .filter(|at| now.saturating_duration_since(**at) < ACCOUNTING_WINDOW)
            .count();
        (self.window.limit_per_minute as usize).saturating_sub(used) as u32
    }

    /// Records that `connection_id` was seen at `now` without asking for admission.
    pub fn touch(&self, connection_id: &str, now: Instant) {
        let mut ledger = self.ledger.lock();
        self.sweep_locked(&mut ledger, now);
        ledger.registry.upsert(connection_id, now);
    }

    /// Removes callers silent for longer than the burst window.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut ledger = self.ledger.lock();
        self.sweep_locked(&mut ledger, now)
    }

    /// Decides whether `connection_id` may dispatch at `now`.
    ///
    /// Marks the caller as seen, then evaluates the pause, the caller's share and the
    /// global window in one critical section. On [`Admission::Admit`] the dispatch is
    /// recorded against both windows.
    pub fn admit(&self, connection_id: &str, now: Instant) -> Admission {
        let mut ledger = self.ledger.lock();
        self.sweep_locked(&mut ledger, now);

        if ledger.pause.clear_if_elapsed(now).is_some() {
            self.lifted.emit();
        }

        let Ledger {
            registry,
            global,
            pause,
        } = &mut *ledger;

        registry.upsert(connection_id, now);
        let active_callers = registry.active_count(now);
        let share = share_for(self.window.limit_per_minute, active_callers);

        if let Some(remaining) = pause.remaining(now) {
            return Admission::Wait {
                duration: remaining,
                cause: WaitCause::Paused,
            };
        }

        prune_window(global, now);
        let Some(record) = registry.get_mut(connection_id) else {
            return Admission::Wait {
                duration: Duration::ZERO,
                cause: WaitCause::CallerShare,
            };
        };

        let caller_wait = wait_for_capacity(record.admissions(), share, now);
        let global_wait = wait_for_capacity(global, self.window.limit_per_minute as f64, now);

        match (caller_wait, global_wait) {
            (None, None) => {
                record.record_admission(now);
                global.push_back(now);
                self.admitted.emit(AdmissionData {
                    connection_id,
                    active_callers,
                    share_per_minute: share,
                    requests_in_window: record.requests_in_window(),
                });
                Admission::Admit
            }
            (caller, global) => {
                let caller = caller.unwrap_or_default();
                let global = global.unwrap_or_default();
                if caller >= global {
                    Admission::Wait {
                        duration: caller,
                        cause: WaitCause::CallerShare,
                    }
                } else {
                    Admission::Wait {
                        duration: global,
                        cause: WaitCause::GlobalWindow,
                    }
                }
            }
        }
    }

    /// Like [`FairShare::admit`], but hands back a [`Reservation`] that returns the
    /// unit to the caller's window if it is dropped before being committed.
    pub fn reserve(
        self: &Arc<Self>,
        connection_id: &str,
        now: Instant,
    ) -> Result<Reservation, (Duration, WaitCause)> {
        match self.admit(connection_id, now) {
            Admission::Admit => Ok(Reservation {
                fair_share: Arc::clone(self),
                connection_id: connection_id.to_string(),
                ticket: now,
                committed: false,
            }),
            Admission::Wait { duration, cause } => Err((duration, cause)),
        }
    }

    /// Installs or extends the shared pause. The effective `resume_at` is the maximum
    /// of the stored and the proposed deadline.
    pub fn propose_pause(
        &self,
        wait: Duration,
        reason: PauseReason,
        from_hint: bool,
        now: Instant,
    ) -> PauseProposal {
        let proposal = self.ledger.lock().pause.propose(now + wait, reason, now);
        self.paused.emit(PauseData {
            reason,
            proposed: wait,
            resume_in: proposal.resume_at.saturating_duration_since(now),
            extended: proposal.extended,
            from_hint,
        });
        proposal
    }

    /// Time until the shared pause lifts, if one is in force.
    pub fn pause_remaining(&self, now: Instant) -> Option<Duration> {
        self.ledger.lock().pause.remaining(now)
    }

    pub fn subscribe_pause(&self) -> watch::Receiver<Option<Instant>> {
        self.ledger.lock().pause.subscribe()
    }

    fn release(&self, connection_id: &str, ticket: Instant) {
        let mut ledger = self.ledger.lock();
        if let Some(record) = ledger.registry.get_mut(connection_id) {
            record.forget_admission(ticket);
        }
        if let Some(index) = ledger.global.iter().rposition(|at| *at == ticket) {
            ledger.global.remove(index);
        }
    }

    fn sweep_locked(&self, ledger: &mut Ledger, now: Instant) -> usize {
        let evicted = ledger.registry.sweep(now);
        for connection_id in &evicted {
            self.evicted.emit(connection_id);
        }
        evicted.len()
    }
}

/// An admitted unit that has not been dispatched yet.
///
/// Dropping it uncommitted (for instance because the caller went away) gives the unit
/// back to the caller's and the global window.
pub struct Reservation {
    fair_share: Arc<FairShare>,
    connection_id: String,
    ticket: Instant,
    committed: bool,
}

impl Reservation {
    /// Marks the unit as spent on an upstream dispatch.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.fair_share.release(&self.connection_id, self.ticket);
        }
    }
}

/// `limit / max(1, active)`.
pub fn share_for(limit_per_minute: u32, active_callers: usize) -> f64 {
    limit_per_minute as f64 / active_callers.max(1) as f64
}

/// Time until a log holding the given admissions drops below `capacity`, or `None` when
/// it already is below it.
fn wait_for_capacity(log: &VecDeque<Instant>, capacity: f64, now: Instant) -> Option<Duration> {
    let used = log.len();
    if (used as f64) < capacity {
        return None;
    }
    // The oldest `used - ceil(capacity) + 1` entries must expire first.
    let must_expire = used + 1 - (capacity.ceil() as usize).min(used);
    let releasing = log.get(must_expire.saturating_sub(1))?;
    Some((*releasing + ACCOUNTING_WINDOW).saturating_duration_since(now))
}
