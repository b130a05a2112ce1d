//! The process-wide upstream pause.
//!
//! Any request that sees a throttling or unavailability signal proposes a `resume_at`.
//! The stored value only ever moves forward, so concurrent proposals converge on the
//! latest one. Waiters subscribe to a `watch` channel and are woken whenever the
//! deadline is extended, instead of each holding an independent timer.

use std::{fmt, time::Duration};

use serde::Serialize;
use tokio::{
    sync::watch,
    time::{Instant, sleep_until},
};

/// Why the upstream is paused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// The upstream reported that its rate limit was exceeded (`429`).
    Throttled,
    /// The upstream reported temporary overload (`503`).
    Unavailable,
}

impl PauseReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            PauseReason::Throttled => "throttled",
            PauseReason::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PauseState {
    pub active: bool,
    pub resume_at: Instant,
    pub reason: PauseReason,
}

/// Result of proposing a pause.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PauseProposal {
    /// The `resume_at` in force after the proposal.
    pub resume_at: Instant,
    /// Whether the proposal installed or extended the pause.
    pub extended: bool,
}

/// Holder of the [`PauseState`] singleton and its wake-up channel.
///
/// Mutated only while the fair-share ledger lock is held, which makes installation and
/// extension linearizable with admission decisions.
#[derive(Debug)]
pub struct PauseCell {
    state: Option<PauseState>,
    tx: watch::Sender<Option<Instant>>,
}

impl Default for PauseCell {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { state: None, tx }
    }

    /// Installs a pause until `resume_at`, or extends the current one.
    ///
    /// The effective deadline is `max(current, proposed)`: a shorter proposal never
    /// shortens an active pause.
    pub fn propose(
        &mut self,
        resume_at: Instant,
        reason: PauseReason,
        now: Instant,
    ) -> PauseProposal {
        let current = self.state.filter(|state| state.active && state.resume_at > now);
        match current {
            Some(state) if state.resume_at >= resume_at => PauseProposal {
                resume_at: state.resume_at,
                extended: false,
            },
            _ if resume_at <= now => PauseProposal {
                resume_at: now,
                extended: false,
            },
            _ => {
                self.state = Some(PauseState {
                    active: true,
                    resume_at,
                    reason,
                });
                self.tx.send_replace(Some(resume_at));
                PauseProposal {
                    resume_at,
                    extended: true,
                }
            }
        }
    }

    /// Clears a pause whose `resume_at` has passed. Returns the cleared state.
    pub fn clear_if_elapsed(&mut self, now: Instant) -> Option<PauseState> {
        match self.state {
            Some(state) if state.active && state.resume_at <= now => {
                self.state = Some(PauseState {
                    active: false,
                    ..state
                });
                self.tx.send_replace(None);
                Some(state)
            }
            _ => None,
        }
    }

    pub fn state(&self) -> Option<PauseState> {
        self.state
    }

    /// Time left before the pause lifts, `None` when no pause is in force at `now`.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.state
            .filter(|state| state.active && state.resume_at > now)
            .map(|state| state.resume_at - now)
    }

    pub fn is_paused(&self, now: Instant) -> bool {
        self.remaining(now).is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Instant>> {
        self.tx.subscribe()
    }
}

/// Suspends until the shared pause published on `rx` has elapsed.
///
/// Re-reads the deadline every time it changes, so an extension discovered by another
/// request keeps this waiter asleep until the later instant.
pub async fn wait_until_resumed(mut rx: watch::Receiver<Option<Instant>>) {
    loop {
        let resume_at = *rx.borrow_and_update();
        match resume_at {
            Some(at) if at > Instant::now() => {
                tokio::select! {
                    _ = sleep_until(at) => {}
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn shorter_proposal_never_shortens_the_pause() {
        let mut cell = PauseCell::new();
        let now = Instant::now();

        let first = cell.propose(now + Duration::from_secs(10), PauseReason::Throttled, now);
        assert!(first.extended);

        let shorter = cell.propose(now + Duration::from_secs(3), PauseReason::Unavailable, now);
        assert!(!shorter.extended);
        assert_eq!(shorter.resume_at, now + Duration::from_secs(10));
        assert_eq!(cell.state().unwrap().reason, PauseReason::Throttled);

        let longer = cell.propose(now + Duration::from_secs(12), PauseReason::Unavailable, now);
        assert!(longer.extended);
        assert_eq!(cell.remaining(now), Some(Duration::from_secs(12)));
        assert_eq!(cell.state().unwrap().reason, PauseReason::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn proposals_converge_regardless_of_order() {
        let now = Instant::now();
        let a = now + Duration::from_secs(2);
        let b = now + Duration::from_secs(5);

        let mut forward = PauseCell::new();
        forward.propose(a, PauseReason::Throttled, now);
        forward.propose(b, PauseReason::Throttled, now);

        let mut backward = PauseCell::new();
        backward.propose(b, PauseReason::Throttled, now);
        backward.propose(a, PauseReason::Throttled, now);

        assert_eq!(forward.state().unwrap().resume_at, b);
        assert_eq!(backward.state().unwrap().resume_at, b);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_pause_is_cleared() {
        let mut cell = PauseCell::new();
        let now = Instant::now();
        cell.propose(now + Duration::from_secs(1), PauseReason::Throttled, now);

        assert!(cell.clear_if_elapsed(now).is_none());
        assert!(cell.is_paused(now));

        let later = now + Duration::from_secs(1);
        assert!(cell.clear_if_elapsed(later).is_some());
        assert!(!cell.is_paused(later));
        assert!(!cell.state().unwrap().active);
        assert!(cell.clear_if_elapsed(later).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_follow_extensions() {
        let mut cell = PauseCell::new();
        let start = Instant::now();
        cell.propose(start + Duration::from_secs(2), PauseReason::Throttled, start);

        let mut waiter = task::spawn(wait_until_resumed(cell.subscribe()));
        assert_pending!(waiter.poll());

        cell.propose(start + Duration::from_secs(5), PauseReason::Throttled, start);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_pending!(waiter.poll());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn waiting_without_pause_returns_immediately() {
        let cell = PauseCell::new();
        wait_until_resumed(cell.subscribe()).await;
    }
}
