//! Read-only view of the ledger served on `GET /__status`.

use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::time::Instant;

use super::{FairShare, allocator::share_for};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CallerStatus {
    pub connection_id: String,
    /// Requests per minute the caller may currently dispatch; zero once inactive.
    pub allowance: f64,
    pub limit: u32,
    #[serde(rename = "last_seen_seconds_ago", serialize_with = "as_secs")]
    pub last_seen_age: Duration,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub callers: Vec<CallerStatus>,
    pub paused: bool,
    #[serde(rename = "pause_resume_in_seconds", serialize_with = "as_optional_secs")]
    pub resume_in: Option<Duration>,
}

impl FairShare {
    /// Captures every known caller and the pause at `now`.
    ///
    /// Never mutates the ledger: callers past the burst window that no sweep has
    /// removed yet are left out rather than evicted.
    pub fn snapshot(&self, now: Instant) -> StatusSnapshot {
        let window = self.window();
        let ledger = self.ledger.lock();
        let registry = &ledger.registry;
        let share = share_for(window.limit_per_minute, registry.active_count(now));

        let mut callers: Vec<CallerStatus> = registry
            .iter()
            .filter(|record| !record.is_expired(now, window.burst_window))
            .map(|record| CallerStatus {
                connection_id: record.connection_id().to_string(),
                allowance: if record.is_active(now, window.active_window) {
                    share
                } else {
                    0.0
                },
                limit: window.limit_per_minute,
                last_seen_age: now.saturating_duration_since(record.last_seen()),
            })
            .collect();
        callers.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));

        let resume_in = ledger.pause.remaining(now);
        StatusSnapshot {
            callers,
            paused: resume_in.is_some(),
            resume_in,
        }
    }
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(round_millis(*duration))
}

fn as_optional_secs<S: Serializer>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match duration {
        Some(duration) => serializer.serialize_some(&round_millis(*duration)),
        None => serializer.serialize_none(),
    }
}

fn round_millis(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 1000.0).round() / 1000.0
}
