//! Caller identity and per-caller bookkeeping.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    time::Duration,
};

use http::{HeaderMap, header::USER_AGENT};
use tokio::time::Instant;

use super::ACCOUNTING_WINDOW;

/// Request header that overrides the derived caller identity.
pub const CONNECTION_ID_HEADER: &str = "x-connection-id";

/// Derives the stable caller key for a request.
///
/// An explicit, non-empty `x-connection-id` is used verbatim. Otherwise the key is
/// `remote_ip|user_agent`; the port is left out because it changes with every new TCP
/// connection of the same logical caller.
pub fn derive_identity(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> String {
    if let Some(explicit) = headers
        .get(CONNECTION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    {
        return explicit.to_string();
    }

    let ip = remote_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "na".to_string());
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("na");
    format!("{ip}|{user_agent}")
}

/// Bookkeeping for one caller.
///
/// Admissions are kept as a log of dispatch instants over the last
/// [`ACCOUNTING_WINDOW`]; `window_start` and `requests_in_window` are views of that log.
#[derive(Clone, Debug)]
pub struct CallerRecord {
    connection_id: String,
    last_seen: Instant,
    admissions: VecDeque<Instant>,
}

impl CallerRecord {
    fn new(connection_id: &str, now: Instant) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            last_seen: now,
            admissions: VecDeque::new(),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Oldest admission still inside the rolling window.
    pub fn window_start(&self) -> Option<Instant> {
        self.admissions.front().copied()
    }

    pub fn requests_in_window(&self) -> usize {
        self.admissions.len()
    }

    pub fn is_active(&self, now: Instant, active_window: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) <= active_window
    }

    pub fn is_expired(&self, now: Instant, burst_window: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > burst_window
    }

    pub(crate) fn admissions(&self) -> &VecDeque<Instant> {
        &self.admissions
    }

    pub(crate) fn record_admission(&mut self, at: Instant) {
        self.admissions.push_back(at);
    }

    /// Removes one admission recorded at `at`. Returns whether one was found.
    pub(crate) fn forget_admission(&mut self, at: Instant) -> bool {
        match self.admissions.iter().rposition(|recorded| *recorded == at) {
            Some(index) => {
                self.admissions.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn prune(&mut self, now: Instant) {
        prune_window(&mut self.admissions, now);
    }
}

/// Drops the instants that fell out of the accounting window ending at `now`.
pub(crate) fn prune_window(log: &mut VecDeque<Instant>, now: Instant) {
    while let Some(oldest) = log.front() {
        if now.saturating_duration_since(*oldest) >= ACCOUNTING_WINDOW {
            log.pop_front();
        } else {
            break;
        }
    }
}

/// Maps caller identity to its [`CallerRecord`].
///
/// Callers seen within `active_window` count toward the fair-share divisor; callers
/// silent for longer than `burst_window` are evicted on the next sweep.
#[derive(Debug)]
pub struct Registry {
    callers: HashMap<String, CallerRecord>,
    active_window: Duration,
    burst_window: Duration,
}

impl Registry {
    pub fn new(active_window: Duration, burst_window: Duration) -> Self {
        Self {
            callers: HashMap::new(),
            active_window,
            burst_window,
        }
    }

    /// Creates the record for an unseen caller or marks an existing one as seen at `now`.
    pub fn upsert(&mut self, connection_id: &str, now: Instant) -> &mut CallerRecord {
        let record = self
            .callers
            .entry(connection_id.to_string())
            .or_insert_with(|| {
                debug!(connection_id, "New caller registered");
                CallerRecord::new(connection_id, now)
            });
        record.last_seen = record.last_seen.max(now);
        record.prune(now);
        record
    }

    pub fn active_count(&self, now: Instant) -> usize {
        self.callers
            .values()
            .filter(|record| record.is_active(now, self.active_window))
            .count()
    }

    /// Removes every caller silent for longer than the burst window and returns their ids.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let burst_window = self.burst_window;
        let expired: Vec<String> = self
            .callers
            .values()
            .filter(|record| record.is_expired(now, burst_window))
            .map(|record| record.connection_id.clone())
            .collect();
        for connection_id in &expired {
            self.callers.remove(connection_id);
        }
        expired
    }

    pub fn get(&self, connection_id: &str) -> Option<&CallerRecord> {
        self.callers.get(connection_id)
    }

    pub(crate) fn get_mut(&mut self, connection_id: &str) -> Option<&mut CallerRecord> {
        self.callers.get_mut(connection_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallerRecord> {
        self.callers.values()
    }

    pub fn len(&self) -> usize {
        self.callers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callers.is_empty()
    }

    pub fn active_window(&self) -> Duration {
        self.active_window
    }

    pub fn burst_window(&self) -> Duration {
        self.burst_window
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn registry() -> Registry {
        Registry::new(Duration::from_secs(5), Duration::from_secs(30))
    }

    #[test]
    fn explicit_identity_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION_ID_HEADER, HeaderValue::from_static("batch-7"));
        headers.insert(USER_AGENT, HeaderValue::from_static("curl/8"));

        let addr: SocketAddr = "10.0.0.1:4321".parse().unwrap();
        assert_eq!(derive_identity(&headers, Some(addr)), "batch-7");
    }

    #[test]
    fn identity_falls_back_to_address_and_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION_ID_HEADER, HeaderValue::from_static(""));
        headers.insert(USER_AGENT, HeaderValue::from_static("curl/8"));

        let first: SocketAddr = "10.0.0.1:4321".parse().unwrap();
        let second: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        assert_eq!(derive_identity(&headers, Some(first)), "10.0.0.1|curl/8");
        assert_eq!(
            derive_identity(&headers, Some(first)),
            derive_identity(&headers, Some(second))
        );
        assert_eq!(derive_identity(&HeaderMap::new(), None), "na|na");
    }

    #[tokio::test(start_paused = true)]
    async fn active_count_follows_the_active_window() {
        let mut registry = registry();
        let start = Instant::now();
        registry.upsert("a", start);
        registry.upsert("b", start + Duration::from_secs(3));

        assert_eq!(registry.active_count(start + Duration::from_secs(3)), 2);
        assert_eq!(registry.active_count(start + Duration::from_secs(5)), 2);
        assert_eq!(registry.active_count(start + Duration::from_secs(6)), 1);
        assert_eq!(registry.active_count(start + Duration::from_secs(9)), 0);
        // Inactive callers stay registered until the burst window passes.
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_after_burst_window() {
        let mut registry = registry();
        let start = Instant::now();
        registry.upsert("a", start);
        registry.upsert("b", start + Duration::from_secs(20));

        assert!(registry.sweep(start + Duration::from_secs(30)).is_empty());
        let evicted = registry.sweep(start + Duration::from_secs(31));
        assert_eq!(evicted, vec!["a".to_string()]);
        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn admissions_roll_out_of_the_window() {
        let mut registry = registry();
        let start = Instant::now();
        let record = registry.upsert("a", start);
        record.record_admission(start);
        record.record_admission(start + Duration::from_secs(10));
        assert_eq!(record.requests_in_window(), 2);
        assert_eq!(record.window_start(), Some(start));

        let record = registry.upsert("a", start + ACCOUNTING_WINDOW);
        assert_eq!(record.requests_in_window(), 1);
        assert_eq!(record.window_start(), Some(start + Duration::from_secs(10)));

        assert!(record.forget_admission(start + Duration::from_secs(10)));
        assert!(!record.forget_admission(start));
        assert_eq!(record.requests_in_window(), 0);
    }
}
