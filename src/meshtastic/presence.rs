//! Per-node last-heard tracking.
//!
//! Updated for every packet attributed to a node, not only text, so a node
//! that only beacons telemetry still counts as online.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Two hours, matching the device's own notion of a recently heard node.
pub const DEFAULT_ONLINE_WINDOW: Duration = Duration::from_secs(7200);

#[derive(Debug, Clone)]
pub struct PresenceTracker {
    window: chrono::Duration,
    last_heard: HashMap<String, DateTime<Utc>>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_ONLINE_WINDOW)
    }
}

impl PresenceTracker {
    pub fn new(window: Duration) -> Self {
        let window = chrono::Duration::from_std(window)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_ONLINE_WINDOW.as_secs() as i64));
        Self {
            window,
            last_heard: HashMap::new(),
        }
    }

    /// Record a sighting. Older samples never move a node's timestamp backwards.
    pub fn observe(&mut self, node_id: &str, at: DateTime<Utc>) {
        self.last_heard
            .entry(node_id.to_string())
            .and_modify(|t| {
                if at > *t {
                    *t = at;
                }
            })
            .or_insert(at);
    }

    pub fn last_heard(&self, node_id: &str) -> Option<DateTime<Utc>> {
        self.last_heard.get(node_id).copied()
    }

    pub fn is_online_at(&self, node_id: &str, now: DateTime<Utc>) -> bool {
        match self.last_heard.get(node_id) {
            Some(t) => now.signed_duration_since(*t) < self.window,
            None => false,
        }
    }

    pub fn is_online(&self, node_id: &str) -> bool {
        self.is_online_at(node_id, Utc::now())
    }

    pub fn len(&self) -> usize {
        self.last_heard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_heard.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn online_flips_when_window_elapses() {
        let mut tracker = PresenceTracker::default();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        tracker.observe("!0a1b2c3d", t0);

        assert!(tracker.is_online_at("!0a1b2c3d", t0 + chrono::Duration::seconds(7199)));
        assert!(!tracker.is_online_at("!0a1b2c3d", t0 + chrono::Duration::seconds(7200)));
        assert_eq!(tracker.last_heard("!0a1b2c3d"), Some(t0));
        assert!(!tracker.is_online_at("!ffff0000", t0));
    }

    #[test]
    fn older_samples_do_not_regress() {
        let mut tracker = PresenceTracker::new(Duration::from_secs(60));
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        tracker.observe("!1", t0);
        tracker.observe("!1", t0 - chrono::Duration::seconds(600));
        assert_eq!(tracker.last_heard("!1"), Some(t0));
        assert_eq!(tracker.len(), 1);
    }
}
