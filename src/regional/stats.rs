//! Pipeline counters and connection bookkeeping.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RegionalStats {
    messages_received: AtomicU64,
    decoded_ok: AtomicU64,
    decoded_fail: AtomicU64,
    text_messages: AtomicU64,
    connected: AtomicBool,
    last_message: Mutex<Option<DateTime<Utc>>>,
    connected_since: Mutex<Option<DateTime<Utc>>>,
}

impl RegionalStats {
    pub fn record_received(&self, at: DateTime<Utc>) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        *self.last_message.lock() = Some(at);
    }

    pub fn inc_decoded_ok(&self) {
        self.decoded_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_decoded_fail(&self) {
        self.decoded_fail.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_text_messages(&self) {
        self.text_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_connected(&self, at: DateTime<Utc>) {
        self.connected.store(true, Ordering::SeqCst);
        *self.connected_since.lock() = Some(at);
    }

    /// Returns whether we were connected before.
    pub fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Point-in-time view returned by `RegionalService::get_stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub connected: bool,
    pub broker: String,
    pub topic: String,
    pub node_count: usize,
    pub cached_messages: usize,
    pub messages_received: u64,
    pub decoded_ok: u64,
    pub decoded_fail: u64,
    pub text_messages: u64,
    pub last_message: Option<DateTime<Utc>>,
    pub connected_since: Option<DateTime<Utc>>,
}

impl RegionalStats {
    pub fn snapshot(
        &self,
        broker: String,
        topic: String,
        node_count: usize,
        cached_messages: usize,
    ) -> StatsSnapshot {
        StatsSnapshot {
            connected: self.is_connected(),
            broker,
            topic,
            node_count,
            cached_messages,
            messages_received: self.messages_received.load(Ordering::Relaxed),
            decoded_ok: self.decoded_ok.load(Ordering::Relaxed),
            decoded_fail: self.decoded_fail.load(Ordering::Relaxed),
            text_messages: self.text_messages.load(Ordering::Relaxed),
            last_message: *self.last_message.lock(),
            connected_since: *self.connected_since.lock(),
        }
    }
}
