//! Per-transport counters.
//! Each device transport owns one `TransportMetrics`; readers take a `Snapshot`.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TransportMetrics {
    frames_received: AtomicU64,
    frame_decode_failures: AtomicU64,
    node_parse_failures: AtomicU64,
    text_messages: AtomicU64,
    sends: AtomicU64,
    send_failures: AtomicU64,
    reconnect_attempts: AtomicU64,
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_frames_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_frame_decode_failures(&self) {
        self.frame_decode_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_node_parse_failures(&self) {
        self.node_parse_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_text_messages(&self) {
        self.text_messages.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_sends(&self) {
        self.sends.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_send_failures(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_reconnect_attempts(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frame_decode_failures: self.frame_decode_failures.load(Ordering::Relaxed),
            node_parse_failures: self.node_parse_failures.load(Ordering::Relaxed),
            text_messages: self.text_messages.load(Ordering::Relaxed),
            sends: self.sends.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Snapshot {
    pub frames_received: u64,
    pub frame_decode_failures: u64,
    pub node_parse_failures: u64,
    pub text_messages: u64,
    pub sends: u64,
    pub send_failures: u64,
    pub reconnect_attempts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let m = TransportMetrics::new();
        m.inc_sends();
        m.inc_sends();
        m.inc_send_failures();
        m.inc_reconnect_attempts();
        let snap = m.snapshot();
        assert_eq!(snap.sends, 2);
        assert_eq!(snap.send_failures, 1);
        assert_eq!(snap.reconnect_attempts, 1);
        assert_eq!(snap.frames_received, 0);
    }
}
