//! The contract every mesh transport implements, plus the state all of them share.
//!
//! Transports embed an [`InterfaceCore`] and expose it through
//! [`MeshInterface::core`]; registration, state and the node registry then come
//! for free from the trait's provided methods. Chunked sending is written once
//! here on top of `send_message`.

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

use super::observer::{Callback, Observers};
use super::types::{ConnectionState, MeshMessage, MeshNode};

/// Registry, state and observer lists shared by every transport.
pub struct InterfaceCore {
    state: RwLock<ConnectionState>,
    my_node_id: RwLock<Option<String>>,
    nodes: RwLock<HashMap<String, MeshNode>>,
    message_observers: Observers<MeshMessage>,
    node_observers: Observers<MeshNode>,
    connection_observers: Observers<ConnectionState>,
}

impl Default for InterfaceCore {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceCore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            my_node_id: RwLock::new(None),
            nodes: RwLock::new(HashMap::new()),
            message_observers: Observers::new("message"),
            node_observers: Observers::new("node-update"),
            connection_observers: Observers::new("connection"),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Record a new state and notify observers before returning.
    pub fn set_state(&self, state: ConnectionState) {
        let previous = {
            let mut guard = self.state.write();
            std::mem::replace(&mut *guard, state)
        };
        if previous != state {
            debug!("connection state {} -> {}", previous, state);
        }
        self.connection_observers.dispatch(&state);
    }

    pub fn my_node_id(&self) -> Option<String> {
        self.my_node_id.read().clone()
    }

    pub fn set_my_node_id(&self, id: Option<String>) {
        *self.my_node_id.write() = id;
    }

    pub fn node(&self, node_id: &str) -> Option<MeshNode> {
        self.nodes.read().get(node_id).cloned()
    }

    pub fn nodes_snapshot(&self) -> Vec<MeshNode> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn upsert_node(&self, node: MeshNode) {
        self.nodes.write().insert(node.node_id.clone(), node);
    }

    pub fn register_message_observer(&self, callback: Callback<MeshMessage>) {
        self.message_observers.register(callback);
    }

    pub fn register_node_observer(&self, callback: Callback<MeshNode>) {
        self.node_observers.register(callback);
    }

    pub fn register_connection_observer(&self, callback: Callback<ConnectionState>) {
        self.connection_observers.register(callback);
    }

    pub fn dispatch_message(&self, message: &MeshMessage) {
        self.message_observers.dispatch(message);
    }

    pub fn dispatch_node_update(&self, node: &MeshNode) {
        self.node_observers.dispatch(node);
    }
}

/// Split `text` into `[i/n] `-prefixed frames of at most `chunk_size` characters.
///
/// Text that already fits comes back as a single unprefixed frame. The marker
/// width depends on `n`, so the chunk count is recomputed until it is stable;
/// every frame is then sized for the widest marker. Returns `None` when
/// `chunk_size` cannot hold a marker plus at least one character.
pub fn plan_chunks(text: &str, chunk_size: usize) -> Option<Vec<String>> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= chunk_size {
        return Some(vec![text.to_string()]);
    }

    let mut count = chars.len().div_ceil(chunk_size.max(1));
    let payload = loop {
        let overhead = marker_width(count);
        if overhead >= chunk_size {
            return None;
        }
        let payload = chunk_size - overhead;
        let needed = chars.len().div_ceil(payload);
        if needed == count {
            break payload;
        }
        count = needed;
    };

    Some(
        chars
            .chunks(payload)
            .enumerate()
            .map(|(i, body)| {
                let body: String = body.iter().collect();
                format!("[{}/{}] {}", i + 1, count, body)
            })
            .collect(),
    )
}

/// Length of `"[n/n] "`.
fn marker_width(count: usize) -> usize {
    2 * count.to_string().len() + 4
}

/// Strip a leading `[i/n] ` marker, if present.
pub fn strip_chunk_marker(frame: &str) -> &str {
    if let Some(rest) = frame.strip_prefix('[') {
        if let Some(end) = rest.find("] ") {
            let marker = &rest[..end];
            let is_marker = marker
                .split_once('/')
                .map(|(a, b)| {
                    !a.is_empty()
                        && !b.is_empty()
                        && a.chars().all(|c| c.is_ascii_digit())
                        && b.chars().all(|c| c.is_ascii_digit())
                })
                .unwrap_or(false);
            if is_marker {
                return &rest[end + 2..];
            }
        }
    }
    frame
}

#[async_trait]
pub trait MeshInterface: Send + Sync {
    /// Shared registry, state and observers.
    fn core(&self) -> &InterfaceCore;

    /// Short protocol name for logs.
    fn protocol(&self) -> &'static str;

    /// Whether this transport actually works. Unsupported transports fail
    /// every operation.
    fn is_supported(&self) -> bool {
        true
    }

    /// Open the link. Moves to `Connecting` first, then `Connected` or `Error`.
    async fn connect(&self) -> bool;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Send one frame. `destination = None` broadcasts on `channel`.
    async fn send_message(
        &self,
        text: &str,
        destination: Option<&str>,
        channel: u32,
        want_ack: bool,
    ) -> bool;

    fn get_node(&self, node_id: &str) -> Option<MeshNode>;

    fn get_all_nodes(&self) -> Vec<MeshNode>;

    /// Send `text`, splitting it into marked chunks when it exceeds `chunk_size`.
    ///
    /// `delay` is awaited before every chunk after the first. The first failed
    /// chunk aborts the rest.
    async fn send_chunked_message(
        &self,
        text: &str,
        destination: Option<&str>,
        channel: u32,
        chunk_size: usize,
        delay: Duration,
        want_ack: bool,
    ) -> bool {
        let Some(frames) = plan_chunks(text, chunk_size) else {
            warn!(
                "Chunk size {} is too small to carry a chunk marker; message not sent",
                chunk_size
            );
            return false;
        };
        if frames.len() == 1 {
            return self.send_message(text, destination, channel, want_ack).await;
        }

        let total = frames.len();
        debug!(
            "Sending {} chars as {} chunks (chunk size {}, delay {:?})",
            text.chars().count(),
            total,
            chunk_size,
            delay
        );
        for (i, frame) in frames.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(delay).await;
            }
            if !self.send_message(frame, destination, channel, want_ack).await {
                warn!("Failed to send chunk {}/{}", i + 1, total);
                return false;
            }
        }
        true
    }

    fn state(&self) -> ConnectionState {
        self.core().state()
    }

    fn my_node_id(&self) -> Option<String> {
        self.core().my_node_id()
    }

    /// Copy of the registry keyed by node id.
    fn nodes(&self) -> HashMap<String, MeshNode> {
        self.get_all_nodes()
            .into_iter()
            .map(|n| (n.node_id.clone(), n))
            .collect()
    }

    fn on_message(&self, callback: Callback<MeshMessage>) {
        self.core().register_message_observer(callback);
    }

    fn on_node_update(&self, callback: Callback<MeshNode>) {
        self.core().register_node_observer(callback);
    }

    fn on_connection_change(&self, callback: Callback<ConnectionState>) {
        self.core().register_connection_observer(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_unmarked_frame() {
        let frames = plan_chunks("hello", 10).unwrap();
        assert_eq!(frames, vec!["hello".to_string()]);
        let exact = "x".repeat(10);
        assert_eq!(plan_chunks(&exact, 10).unwrap(), vec![exact.clone()]);
    }

    #[test]
    fn long_text_splits_without_loss() {
        let text: String = (0..450).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let frames = plan_chunks(&text, 200).unwrap();
        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert!(frame.chars().count() <= 200);
            assert!(frame.starts_with(&format!("[{}/3] ", i + 1)));
        }
        let joined: String = frames.iter().map(|f| strip_chunk_marker(f)).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn marker_growth_is_accounted_for() {
        // 9 chunks fit "[9/9] " but a tenth needs "[10/10] ".
        let text = "y".repeat(95);
        let frames = plan_chunks(&text, 16).unwrap();
        let n = frames.len();
        assert!(frames.iter().all(|f| f.chars().count() <= 16));
        assert!(frames[n - 1].starts_with(&format!("[{n}/{n}] ")));
        let joined: String = frames.iter().map(|f| strip_chunk_marker(f)).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn multibyte_text_is_split_on_chars() {
        let text = "ü".repeat(30);
        let frames = plan_chunks(&text, 20).unwrap();
        assert!(frames.iter().all(|f| f.chars().count() <= 20));
        let joined: String = frames.iter().map(|f| strip_chunk_marker(f)).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn tiny_chunk_size_is_rejected() {
        assert!(plan_chunks("abcdefghijk", 6).is_none());
        assert!(plan_chunks("abcdefghijk", 0).is_none());
    }

    #[test]
    fn strip_only_removes_real_markers() {
        assert_eq!(strip_chunk_marker("[2/3] body"), "body");
        assert_eq!(strip_chunk_marker("[note] body"), "[note] body");
        assert_eq!(strip_chunk_marker("plain"), "plain");
    }

    #[test]
    fn core_broadcasts_state_changes() {
        use std::sync::Arc;
        let core = InterfaceCore::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = seen.clone();
        core.register_connection_observer(Arc::new(move |st: &ConnectionState| -> anyhow::Result<()> {
            s.lock().push(*st);
            Ok(())
        }));
        core.set_state(ConnectionState::Connecting);
        core.set_state(ConnectionState::Connected);
        assert_eq!(core.state(), ConnectionState::Connected);
        assert_eq!(
            *seen.lock(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }
}
