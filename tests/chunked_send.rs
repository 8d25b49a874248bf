//! Chunked send behavior of the shared `MeshInterface` default.
use async_trait::async_trait;
use groundwave::mesh::{strip_chunk_marker, InterfaceCore, MeshInterface, MeshNode};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Transport that records every frame instead of transmitting it.
struct RecordingInterface {
    core: InterfaceCore,
    sent: Mutex<Vec<(Instant, String, Option<String>, u32)>>,
    /// 1-based index of the send that fails.
    fail_at: Option<usize>,
}

impl RecordingInterface {
    fn new(fail_at: Option<usize>) -> Self {
        Self {
            core: InterfaceCore::new(),
            sent: Mutex::new(Vec::new()),
            fail_at,
        }
    }

    fn frames(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, t, _, _)| t.clone()).collect()
    }

    fn times(&self) -> Vec<Instant> {
        self.sent.lock().iter().map(|(at, _, _, _)| *at).collect()
    }
}

#[async_trait]
impl MeshInterface for RecordingInterface {
    fn core(&self) -> &InterfaceCore {
        &self.core
    }

    fn protocol(&self) -> &'static str {
        "recording"
    }

    async fn connect(&self) -> bool {
        true
    }

    async fn disconnect(&self) {}

    fn is_connected(&self) -> bool {
        true
    }

    async fn send_message(
        &self,
        text: &str,
        destination: Option<&str>,
        channel: u32,
        _want_ack: bool,
    ) -> bool {
        let mut sent = self.sent.lock();
        sent.push((
            Instant::now(),
            text.to_string(),
            destination.map(str::to_string),
            channel,
        ));
        self.fail_at != Some(sent.len())
    }

    fn get_node(&self, _node_id: &str) -> Option<MeshNode> {
        None
    }

    fn get_all_nodes(&self) -> Vec<MeshNode> {
        Vec::new()
    }
}

const DELAY: Duration = Duration::from_secs(15);

fn sample_text(len: usize) -> String {
    "the quick brown fox jumps over the lazy dog "
        .chars()
        .cycle()
        .take(len)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn short_text_is_sent_once_unmodified() {
    let iface = RecordingInterface::new(None);
    let text = sample_text(200);
    assert!(
        iface
            .send_chunked_message(&text, Some("!0a1b2c3d"), 2, 200, DELAY, false)
            .await
    );
    let sent = iface.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, text);
    assert_eq!(sent[0].2.as_deref(), Some("!0a1b2c3d"));
    assert_eq!(sent[0].3, 2);
}

#[tokio::test(start_paused = true)]
async fn long_text_is_split_with_delays_between_chunks() {
    let iface = RecordingInterface::new(None);
    let text = sample_text(450);
    let start = Instant::now();
    assert!(
        iface
            .send_chunked_message(&text, None, 0, 200, DELAY, false)
            .await
    );

    let frames = iface.frames();
    assert_eq!(frames.len(), 3);
    for (i, frame) in frames.iter().enumerate() {
        assert!(frame.starts_with(&format!("[{}/3] ", i + 1)), "frame {i}: {frame}");
        assert!(frame.chars().count() <= 200);
    }
    let rebuilt: String = frames.iter().map(|f| strip_chunk_marker(f)).collect();
    assert_eq!(rebuilt, text);

    let times = iface.times();
    assert_eq!(times[0] - start, Duration::ZERO);
    assert_eq!(times[1] - times[0], DELAY);
    assert_eq!(times[2] - times[1], DELAY);
}

#[tokio::test(start_paused = true)]
async fn failed_chunk_stops_the_rest() {
    let iface = RecordingInterface::new(Some(2));
    let text = sample_text(450);
    assert!(
        !iface
            .send_chunked_message(&text, None, 0, 200, DELAY, false)
            .await
    );
    let frames = iface.frames();
    assert_eq!(frames.len(), 2);
    assert!(frames[1].starts_with("[2/3] "));
}

#[tokio::test(start_paused = true)]
async fn chunk_size_too_small_for_a_marker_sends_nothing() {
    let iface = RecordingInterface::new(None);
    assert!(
        !iface
            .send_chunked_message(&sample_text(40), None, 0, 6, DELAY, false)
            .await
    );
    assert!(iface.frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn multibyte_text_counts_characters() {
    let iface = RecordingInterface::new(None);
    let text: String = "📡 névé ".chars().cycle().take(120).collect();
    assert!(
        iface
            .send_chunked_message(&text, None, 0, 50, Duration::from_millis(10), false)
            .await
    );
    let frames = iface.frames();
    assert!(frames.len() > 1);
    assert!(frames.iter().all(|f| f.chars().count() <= 50));
    let rebuilt: String = frames.iter().map(|f| strip_chunk_marker(f)).collect();
    assert_eq!(rebuilt, text);
}
