//! Regional telemetry pipeline.
//!
//! Subscribes to a public Meshtastic MQTT feed, decrypts and decodes every
//! packet, and keeps a bounded picture of the wider regional network that is
//! separate from the local radio's node registry.
//!
//! The broker connection runs on one background task. [`RegionalService::ingest`]
//! is the per-payload entry point; the task calls it for every publish and it
//! can be called directly to replay captured payloads.

pub mod crypto;
pub mod decode;
pub mod stats;
pub mod store;

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RegionalConfig;
use crate::logutil::preview;
pub use decode::{DecodedPacket, RegionalError};
pub use stats::StatsSnapshot;
pub use store::{Applied, RegionalMessage, RegionalNode, RegionalTable};

/// Connection and retention settings for the broker feed.
#[derive(Debug, Clone)]
pub struct RegionalSettings {
    pub broker: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub topic: String,
    pub region_name: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub max_messages: usize,
    /// Pause between consecutive failed reconnects.
    pub reconnect_pause: Duration,
    /// Upper bound on how long `stop` waits for the receive task.
    pub stop_timeout: Duration,
    /// Channel key, expanded to 32 bytes.
    pub key: Vec<u8>,
}

impl RegionalSettings {
    pub fn new(broker: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            topic: topic.into(),
            region_name: String::new(),
            client_id: generated_client_id(),
            keep_alive: Duration::from_secs(60),
            max_messages: store::DEFAULT_MAX_MESSAGES,
            reconnect_pause: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            key: crypto::DEFAULT_KEY.to_vec(),
        }
    }

    pub fn from_config(cfg: &RegionalConfig) -> Self {
        Self {
            port: cfg.port,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            region_name: cfg.region_name.clone(),
            client_id: if cfg.client_id.trim().is_empty() {
                generated_client_id()
            } else {
                cfg.client_id.clone()
            },
            keep_alive: Duration::from_secs(cfg.keep_alive_seconds.max(5)),
            max_messages: cfg.max_messages,
            reconnect_pause: Duration::from_secs(cfg.reconnect_pause_seconds),
            stop_timeout: Duration::from_secs(cfg.stop_timeout_seconds.max(1)),
            ..Self::new(cfg.broker.clone(), cfg.effective_topic())
        }
    }
}

fn generated_client_id() -> String {
    format!("groundwave-regional-{:06x}", rand::thread_rng().gen_range(0..0x100_0000u32))
}

/// Result of feeding one payload to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored(Applied),
    /// Envelope without any data to process.
    Empty,
    /// Decode or decryption failed; counted and discarded.
    Dropped,
}

struct Shared {
    table: RegionalTable,
    stats: stats::RegionalStats,
    running: AtomicBool,
    key: Vec<u8>,
    topic: String,
}

impl Shared {
    fn ingest(&self, payload: &[u8]) -> IngestOutcome {
        let now = Utc::now();
        self.stats.record_received(now);
        match decode::decode_envelope(payload, &self.key) {
            Ok(Some(packet)) => {
                self.stats.inc_decoded_ok();
                let applied = self.table.apply(&packet, now);
                if applied == Applied::Text {
                    self.stats.inc_text_messages();
                    debug!(
                        "Regional text from !{:08x} on {}: {}",
                        packet.sender,
                        if packet.channel_id.is_empty() {
                            store::DEFAULT_CHANNEL
                        } else {
                            packet.channel_id.as_str()
                        },
                        preview(&String::from_utf8_lossy(&packet.data.payload))
                    );
                }
                IngestOutcome::Stored(applied)
            }
            Ok(None) => IngestOutcome::Empty,
            Err(e) => {
                self.stats.inc_decoded_fail();
                debug!("Dropping regional payload ({} bytes): {}", payload.len(), e);
                IngestOutcome::Dropped
            }
        }
    }
}

struct Worker {
    client: AsyncClient,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct RegionalService {
    settings: RegionalSettings,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl RegionalService {
    pub fn new(settings: RegionalSettings) -> Self {
        let shared = Arc::new(Shared {
            table: RegionalTable::new(settings.max_messages),
            stats: stats::RegionalStats::default(),
            running: AtomicBool::new(false),
            key: settings.key.clone(),
            topic: settings.topic.clone(),
        });
        Self {
            settings,
            shared,
            worker: Mutex::new(None),
        }
    }

    pub fn from_config(cfg: &RegionalConfig) -> Self {
        Self::new(RegionalSettings::from_config(cfg))
    }

    pub fn settings(&self) -> &RegionalSettings {
        &self.settings
    }

    /// Spawn the broker task. Must be called inside a tokio runtime.
    /// Returns false if no runtime is available.
    pub fn start(&self) -> bool {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            warn!("Regional MQTT already running");
            return true;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(e) => {
                error!("Cannot start regional MQTT outside a runtime: {}", e);
                return false;
            }
        };

        let s = &self.settings;
        let mut options = MqttOptions::new(s.client_id.clone(), s.broker.clone(), s.port);
        options.set_keep_alive(s.keep_alive);
        if !s.username.is_empty() {
            options.set_credentials(s.username.clone(), s.password.clone());
        }
        let (client, eventloop) = AsyncClient::new(options, 10);

        self.shared.running.store(true, Ordering::SeqCst);
        let shutdown = CancellationToken::new();
        let handle = runtime.spawn(run_event_loop(
            self.shared.clone(),
            client.clone(),
            eventloop,
            shutdown.clone(),
            s.reconnect_pause,
        ));
        info!(
            "Regional MQTT{} starting: {}:{} topic {}",
            if s.region_name.is_empty() {
                String::new()
            } else {
                format!(" [{}]", s.region_name)
            },
            s.broker,
            s.port,
            s.topic
        );
        *worker = Some(Worker {
            client,
            shutdown,
            handle,
        });
        true
    }

    /// Unsubscribe, disconnect and wait (bounded) for the task to exit.
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        let Some(Worker {
            client,
            shutdown,
            mut handle,
        }) = worker
        else {
            return;
        };

        self.shared.running.store(false, Ordering::SeqCst);
        if self.shared.stats.is_connected() {
            let _ = client.try_unsubscribe(self.shared.topic.clone());
            if let Err(e) = client.try_disconnect() {
                debug!("Disconnect request not queued: {}", e);
                shutdown.cancel();
            }
        } else {
            shutdown.cancel();
        }

        match tokio::time::timeout(self.settings.stop_timeout, &mut handle).await {
            Ok(_) => debug!("Regional MQTT task exited"),
            Err(_) => {
                warn!(
                    "Regional MQTT task did not exit within {:?}; aborting it",
                    self.settings.stop_timeout
                );
                shutdown.cancel();
                handle.abort();
                let _ = handle.await;
            }
        }
        self.shared.stats.mark_disconnected();
        info!("Regional MQTT stopped");
    }

    /// Decode one broker payload into the tables.
    pub fn ingest(&self, payload: &[u8]) -> IngestOutcome {
        self.shared.ingest(payload)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.stats.is_connected()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Nodes, most recently heard first.
    pub fn get_nodes(&self) -> Vec<RegionalNode> {
        self.shared.table.nodes()
    }

    pub fn get_node(&self, node_id: &str) -> Option<RegionalNode> {
        self.shared.table.node(node_id)
    }

    /// Up to `limit` messages, newest first.
    pub fn get_messages(&self, limit: usize) -> Vec<RegionalMessage> {
        self.shared.table.messages(limit)
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        let (node_count, cached_messages) = self.shared.table.counts();
        self.shared.stats.snapshot(
            format!("{}:{}", self.settings.broker, self.settings.port),
            self.settings.topic.clone(),
            node_count,
            cached_messages,
        )
    }
}

async fn run_event_loop(
    shared: Arc<Shared>,
    client: AsyncClient,
    mut eventloop: EventLoop,
    shutdown: CancellationToken,
    reconnect_pause: Duration,
) {
    let mut failures: u32 = 0;
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            ev = eventloop.poll() => ev,
        };
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    failures = 0;
                    shared.stats.mark_connected(Utc::now());
                    info!("Connected to regional MQTT broker");
                    match client.try_subscribe(shared.topic.clone(), QoS::AtMostOnce) {
                        Ok(()) => info!("Subscribed to {}", shared.topic),
                        Err(e) => error!("Failed to subscribe to {}: {}", shared.topic, e),
                    }
                } else {
                    error!("Regional MQTT connection refused: {:?}", ack.code);
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                shared.ingest(&publish.payload);
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                shared.stats.mark_disconnected();
                warn!("Regional MQTT broker closed the session");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Regional MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let was_connected = shared.stats.mark_disconnected();
                if shutdown.is_cancelled() || !shared.running.load(Ordering::SeqCst) {
                    break;
                }
                if was_connected {
                    // The next poll reconnects straight away.
                    warn!("Disconnected from regional MQTT: {}; reconnecting", e);
                    continue;
                }
                failures += 1;
                error!("Regional MQTT reconnect failed (attempt {}): {}", failures, e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_pause) => {}
                }
            }
        }
    }
    shared.stats.mark_disconnected();
    debug!("Regional MQTT receive loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_without_broker_returns_promptly() {
        let mut settings = RegionalSettings::new("127.0.0.1", "msh/test/#");
        // Nothing listens on port 1, so every poll fails.
        settings.port = 1;
        settings.reconnect_pause = Duration::from_secs(30);
        settings.stop_timeout = Duration::from_secs(2);
        let service = RegionalService::new(settings);

        assert!(service.start());
        assert!(service.is_running());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        service.stop().await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!service.is_running());
        assert!(!service.is_connected());
    }

    #[test]
    fn stats_reflect_tables() {
        let service = RegionalService::new(RegionalSettings::new("broker.example", "msh/US/#"));
        assert_eq!(service.ingest(&[0xff, 0xff]), IngestOutcome::Dropped);
        let stats = service.get_stats();
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.decoded_fail, 1);
        assert_eq!(stats.broker, "broker.example:1883");
        assert_eq!(stats.topic, "msh/US/#");
        assert!(!stats.connected);
        assert!(stats.last_message.is_some());
    }
}
