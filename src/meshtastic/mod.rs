//! Meshtastic device transport.
//!
//! Talks the stream API (`0x94 0xC3` framed `FromRadio`/`ToRadio` protobufs)
//! over a serial or TCP link and implements [`MeshInterface`] on top of it.
//!
//! Lifecycle:
//! - `connect` opens the link and runs the want-config handshake on a blocking
//!   thread, bulk-loads the device node DB, then starts a reader thread.
//! - The reader thread dispatches inbound packets, keeps per-node presence,
//!   writes heartbeats, and reports link loss.
//! - Link loss closes the session, moves to `Disconnected` and starts one
//!   supervised reconnection task (bounded attempts, fixed delay, cancellable).
//! - `disconnect` cancels reconnection, stops and joins the reader.

pub mod codec;
pub mod framer;
pub mod link;
pub mod parse;
pub mod presence;
pub mod session;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use prost::Message;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectionKind, MeshConfig};
use crate::logutil::{escape_log, preview};
use crate::mesh::{
    format_node_id, parse_node_num, ConnectionState, InterfaceCore, MeshError, MeshInterface,
    MeshNode, BROADCAST_NUM,
};
use crate::metrics::{Snapshot, TransportMetrics};
use crate::protobuf::meshtastic_generated as proto;
use proto::from_radio::PayloadVariant as FromRadioVariant;
use proto::mesh_packet::PayloadVariant as PacketVariant;
use proto::PortNum;

pub use link::LinkTarget;
pub use presence::{PresenceTracker, DEFAULT_ONLINE_WINDOW};
use session::{FrameSink, Handshake, Session, SessionTiming};

/// Tunables for one device transport.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub target: LinkTarget,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub online_window: Duration,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// `is_connected` turns false when the link has been silent this long.
    pub liveness_timeout: Duration,
    /// Read timeout on the link; bounds how long a stop request takes to be seen.
    pub io_timeout: Duration,
}

impl DeviceSettings {
    pub fn new(target: LinkTarget) -> Self {
        Self {
            target,
            max_reconnect_attempts: 20,
            reconnect_delay: Duration::from_secs(15),
            online_window: DEFAULT_ONLINE_WINDOW,
            handshake_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(90),
            io_timeout: Duration::from_millis(500),
        }
    }

    pub fn from_config(cfg: &MeshConfig) -> Self {
        let target = match cfg.connection_type {
            ConnectionKind::Serial => LinkTarget::Serial {
                path: cfg.serial_port.clone(),
                baud_rate: cfg.baud_rate,
            },
            ConnectionKind::Tcp => LinkTarget::Tcp {
                host: cfg.tcp_host.clone(),
                port: cfg.tcp_port,
            },
        };
        Self {
            max_reconnect_attempts: cfg.reconnect_max_attempts,
            reconnect_delay: cfg.reconnect_delay(),
            online_window: Duration::from_secs(cfg.online_window_seconds),
            handshake_timeout: Duration::from_secs(cfg.handshake_timeout_seconds),
            heartbeat_interval: Duration::from_secs(cfg.heartbeat_interval_seconds),
            liveness_timeout: Duration::from_secs(cfg.liveness_timeout_seconds),
            ..Self::new(target)
        }
    }
}

struct ReconnectTask {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

struct Device {
    this: Weak<Device>,
    core: InterfaceCore,
    settings: DeviceSettings,
    presence: Mutex<PresenceTracker>,
    session: Mutex<Option<Session>>,
    running: AtomicBool,
    reconnecting: AtomicBool,
    reconnect_task: Mutex<Option<ReconnectTask>>,
    runtime: Mutex<Option<Handle>>,
    epoch: AtomicU64,
    /// 0 until the device has told us who it is.
    my_node_num: AtomicU32,
    metrics: TransportMetrics,
}

/// Meshtastic implementation of [`MeshInterface`]. Cheap to clone; clones share
/// one device session.
#[derive(Clone)]
pub struct MeshtasticInterface {
    device: Arc<Device>,
}

impl MeshtasticInterface {
    pub fn new(settings: DeviceSettings) -> Self {
        let device = Arc::new_cyclic(|this| Device {
            this: this.clone(),
            core: InterfaceCore::new(),
            presence: Mutex::new(PresenceTracker::new(settings.online_window)),
            settings,
            session: Mutex::new(None),
            running: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            reconnect_task: Mutex::new(None),
            runtime: Mutex::new(None),
            epoch: AtomicU64::new(0),
            my_node_num: AtomicU32::new(0),
            metrics: TransportMetrics::new(),
        });
        Self { device }
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.device.settings
    }

    pub fn metrics(&self) -> Snapshot {
        self.device.metrics.snapshot()
    }

    /// Start the reconnection task unless one is already running.
    /// Returns true only for the call that actually started it.
    pub fn start_reconnect(&self) -> bool {
        self.device.start_reconnect()
    }

    /// Cancel a running reconnection task and wait for it to exit.
    pub async fn cancel_reconnect(&self) {
        self.device.cancel_reconnect().await;
    }

    pub fn is_reconnecting(&self) -> bool {
        self.device.reconnecting.load(Ordering::SeqCst)
    }

    pub fn is_online(&self, node_id: &str) -> bool {
        self.device.presence.lock().is_online(node_id)
    }

    pub fn last_heard(&self, node_id: &str) -> Option<DateTime<Utc>> {
        self.device.presence.lock().last_heard(node_id)
    }
}

#[async_trait]
impl MeshInterface for MeshtasticInterface {
    fn core(&self) -> &InterfaceCore {
        &self.device.core
    }

    fn protocol(&self) -> &'static str {
        "meshtastic"
    }

    async fn connect(&self) -> bool {
        let device = &self.device;
        device.remember_runtime();
        device.core.set_state(ConnectionState::Connecting);
        match device.establish().await {
            Ok(epoch) if device.epoch_active(epoch) => {
                device.core.set_state(ConnectionState::Connected);
                true
            }
            Ok(_) => {
                warn!("Link dropped while connecting; reconnection is in progress");
                false
            }
            Err(e) => {
                error!("Failed to connect to Meshtastic device: {}", e);
                device.core.set_state(ConnectionState::Error);
                false
            }
        }
    }

    async fn disconnect(&self) {
        let device = &self.device;
        device.running.store(false, Ordering::SeqCst);
        device.cancel_reconnect().await;

        let session = device.session.lock().take();
        if let Some(session) = session {
            let epoch = session.epoch();
            if let Some(reader) = session.shutdown(true) {
                match tokio::task::spawn_blocking(move || reader.join()).await {
                    Ok(Ok(())) => debug!("Reader thread for session {} joined", epoch),
                    Ok(Err(_)) => warn!("Reader thread for session {} panicked", epoch),
                    Err(e) => warn!("Could not join reader thread: {}", e),
                }
            }
        }
        device.core.set_state(ConnectionState::Disconnected);
        info!("Meshtastic disconnected");
    }

    fn is_connected(&self) -> bool {
        let device = &self.device;
        if !device.running.load(Ordering::SeqCst) {
            return false;
        }
        device
            .session
            .lock()
            .as_ref()
            .map(|s| s.is_alive(device.settings.liveness_timeout))
            .unwrap_or(false)
    }

    async fn send_message(
        &self,
        text: &str,
        destination: Option<&str>,
        channel: u32,
        want_ack: bool,
    ) -> bool {
        let device = &self.device;
        if !self.is_connected() {
            error!("Cannot send message: not connected");
            device.metrics.inc_send_failures();
            return false;
        }

        let to = match destination {
            None => BROADCAST_NUM,
            Some(dest) => match parse_node_num(dest) {
                Some(num) => num,
                None => {
                    error!("Invalid destination id '{}'", escape_log(dest));
                    device.metrics.inc_send_failures();
                    return false;
                }
            },
        };

        // `from` stays 0; the device stamps its own number on outgoing packets.
        let packet = codec::text_packet(0, to, channel, text, want_ack);
        let frame = match codec::to_radio_frame(&codec::packet(packet)) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode message: {}", e);
                device.metrics.inc_send_failures();
                return false;
            }
        };

        let (writer, last_io) = match device.session.lock().as_ref() {
            Some(s) => (s.writer(), s.last_io_handle()),
            None => {
                error!("Cannot send message: session closed");
                device.metrics.inc_send_failures();
                return false;
            }
        };

        let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut w = writer.lock();
            w.write_all(&frame)?;
            w.flush()?;
            *last_io.lock() = Instant::now();
            Ok(())
        })
        .await;

        match written {
            Ok(Ok(())) => {
                device.metrics.inc_sends();
                match destination {
                    Some(dest) if to != BROADCAST_NUM => {
                        info!("Sent DM to {}: {}", dest, preview(text))
                    }
                    _ => info!("Broadcast on channel {}: {}", channel, preview(text)),
                }
                true
            }
            Ok(Err(e)) => {
                error!("Failed to send message: {}", e);
                device.metrics.inc_send_failures();
                false
            }
            Err(e) => {
                error!("Send task failed: {}", e);
                device.metrics.inc_send_failures();
                false
            }
        }
    }

    fn get_node(&self, node_id: &str) -> Option<MeshNode> {
        let node = self.device.core.node(node_id)?;
        Some(self.device.with_presence(node, Utc::now()))
    }

    fn get_all_nodes(&self) -> Vec<MeshNode> {
        let now = Utc::now();
        self.device
            .core
            .nodes_snapshot()
            .into_iter()
            .map(|n| self.device.with_presence(n, now))
            .collect()
    }
}

impl Device {
    fn remember_runtime(&self) {
        if let Ok(handle) = Handle::try_current() {
            *self.runtime.lock() = Some(handle);
        }
    }

    fn my_node_num(&self) -> Option<u32> {
        match self.my_node_num.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    fn epoch_active(&self, epoch: u64) -> bool {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.epoch() == epoch)
            .unwrap_or(false)
    }

    /// Fill in presence-derived fields.
    fn with_presence(&self, mut node: MeshNode, now: DateTime<Utc>) -> MeshNode {
        let presence = self.presence.lock();
        if let Some(heard) = presence.last_heard(&node.node_id) {
            if node.last_heard.map_or(true, |t| heard > t) {
                node.last_heard = Some(heard);
            }
        }
        node.is_online = presence.is_online_at(&node.node_id, now);
        node
    }

    /// Open the link, run the handshake and start a reader thread.
    /// Returns the new session epoch.
    async fn establish(&self) -> Result<u64, MeshError> {
        let target = self.settings.target.clone();
        let io_timeout = self.settings.io_timeout;
        let handshake_timeout = self.settings.handshake_timeout;
        info!("Connecting to Meshtastic device at {}", target.describe());

        let (link, handshake) = tokio::task::spawn_blocking(move || {
            let mut link = target.open(io_timeout)?;
            let hs = session::handshake(&mut *link.reader, &mut *link.writer, handshake_timeout)?;
            Ok::<_, MeshError>((link, hs))
        })
        .await
        .map_err(|e| MeshError::Task(e.to_string()))??;

        let Handshake {
            my_node_num,
            nodes,
            packets,
            framer,
        } = handshake;

        let stale = self.session.lock().take();
        if let Some(old) = stale {
            debug!("Replacing stale session {}", old.epoch());
            let _ = old.shutdown(false);
        }

        self.my_node_num.store(my_node_num, Ordering::SeqCst);
        let my_id = format_node_id(my_node_num);
        self.core.set_my_node_id(Some(my_id.clone()));
        self.load_nodes(&nodes);
        for pkt in &packets {
            self.handle_packet(pkt);
        }

        let sink: Arc<dyn FrameSink> = self
            .this
            .upgrade()
            .ok_or_else(|| MeshError::Task("transport dropped during connect".into()))?;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let description = link.description.clone();
        {
            let mut guard = self.session.lock();
            let session = Session::start(
                sink,
                link,
                framer,
                epoch,
                SessionTiming {
                    heartbeat_interval: self.settings.heartbeat_interval,
                },
            )?;
            *guard = Some(session);
        }
        self.running.store(true, Ordering::SeqCst);
        info!("Connected to {} as node {}", description, my_id);
        Ok(epoch)
    }

    fn load_nodes(&self, records: &[proto::NodeInfo]) {
        let mut loaded = 0;
        for info in records {
            match parse::node_from_info(info) {
                Ok(node) => {
                    if let Some(heard) = node.last_heard {
                        self.presence.lock().observe(&node.node_id, heard);
                    }
                    self.core.upsert_node(node);
                    loaded += 1;
                }
                Err(e) => {
                    self.metrics.inc_node_parse_failures();
                    warn!("Skipping node record 0x{:08x}: {}", info.num, e);
                }
            }
        }
        info!("Loaded {} nodes from device", loaded);
    }

    fn handle_node_info(&self, info: &proto::NodeInfo) {
        match parse::node_from_info(info) {
            Ok(mut node) => {
                let existing = self.core.node(&node.node_id);
                if let Some(prev) = existing {
                    node.rssi = node.rssi.or(prev.rssi);
                }
                if let Some(heard) = node.last_heard {
                    self.presence.lock().observe(&node.node_id, heard);
                }
                self.core.upsert_node(node.clone());
                let node = self.with_presence(node, Utc::now());
                debug!("Node DB update for {}", node.node_id);
                self.core.dispatch_node_update(&node);
            }
            Err(e) => {
                self.metrics.inc_node_parse_failures();
                warn!("Failed to parse node update 0x{:08x}: {}", info.num, e);
            }
        }
    }

    fn handle_packet(&self, pkt: &proto::MeshPacket) {
        let now = Utc::now();
        let from_id = format_node_id(pkt.from);
        if pkt.from != 0 && pkt.from != BROADCAST_NUM {
            self.presence.lock().observe(&from_id, now);
        }

        let Some(PacketVariant::Decoded(data)) = &pkt.payload_variant else {
            trace!("Ignoring undecoded packet from {}", from_id);
            return;
        };
        let port = PortNum::try_from(data.portnum).unwrap_or(PortNum::UnknownApp);

        match port {
            PortNum::TextMessageApp => {
                let from_node = self
                    .core
                    .node(&from_id)
                    .map(|n| self.with_presence(n, now));
                let Some(message) =
                    parse::text_message(pkt, data, self.my_node_num(), from_node, now)
                else {
                    debug!("Dropping non-UTF-8 text payload from {}", from_id);
                    return;
                };
                self.metrics.inc_text_messages();
                info!(
                    "Received {} from {}: {}",
                    if message.is_direct { "DM" } else { "broadcast" },
                    message.from_id,
                    preview(&message.text)
                );
                self.core.dispatch_message(&message);
            }
            PortNum::NodeinfoApp | PortNum::PositionApp | PortNum::TelemetryApp => {
                let mut node = self
                    .core
                    .node(&from_id)
                    .unwrap_or_else(|| MeshNode::new(from_id.clone()));
                if let Err(e) = parse::apply_port_payload(&mut node, port, &data.payload) {
                    self.metrics.inc_node_parse_failures();
                    warn!("Failed to parse {:?} from {}: {}", port, from_id, e);
                    return;
                }
                parse::apply_packet_metadata(&mut node, pkt, now);
                self.core.upsert_node(node.clone());
                let node = self.with_presence(node, now);
                self.core.dispatch_node_update(&node);
            }
            other => trace!("Ignoring {:?} packet from {}", other, from_id),
        }
    }

    fn start_reconnect(&self) -> bool {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnection already in progress");
            return false;
        }

        let runtime = Handle::try_current()
            .ok()
            .or_else(|| self.runtime.lock().clone());
        let (Some(runtime), Some(device)) = (runtime, self.this.upgrade()) else {
            error!("No async runtime available for reconnection");
            self.reconnecting.store(false, Ordering::SeqCst);
            self.core.set_state(ConnectionState::Error);
            return false;
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = runtime.spawn(async move { device.reconnect_loop(token).await });
        let previous = self
            .reconnect_task
            .lock()
            .replace(ReconnectTask { cancel, handle });
        if let Some(prev) = previous {
            // Finished task from an earlier outage.
            prev.cancel.cancel();
        }
        true
    }

    async fn cancel_reconnect(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
        let task = self.reconnect_task.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    warn!("Reconnection task failed: {}", e);
                }
            }
        }
    }

    async fn reconnect_loop(self: Arc<Self>, cancel: CancellationToken) {
        let max = self.settings.max_reconnect_attempts;
        let delay = self.settings.reconnect_delay;
        let mut attempts = 0;

        while attempts < max && self.reconnecting.load(Ordering::SeqCst) && !cancel.is_cancelled() {
            attempts += 1;
            self.metrics.inc_reconnect_attempts();
            info!(
                "Reconnect attempt {}/{} in {:.1}s",
                attempts,
                max,
                delay.as_secs_f64()
            );
            self.core.set_state(ConnectionState::Connecting);

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reconnection cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            if !self.reconnecting.load(Ordering::SeqCst) {
                info!("Reconnection cancelled");
                return;
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reconnection cancelled");
                    return;
                }
                r = self.establish() => r,
            };
            match outcome {
                Ok(epoch) => {
                    self.reconnecting.store(false, Ordering::SeqCst);
                    if self.epoch_active(epoch) {
                        self.core.set_state(ConnectionState::Connected);
                        info!("Reconnected after {} attempt(s)", attempts);
                    } else {
                        // Lost again before we could report success; the
                        // link-loss path found us still marked as reconnecting.
                        warn!("Link dropped right after reconnecting");
                        self.core.set_state(ConnectionState::Disconnected);
                        self.start_reconnect();
                    }
                    return;
                }
                Err(e) => error!("Reconnect attempt {}/{} failed: {}", attempts, max, e),
            }
        }

        if cancel.is_cancelled() || !self.reconnecting.load(Ordering::SeqCst) {
            return;
        }
        self.reconnecting.store(false, Ordering::SeqCst);
        self.core.set_state(ConnectionState::Error);
        error!("Failed to reconnect after {} attempts", max);
    }
}

impl FrameSink for Device {
    fn on_frame(&self, frame: &[u8]) {
        self.metrics.inc_frames_received();
        let msg = match proto::FromRadio::decode(frame) {
            Ok(m) => m,
            Err(e) => {
                self.metrics.inc_frame_decode_failures();
                debug!("Dropping undecodable frame ({} bytes): {}", frame.len(), e);
                return;
            }
        };
        match msg.payload_variant {
            Some(FromRadioVariant::Packet(pkt)) => self.handle_packet(&pkt),
            Some(FromRadioVariant::NodeInfo(info)) => self.handle_node_info(&info),
            Some(FromRadioVariant::MyInfo(info)) if info.my_node_num != 0 => {
                let previous = self.my_node_num.swap(info.my_node_num, Ordering::SeqCst);
                if previous != info.my_node_num {
                    info!("Local node is now {}", format_node_id(info.my_node_num));
                    self.core
                        .set_my_node_id(Some(format_node_id(info.my_node_num)));
                }
            }
            Some(FromRadioVariant::LogRecord(rec)) => {
                debug!("Device log: {}", escape_log(&rec.message))
            }
            Some(FromRadioVariant::Rebooted(_)) => warn!("Device reported a reboot"),
            Some(other) => trace!("Ignoring FromRadio variant {:?}", other),
            None => {}
        }
    }

    fn on_link_lost(&self, epoch: u64, reason: String) {
        let session = {
            let mut guard = self.session.lock();
            if guard.as_ref().map(|s| s.epoch() == epoch).unwrap_or(false) {
                guard.take()
            } else {
                None
            }
        };
        let Some(session) = session else {
            debug!("Ignoring link loss from stale session {}", epoch);
            return;
        };
        // Called on the reader thread itself, so the handle is not joined.
        let _ = session.shutdown(false);
        self.running.store(false, Ordering::SeqCst);
        warn!(
            "Meshtastic connection lost ({}), will attempt to reconnect",
            reason
        );
        self.core.set_state(ConnectionState::Disconnected);
        self.start_reconnect();
    }
}
