//! One open device session: the config handshake and the reader thread.
//!
//! The handshake runs on a blocking thread while `connect` awaits it. After it
//! completes, a dedicated OS thread owns the read half of the link. It decodes
//! frames and hands them to a [`FrameSink`], writes periodic heartbeats, and
//! reports link loss exactly once per session.

use log::{debug, trace, warn};
use parking_lot::Mutex;
use prost::Message;
use rand::Rng;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::codec;
use super::framer::StreamFramer;
use super::link::{is_idle_timeout, LinkStreams};
use crate::mesh::MeshError;
use crate::protobuf::meshtastic_generated as proto;
use proto::from_radio::PayloadVariant;

pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Receiver of everything the reader thread produces.
pub trait FrameSink: Send + Sync + 'static {
    /// One complete `FromRadio` payload.
    fn on_frame(&self, frame: &[u8]);
    /// The link for session `epoch` failed.
    fn on_link_lost(&self, epoch: u64, reason: String);
}

/// What the device reported while we waited for `config_complete_id`.
#[derive(Debug, Default)]
pub struct Handshake {
    pub my_node_num: u32,
    pub nodes: Vec<proto::NodeInfo>,
    /// Mesh packets that arrived before configuration finished.
    pub packets: Vec<proto::MeshPacket>,
    /// Framer holding any bytes read past the final config frame.
    pub framer: StreamFramer,
}

/// Request the device configuration and read until it is complete.
pub fn handshake(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    timeout: Duration,
) -> Result<Handshake, MeshError> {
    let config_id = rand::thread_rng().gen_range(1..=u32::MAX);
    writer.write_all(&codec::to_radio_frame(&codec::want_config(config_id))?)?;
    writer.flush()?;
    debug!("Sent want_config_id {}", config_id);

    let deadline = Instant::now() + timeout;
    let mut result = Handshake::default();
    let mut my_node_num = None;
    let mut buf = [0u8; 1024];

    while Instant::now() < deadline {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Err(MeshError::ClosedDuringHandshake),
            Ok(n) => n,
            Err(e) if is_idle_timeout(&e) => continue,
            Err(e) => return Err(e.into()),
        };
        result.framer.push(&buf[..n]);
        while let Some(frame) = result.framer.next_frame() {
            let msg = match proto::FromRadio::decode(frame.as_slice()) {
                Ok(m) => m,
                Err(e) => {
                    debug!("Skipping undecodable frame during handshake: {}", e);
                    continue;
                }
            };
            match msg.payload_variant {
                Some(PayloadVariant::MyInfo(info)) => {
                    debug!("Device reports node number 0x{:08x}", info.my_node_num);
                    my_node_num = Some(info.my_node_num);
                }
                Some(PayloadVariant::NodeInfo(info)) => result.nodes.push(info),
                Some(PayloadVariant::Packet(pkt)) => result.packets.push(pkt),
                Some(PayloadVariant::ConfigCompleteId(id)) if id == config_id => {
                    result.my_node_num = match my_node_num {
                        Some(num) if num != 0 => num,
                        _ => return Err(MeshError::MissingNodeNumber),
                    };
                    debug!(
                        "Configuration complete: {} node records, {} early packets",
                        result.nodes.len(),
                        result.packets.len()
                    );
                    return Ok(result);
                }
                Some(PayloadVariant::ConfigCompleteId(id)) => {
                    debug!("Ignoring config_complete_id {} (waiting for {})", id, config_id);
                }
                Some(PayloadVariant::LogRecord(rec)) => {
                    trace!("Device log: {}", crate::logutil::escape_log(&rec.message));
                }
                Some(PayloadVariant::Rebooted(_)) | None => {}
            }
        }
    }
    Err(MeshError::HandshakeTimeout(timeout))
}

/// Reader thread configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    pub heartbeat_interval: Duration,
}

/// Handle to a running session. Dropping it does not stop the reader; call
/// [`Session::shutdown`].
pub struct Session {
    epoch: u64,
    writer: SharedWriter,
    stop: Arc<AtomicBool>,
    last_io: Arc<Mutex<Instant>>,
    reader: Option<JoinHandle<()>>,
}

impl Session {
    /// Spawn the reader thread over an already configured link.
    pub fn start(
        sink: Arc<dyn FrameSink>,
        link: LinkStreams,
        framer: StreamFramer,
        epoch: u64,
        timing: SessionTiming,
    ) -> Result<Self, MeshError> {
        let LinkStreams { reader, writer, .. } = link;
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        let stop = Arc::new(AtomicBool::new(false));
        let last_io = Arc::new(Mutex::new(Instant::now()));

        let worker = ReaderLoop {
            sink,
            reader,
            framer,
            writer: writer.clone(),
            stop: stop.clone(),
            last_io: last_io.clone(),
            epoch,
            timing,
        };
        let handle = std::thread::Builder::new()
            .name(format!("meshtastic-reader-{epoch}"))
            .spawn(move || worker.run())?;

        Ok(Self {
            epoch,
            writer,
            stop,
            last_io,
            reader: Some(handle),
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn writer(&self) -> SharedWriter {
        self.writer.clone()
    }

    pub fn last_io_handle(&self) -> Arc<Mutex<Instant>> {
        self.last_io.clone()
    }

    /// Reader thread running and the link used within `liveness_timeout`.
    pub fn is_alive(&self, liveness_timeout: Duration) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            return false;
        }
        let reader_running = self
            .reader
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        reader_running && self.last_io.lock().elapsed() < liveness_timeout
    }

    /// Stop the reader and optionally tell the device we are leaving.
    /// Returns the reader handle so the caller can join it from a context
    /// that is not the reader thread itself.
    pub fn shutdown(mut self, notify_device: bool) -> Option<JoinHandle<()>> {
        self.stop.store(true, Ordering::SeqCst);
        if notify_device {
            match codec::to_radio_frame(&codec::disconnect()) {
                Ok(frame) => {
                    let mut w = self.writer.lock();
                    if let Err(e) = w.write_all(&frame).and_then(|_| w.flush()) {
                        debug!("Best-effort disconnect frame failed: {}", e);
                    }
                }
                Err(e) => debug!("Could not encode disconnect frame: {}", e),
            }
        }
        self.reader.take()
    }
}

struct ReaderLoop {
    sink: Arc<dyn FrameSink>,
    reader: Box<dyn Read + Send>,
    framer: StreamFramer,
    writer: SharedWriter,
    stop: Arc<AtomicBool>,
    last_io: Arc<Mutex<Instant>>,
    epoch: u64,
    timing: SessionTiming,
}

impl ReaderLoop {
    fn run(mut self) {
        debug!("Reader thread for session {} started", self.epoch);

        // Frames that were read together with the end of the handshake.
        for frame in self.framer.drain_frames() {
            self.sink.on_frame(&frame);
        }

        let mut buf = [0u8; 1024];
        let mut next_heartbeat = Instant::now() + self.timing.heartbeat_interval;
        let failure = loop {
            if self.stop.load(Ordering::SeqCst) {
                break None;
            }

            if Instant::now() >= next_heartbeat {
                next_heartbeat = Instant::now() + self.timing.heartbeat_interval;
                if let Err(e) = self.write_heartbeat() {
                    break Some(format!("heartbeat write failed: {e}"));
                }
            }

            match self.reader.read(&mut buf) {
                Ok(0) => break Some("device closed the link".to_string()),
                Ok(n) => {
                    *self.last_io.lock() = Instant::now();
                    self.framer.push(&buf[..n]);
                    while let Some(frame) = self.framer.next_frame() {
                        if self.stop.load(Ordering::SeqCst) {
                            break;
                        }
                        self.sink.on_frame(&frame);
                    }
                }
                Err(e) if is_idle_timeout(&e) => {}
                Err(e) => break Some(format!("read failed: {e}")),
            }
        };

        match failure {
            Some(reason) if !self.stop.load(Ordering::SeqCst) => {
                warn!("Session {} link lost: {}", self.epoch, reason);
                self.stop.store(true, Ordering::SeqCst);
                self.sink.on_link_lost(self.epoch, reason);
            }
            _ => debug!("Reader thread for session {} stopped", self.epoch),
        }
    }

    fn write_heartbeat(&self) -> Result<(), MeshError> {
        let nonce = rand::thread_rng().gen::<u32>();
        let frame = codec::to_radio_frame(&codec::heartbeat(nonce))?;
        let mut w = self.writer.lock();
        w.write_all(&frame)?;
        w.flush()?;
        *self.last_io.lock() = Instant::now();
        trace!("Heartbeat sent (session {})", self.epoch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshtastic::framer::encode_frame;
    use std::io::Cursor;

    fn from_radio(v: PayloadVariant) -> Vec<u8> {
        let msg = proto::FromRadio {
            id: 0,
            payload_variant: Some(v),
        };
        encode_frame(&msg.encode_to_vec()).unwrap()
    }

    /// Write half of the fake device: records every request.
    struct Requests(Arc<Mutex<Vec<u8>>>);

    impl Write for Requests {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Read half of the fake device: answers the recorded want_config_id
    /// with whatever `script` produces for that id.
    struct Replies<F: Fn(u32) -> Vec<u8>> {
        requests: Arc<Mutex<Vec<u8>>>,
        script: F,
        replies: Option<Cursor<Vec<u8>>>,
    }

    impl<F: Fn(u32) -> Vec<u8>> Read for Replies<F> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.replies.is_none() {
                let mut framer = StreamFramer::new();
                framer.push(&self.requests.lock());
                let req = proto::ToRadio::decode(framer.next_frame().unwrap().as_slice()).unwrap();
                let Some(proto::to_radio::PayloadVariant::WantConfigId(id)) = req.payload_variant
                else {
                    panic!("expected want_config_id");
                };
                self.replies = Some(Cursor::new((self.script)(id)));
            }
            match self.replies.as_mut() {
                Some(cursor) => cursor.read(buf),
                None => Ok(0),
            }
        }
    }

    fn run<F: Fn(u32) -> Vec<u8>>(script: F) -> Result<Handshake, MeshError> {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let mut writer = Requests(requests.clone());
        let mut reader = Replies {
            requests,
            script,
            replies: None,
        };
        handshake(&mut reader, &mut writer, Duration::from_secs(2))
    }

    #[test]
    fn handshake_collects_identity_and_nodes() {
        let hs = run(|id| {
            let mut out = b"console noise\r\n".to_vec();
            out.extend(from_radio(PayloadVariant::MyInfo(proto::MyNodeInfo {
                my_node_num: 0x0a0b0c0d,
            })));
            out.extend(from_radio(PayloadVariant::NodeInfo(proto::NodeInfo {
                num: 7,
                ..Default::default()
            })));
            out.extend(from_radio(PayloadVariant::Packet(proto::MeshPacket {
                from: 7,
                ..Default::default()
            })));
            out.extend(from_radio(PayloadVariant::ConfigCompleteId(id.wrapping_add(1))));
            out.extend(from_radio(PayloadVariant::ConfigCompleteId(id)));
            out.extend(from_radio(PayloadVariant::Rebooted(false)));
            out
        })
        .unwrap();
        assert_eq!(hs.my_node_num, 0x0a0b0c0d);
        assert_eq!(hs.nodes.len(), 1);
        assert_eq!(hs.packets.len(), 1);

        // The trailing frame stays buffered for the reader thread.
        let mut framer = hs.framer;
        assert_eq!(framer.drain_frames().len(), 1);
    }

    #[test]
    fn handshake_without_node_number_fails() {
        let err = run(|id| from_radio(PayloadVariant::ConfigCompleteId(id))).unwrap_err();
        assert!(matches!(err, MeshError::MissingNodeNumber));
    }

    #[test]
    fn closed_link_during_handshake_fails() {
        let err = run(|_| Vec::new()).unwrap_err();
        assert!(matches!(err, MeshError::ClosedDuringHandshake));
    }
}
