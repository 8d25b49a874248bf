//! Test utilities & fixtures.
//! Provides an in-process fake Meshtastic radio speaking the stream API on a
//! localhost TCP socket.
#![allow(dead_code)]

use parking_lot::Mutex;
use prost::Message;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use groundwave::meshtastic::framer::{encode_frame, StreamFramer};
use groundwave::meshtastic::{DeviceSettings, LinkTarget};
use groundwave::protobuf::meshtastic_generated as proto;
use proto::from_radio::PayloadVariant as FromVariant;
use proto::to_radio::PayloadVariant as ToVariant;

pub const RADIO_NODE_NUM: u32 = 0xdeadbeef;

struct Shared {
    my_node_num: u32,
    nodes: Vec<proto::NodeInfo>,
    received: Mutex<Vec<proto::ToRadio>>,
    current: Mutex<Option<TcpStream>>,
    connections: AtomicUsize,
    stop: AtomicBool,
}

/// Fake radio. Answers want_config with its node number, its node records and
/// the matching config_complete_id, and records every `ToRadio` it receives.
pub struct FakeRadio {
    addr: SocketAddr,
    shared: Arc<Shared>,
    acceptor: Option<JoinHandle<()>>,
}

impl FakeRadio {
    pub fn start(nodes: Vec<proto::NodeInfo>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake radio");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let addr = listener.local_addr().expect("local addr");
        let shared = Arc::new(Shared {
            my_node_num: RADIO_NODE_NUM,
            nodes,
            received: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            connections: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        });
        let acceptor = {
            let shared = shared.clone();
            std::thread::spawn(move || accept_loop(listener, shared))
        };
        Self {
            addr,
            shared,
            acceptor: Some(acceptor),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Settings tuned for tests: short delays and timeouts.
    pub fn settings(&self) -> DeviceSettings {
        let mut s = DeviceSettings::new(LinkTarget::Tcp {
            host: "127.0.0.1".into(),
            port: self.port(),
        });
        s.reconnect_delay = Duration::from_millis(100);
        s.handshake_timeout = Duration::from_secs(3);
        s.io_timeout = Duration::from_millis(50);
        s
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Every `ToRadio` received so far, across connections.
    pub fn received(&self) -> Vec<proto::ToRadio> {
        self.shared.received.lock().clone()
    }

    /// Text packets received so far, as `(to, channel, text)`.
    pub fn sent_texts(&self) -> Vec<(u32, u32, String)> {
        self.received()
            .into_iter()
            .filter_map(|m| match m.payload_variant {
                Some(ToVariant::Packet(p)) => match p.payload_variant {
                    Some(proto::mesh_packet::PayloadVariant::Decoded(d))
                        if d.portnum == proto::PortNum::TextMessageApp as i32 =>
                    {
                        Some((p.to, p.channel, String::from_utf8_lossy(&d.payload).into_owned()))
                    }
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    /// Push a `FromRadio` to the connected client.
    pub fn send(&self, variant: FromVariant) {
        let frame = from_radio(variant);
        let mut current = self.shared.current.lock();
        let stream = current.as_mut().expect("no client connected");
        stream.write_all(&frame).expect("write to client");
    }

    pub fn send_packet(&self, packet: proto::MeshPacket) {
        self.send(FromVariant::Packet(packet));
    }

    /// Close the current client link from the radio side.
    pub fn drop_link(&self) {
        if let Some(stream) = self.shared.current.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Stop listening and close the current link. Later connects are refused.
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.drop_link();
        if let Some(h) = self.acceptor.take() {
            let _ = h.join();
        }
    }
}

impl Drop for FakeRadio {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while !shared.stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                shared.connections.fetch_add(1, Ordering::SeqCst);
                stream.set_nonblocking(false).expect("blocking stream");
                stream
                    .set_read_timeout(Some(Duration::from_millis(50)))
                    .expect("read timeout");
                let writer = stream.try_clone().expect("clone stream");
                *shared.current.lock() = Some(writer);
                let shared = shared.clone();
                std::thread::spawn(move || serve(stream, shared));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(_) => break,
        }
    }
}

fn serve(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut framer = StreamFramer::new();
    let mut buf = [0u8; 1024];
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            return;
        }
        let n = match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue
            }
            Err(_) => return,
        };
        framer.push(&buf[..n]);
        while let Some(frame) = framer.next_frame() {
            let Ok(msg) = proto::ToRadio::decode(frame.as_slice()) else {
                continue;
            };
            if let Some(ToVariant::WantConfigId(id)) = msg.payload_variant {
                let mut reply = from_radio(FromVariant::MyInfo(proto::MyNodeInfo {
                    my_node_num: shared.my_node_num,
                }));
                for node in &shared.nodes {
                    reply.extend(from_radio(FromVariant::NodeInfo(node.clone())));
                }
                reply.extend(from_radio(FromVariant::ConfigCompleteId(id)));
                if stream.write_all(&reply).is_err() {
                    return;
                }
            }
            shared.received.lock().push(msg);
        }
    }
}

pub fn from_radio(variant: FromVariant) -> Vec<u8> {
    let msg = proto::FromRadio {
        id: 0,
        payload_variant: Some(variant),
    };
    encode_frame(&msg.encode_to_vec()).expect("frame")
}

pub fn node_info(num: u32, long_name: &str, short_name: &str) -> proto::NodeInfo {
    proto::NodeInfo {
        num,
        user: Some(proto::User {
            id: format!("!{num:08x}"),
            long_name: long_name.into(),
            short_name: short_name.into(),
            hw_model: 43,
            ..Default::default()
        }),
        last_heard: chrono::Utc::now().timestamp() as u32,
        ..Default::default()
    }
}

pub fn text_packet(from: u32, to: u32, channel: u32, text: &str) -> proto::MeshPacket {
    proto::MeshPacket {
        from,
        to,
        channel,
        id: 4242,
        hop_limit: 3,
        hop_start: 3,
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
            portnum: proto::PortNum::TextMessageApp as i32,
            payload: bytes::Bytes::copy_from_slice(text.as_bytes()),
            ..Default::default()
        })),
        ..Default::default()
    }
}

pub fn telemetry_packet(from: u32, battery_level: u32) -> proto::MeshPacket {
    let telemetry = proto::Telemetry {
        time: 0,
        variant: Some(proto::telemetry::Variant::DeviceMetrics(proto::DeviceMetrics {
            battery_level: Some(battery_level),
            ..Default::default()
        })),
    };
    proto::MeshPacket {
        from,
        to: 0xffff_ffff,
        id: 4343,
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
            portnum: proto::PortNum::TelemetryApp as i32,
            payload: bytes::Bytes::from(telemetry.encode_to_vec()),
            ..Default::default()
        })),
        ..Default::default()
    }
}

/// A port nothing listens on.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
