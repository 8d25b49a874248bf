//! Bounded in-memory view of the regional network.
//!
//! One mutex guards nodes and messages together. Writers hold it for the whole
//! per-packet update; readers copy out under it and sort outside.

use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::Mutex;
use prost::Message;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

use super::decode::DecodedPacket;
use crate::mesh::{format_node_id, normalize_node_id};
use crate::protobuf::hardware_model_name;
use crate::protobuf::meshtastic_generated as proto;
use proto::PortNum;

pub const DEFAULT_MAX_MESSAGES: usize = 100;
pub const DEFAULT_CHANNEL: &str = "LongFast";
/// Value of the `source` field on every record this table produces.
pub const SOURCE: &str = "mqtt_regional";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionalNode {
    pub node_id: String,
    pub short_name: String,
    pub long_name: String,
    pub hardware: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub battery_level: Option<u32>,
    pub last_rssi: Option<i32>,
    pub last_snr: Option<f32>,
    pub last_heard: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub source: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionalMessage {
    pub from_id: String,
    pub from_name: String,
    pub text: String,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    pub rssi: Option<i32>,
    pub snr: Option<f32>,
    pub source: &'static str,
}

impl RegionalNode {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            short_name: String::new(),
            long_name: String::new(),
            hardware: None,
            latitude: None,
            longitude: None,
            altitude: None,
            battery_level: None,
            last_rssi: None,
            last_snr: None,
            last_heard: None,
            message_count: 0,
            source: SOURCE,
        }
    }
}

/// What a packet did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Text,
    NodeInfo,
    Position,
    Telemetry,
    /// Sender bookkeeping only.
    Other(PortNum),
}

#[derive(Default)]
struct Tables {
    nodes: HashMap<String, RegionalNode>,
    messages: VecDeque<RegionalMessage>,
}

pub struct RegionalTable {
    max_messages: usize,
    inner: Mutex<Tables>,
}

impl RegionalTable {
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages: max_messages.max(1),
            inner: Mutex::new(Tables::default()),
        }
    }

    /// Fold one decoded packet into the table.
    pub fn apply(&self, packet: &DecodedPacket, now: DateTime<Utc>) -> Applied {
        let sender_id = format_node_id(packet.sender);
        let port = PortNum::try_from(packet.data.portnum).unwrap_or(PortNum::UnknownApp);

        let mut tables = self.inner.lock();
        let Tables { nodes, messages } = &mut *tables;

        let sender = nodes
            .entry(sender_id.clone())
            .or_insert_with(|| RegionalNode::new(sender_id.clone()));
        sender.last_heard = Some(now);
        sender.message_count += 1;
        if packet.rx_rssi != 0 {
            sender.last_rssi = Some(packet.rx_rssi);
        }
        if packet.rx_snr != 0.0 {
            sender.last_snr = Some(packet.rx_snr);
        }

        match port {
            PortNum::TextMessageApp => {
                let text = String::from_utf8_lossy(&packet.data.payload).into_owned();
                let from_name = sender.short_name.clone();
                messages.push_back(RegionalMessage {
                    from_id: sender_id,
                    from_name,
                    text,
                    channel: if packet.channel_id.is_empty() {
                        DEFAULT_CHANNEL.to_string()
                    } else {
                        packet.channel_id.clone()
                    },
                    timestamp: now,
                    rssi: (packet.rx_rssi != 0).then_some(packet.rx_rssi),
                    snr: (packet.rx_snr != 0.0).then_some(packet.rx_snr),
                    source: SOURCE,
                });
                while messages.len() > self.max_messages {
                    messages.pop_front();
                }
                Applied::Text
            }
            PortNum::NodeinfoApp => {
                let user = match proto::User::decode(&packet.data.payload[..]) {
                    Ok(u) => u,
                    Err(e) => {
                        debug!("Bad node-info payload from {}: {}", sender_id, e);
                        return Applied::Other(port);
                    }
                };
                // The embedded id names the node the record describes.
                let target_id = if user.id.is_empty() {
                    sender_id.clone()
                } else {
                    normalize_node_id(&user.id)
                };
                let target = nodes
                    .entry(target_id.clone())
                    .or_insert_with(|| RegionalNode::new(target_id));
                if !user.long_name.is_empty() {
                    target.long_name = user.long_name;
                }
                if !user.short_name.is_empty() {
                    target.short_name = user.short_name;
                }
                if user.hw_model != 0 {
                    target.hardware = Some(hardware_model_name(user.hw_model));
                }
                target.last_heard = Some(now);
                Applied::NodeInfo
            }
            PortNum::PositionApp => {
                let pos = match proto::Position::decode(&packet.data.payload[..]) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!("Bad position payload from {}: {}", sender_id, e);
                        return Applied::Other(port);
                    }
                };
                if let Some(lat_i) = pos.latitude_i.filter(|v| *v != 0) {
                    sender.latitude = Some(lat_i as f64 / 1e7);
                    sender.longitude = pos.longitude_i.map(|v| v as f64 / 1e7);
                }
                if let Some(alt) = pos.altitude.filter(|a| *a != 0) {
                    sender.altitude = Some(alt as f64);
                }
                Applied::Position
            }
            PortNum::TelemetryApp => {
                let telemetry = match proto::Telemetry::decode(&packet.data.payload[..]) {
                    Ok(t) => t,
                    Err(e) => {
                        debug!("Bad telemetry payload from {}: {}", sender_id, e);
                        return Applied::Other(port);
                    }
                };
                if let Some(proto::telemetry::Variant::DeviceMetrics(dm)) = telemetry.variant {
                    if let Some(level) = dm.battery_level.filter(|l| *l != 0) {
                        sender.battery_level = Some(level);
                    }
                }
                Applied::Telemetry
            }
            other => Applied::Other(other),
        }
    }

    /// All nodes, most recently heard first.
    pub fn nodes(&self) -> Vec<RegionalNode> {
        let mut nodes: Vec<RegionalNode> = self.inner.lock().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| b.last_heard.cmp(&a.last_heard));
        nodes
    }

    pub fn node(&self, node_id: &str) -> Option<RegionalNode> {
        self.inner.lock().nodes.get(node_id).cloned()
    }

    /// Up to `limit` messages, newest first.
    pub fn messages(&self, limit: usize) -> Vec<RegionalMessage> {
        let tables = self.inner.lock();
        tables.messages.iter().rev().take(limit).cloned().collect()
    }

    /// `(node_count, message_count)` read under one lock.
    pub fn counts(&self) -> (usize, usize) {
        let tables = self.inner.lock();
        (tables.nodes.len(), tables.messages.len())
    }
}
