//! Mapping device protobufs into the mesh event model.

use chrono::{DateTime, TimeZone, Utc};
use prost::Message;
use serde_json::json;
use thiserror::Error;

use crate::mesh::{format_node_id, is_direct, MeshMessage, MeshNode, BROADCAST_NUM};
use crate::protobuf::hardware_model_name;
use crate::protobuf::meshtastic_generated as proto;
use proto::PortNum;

#[derive(Debug, Error)]
pub enum NodeParseError {
    #[error("node record has no node number")]
    MissingNodeNumber,
    #[error("node record uses the broadcast address")]
    BroadcastAddress,
    #[error("position out of range (lat {lat}, lon {lon})")]
    InvalidPosition { lat: f64, lon: f64 },
    #[error("payload decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("{0:?} does not carry node data")]
    UnsupportedPort(PortNum),
}

/// Device node-DB record to [`MeshNode`]. `is_online` is left for the caller.
pub fn node_from_info(info: &proto::NodeInfo) -> Result<MeshNode, NodeParseError> {
    match info.num {
        0 => return Err(NodeParseError::MissingNodeNumber),
        BROADCAST_NUM => return Err(NodeParseError::BroadcastAddress),
        _ => {}
    }
    let mut node = MeshNode::new(format_node_id(info.num));
    if let Some(user) = &info.user {
        apply_user(&mut node, user);
    }
    if let Some(position) = &info.position {
        apply_position(&mut node, position)?;
    }
    if let Some(metrics) = &info.device_metrics {
        apply_device_metrics(&mut node, metrics);
    }
    node.last_heard = epoch_to_utc(info.last_heard);
    node.snr = (info.snr != 0.0).then_some(info.snr);
    node.hops_away = info.hops_away;
    node.raw_data = json!({
        "num": info.num,
        "channel": info.channel,
        "viaMqtt": info.via_mqtt,
        "lastHeard": info.last_heard,
        "user": info.user.as_ref().map(|u| json!({
            "id": u.id,
            "longName": u.long_name,
            "shortName": u.short_name,
            "hwModel": hardware_model_name(u.hw_model),
            "isLicensed": u.is_licensed,
        })),
    });
    Ok(node)
}

/// Fold a node-info, position or telemetry payload into `node`.
pub fn apply_port_payload(
    node: &mut MeshNode,
    port: PortNum,
    payload: &[u8],
) -> Result<(), NodeParseError> {
    match port {
        PortNum::NodeinfoApp => {
            let user = proto::User::decode(payload)?;
            apply_user(node, &user);
        }
        PortNum::PositionApp => {
            let position = proto::Position::decode(payload)?;
            apply_position(node, &position)?;
        }
        PortNum::TelemetryApp => {
            let telemetry = proto::Telemetry::decode(payload)?;
            if let Some(proto::telemetry::Variant::DeviceMetrics(metrics)) = &telemetry.variant {
                apply_device_metrics(node, metrics);
            }
        }
        other => return Err(NodeParseError::UnsupportedPort(other)),
    }
    Ok(())
}

/// Link metadata from a received packet: when, how strong, how far.
pub fn apply_packet_metadata(node: &mut MeshNode, pkt: &proto::MeshPacket, now: DateTime<Utc>) {
    node.last_heard = Some(now);
    if pkt.rx_snr != 0.0 {
        node.snr = Some(pkt.rx_snr);
    }
    if pkt.rx_rssi != 0 {
        node.rssi = Some(pkt.rx_rssi);
    }
    if pkt.hop_start > 0 && pkt.hop_start >= pkt.hop_limit {
        node.hops_away = Some(pkt.hop_start - pkt.hop_limit);
    }
}

/// Build a [`MeshMessage`] from a text packet. `None` if the payload is not UTF-8.
pub fn text_message(
    pkt: &proto::MeshPacket,
    data: &proto::Data,
    my_node_num: Option<u32>,
    from_node: Option<MeshNode>,
    now: DateTime<Utc>,
) -> Option<MeshMessage> {
    let text = std::str::from_utf8(&data.payload).ok()?.to_string();
    let to_id = (pkt.to != BROADCAST_NUM).then(|| format_node_id(pkt.to));
    Some(MeshMessage {
        message_id: if pkt.id == 0 { String::new() } else { pkt.id.to_string() },
        from_id: format_node_id(pkt.from),
        to_id,
        text,
        timestamp: now,
        channel: pkt.channel,
        is_direct: is_direct(pkt.to, my_node_num),
        hop_start: (pkt.hop_start != 0).then_some(pkt.hop_start),
        hop_limit: (pkt.hop_limit != 0).then_some(pkt.hop_limit),
        snr: (pkt.rx_snr != 0.0).then_some(pkt.rx_snr),
        rssi: (pkt.rx_rssi != 0).then_some(pkt.rx_rssi),
        from_node,
        raw_packet: json!({
            "id": pkt.id,
            "from": pkt.from,
            "to": pkt.to,
            "channel": pkt.channel,
            "rxTime": pkt.rx_time,
            "rxSnr": pkt.rx_snr,
            "rxRssi": pkt.rx_rssi,
            "hopStart": pkt.hop_start,
            "hopLimit": pkt.hop_limit,
            "viaMqtt": pkt.via_mqtt,
            "portnum": PortNum::TextMessageApp.as_str_name(),
        }),
    })
}

fn apply_user(node: &mut MeshNode, user: &proto::User) {
    if !user.long_name.is_empty() {
        node.long_name = user.long_name.clone();
    }
    if !user.short_name.is_empty() {
        node.short_name = user.short_name.clone();
    }
    if user.hw_model != 0 {
        node.hardware = hardware_model_name(user.hw_model);
    }
}

fn apply_position(node: &mut MeshNode, position: &proto::Position) -> Result<(), NodeParseError> {
    if let (Some(lat_i), Some(lon_i)) = (position.latitude_i, position.longitude_i) {
        // 0/0 is what devices report before the first GPS fix.
        if lat_i != 0 || lon_i != 0 {
            let lat = lat_i as f64 * 1e-7;
            let lon = lon_i as f64 * 1e-7;
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return Err(NodeParseError::InvalidPosition { lat, lon });
            }
            node.latitude = Some(lat);
            node.longitude = Some(lon);
        }
    }
    if let Some(alt) = position.altitude.filter(|a| *a != 0) {
        node.altitude = Some(alt as f64);
    }
    Ok(())
}

fn apply_device_metrics(node: &mut MeshNode, metrics: &proto::DeviceMetrics) {
    if let Some(level) = metrics.battery_level {
        node.battery_level = Some(level);
    }
}

fn epoch_to_utc(secs: u32) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    Utc.timestamp_opt(secs as i64, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn text_pkt(from: u32, to: u32, text: &str) -> (proto::MeshPacket, proto::Data) {
        let data = proto::Data {
            portnum: PortNum::TextMessageApp as i32,
            payload: Bytes::copy_from_slice(text.as_bytes()),
            ..Default::default()
        };
        let pkt = proto::MeshPacket {
            from,
            to,
            channel: 0,
            id: 42,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(data.clone())),
            ..Default::default()
        };
        (pkt, data)
    }

    #[test]
    fn broadcast_text_is_not_direct() {
        let (pkt, data) = text_pkt(0x0a1b2c3d, BROADCAST_NUM, "hello");
        let msg = text_message(&pkt, &data, Some(0x0a0b0c0d), None, Utc::now()).unwrap();
        assert_eq!(msg.from_id, "!0a1b2c3d");
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.channel, 0);
        assert!(!msg.is_direct);
        assert_eq!(msg.to_id, None);
        assert_eq!(msg.snr, None);
        assert_eq!(msg.message_id, "42");
    }

    #[test]
    fn text_to_us_is_direct() {
        let (pkt, data) = text_pkt(0x0a1b2c3d, 0x0a0b0c0d, "psst");
        let msg = text_message(&pkt, &data, Some(0x0a0b0c0d), None, Utc::now()).unwrap();
        assert!(msg.is_direct);
        assert_eq!(msg.to_id.as_deref(), Some("!0a0b0c0d"));
    }

    #[test]
    fn invalid_utf8_is_not_a_message() {
        let (mut pkt, mut data) = text_pkt(1, BROADCAST_NUM, "");
        data.payload = Bytes::from_static(&[0xff, 0xfe]);
        pkt.payload_variant = Some(proto::mesh_packet::PayloadVariant::Decoded(data.clone()));
        assert!(text_message(&pkt, &data, None, None, Utc::now()).is_none());
    }

    #[test]
    fn node_info_maps_all_sub_records() {
        let info = proto::NodeInfo {
            num: 0x0a1b2c3d,
            user: Some(proto::User {
                id: "!0a1b2c3d".into(),
                long_name: "Ridge Relay".into(),
                short_name: "RR".into(),
                hw_model: 9,
                ..Default::default()
            }),
            position: Some(proto::Position {
                latitude_i: Some(377_749_000),
                longitude_i: Some(-1_224_194_000),
                altitude: Some(52),
                time: 0,
            }),
            device_metrics: Some(proto::DeviceMetrics {
                battery_level: Some(87),
                ..Default::default()
            }),
            last_heard: 1_714_564_800,
            snr: 6.5,
            hops_away: Some(2),
            ..Default::default()
        };
        let node = node_from_info(&info).unwrap();
        assert_eq!(node.node_id, "!0a1b2c3d");
        assert_eq!(node.long_name, "Ridge Relay");
        assert_eq!(node.hardware, "RAK4631");
        assert!((node.latitude.unwrap() - 37.7749).abs() < 1e-6);
        assert!((node.longitude.unwrap() + 122.4194).abs() < 1e-6);
        assert_eq!(node.altitude, Some(52.0));
        assert_eq!(node.battery_level, Some(87));
        assert_eq!(node.snr, Some(6.5));
        assert_eq!(node.hops_away, Some(2));
        assert_eq!(node.last_heard.unwrap().timestamp(), 1_714_564_800);
    }

    #[test]
    fn bad_node_records_are_rejected() {
        let missing = proto::NodeInfo::default();
        assert!(matches!(
            node_from_info(&missing),
            Err(NodeParseError::MissingNodeNumber)
        ));
        let bad_pos = proto::NodeInfo {
            num: 5,
            position: Some(proto::Position {
                latitude_i: Some(1_900_000_000),
                longitude_i: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            node_from_info(&bad_pos),
            Err(NodeParseError::InvalidPosition { .. })
        ));
    }

    #[test]
    fn telemetry_payload_updates_battery() {
        let telemetry = proto::Telemetry {
            time: 0,
            variant: Some(proto::telemetry::Variant::DeviceMetrics(proto::DeviceMetrics {
                battery_level: Some(42),
                ..Default::default()
            })),
        };
        let mut node = MeshNode::new("!00000005");
        apply_port_payload(&mut node, PortNum::TelemetryApp, &telemetry.encode_to_vec()).unwrap();
        assert_eq!(node.battery_level, Some(42));
        assert!(apply_port_payload(&mut node, PortNum::PositionApp, &[0xff]).is_err());
    }
}
