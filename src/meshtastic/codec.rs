//! Outbound `ToRadio` construction and stream encoding.

use bytes::Bytes;
use prost::Message;
use rand::Rng;

use super::framer::encode_frame;
use crate::mesh::MeshError;
use crate::protobuf::meshtastic_generated as proto;
use proto::to_radio::PayloadVariant;

/// Hop limit for packets we originate.
pub const DEFAULT_HOP_LIMIT: u32 = 3;

/// Random non-zero packet id.
pub fn random_packet_id() -> u32 {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

pub fn text_packet(from: u32, to: u32, channel: u32, text: &str, want_ack: bool) -> proto::MeshPacket {
    let data = proto::Data {
        portnum: proto::PortNum::TextMessageApp as i32,
        payload: Bytes::copy_from_slice(text.as_bytes()),
        ..Default::default()
    };
    proto::MeshPacket {
        from,
        to,
        channel,
        id: random_packet_id(),
        hop_limit: DEFAULT_HOP_LIMIT,
        want_ack,
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(data)),
        ..Default::default()
    }
}

pub fn packet(p: proto::MeshPacket) -> proto::ToRadio {
    proto::ToRadio {
        payload_variant: Some(PayloadVariant::Packet(p)),
    }
}

pub fn want_config(config_id: u32) -> proto::ToRadio {
    proto::ToRadio {
        payload_variant: Some(PayloadVariant::WantConfigId(config_id)),
    }
}

pub fn heartbeat(nonce: u32) -> proto::ToRadio {
    proto::ToRadio {
        payload_variant: Some(PayloadVariant::Heartbeat(proto::Heartbeat { nonce })),
    }
}

pub fn disconnect() -> proto::ToRadio {
    proto::ToRadio {
        payload_variant: Some(PayloadVariant::Disconnect(true)),
    }
}

/// Encode `msg` and wrap it in the stream header.
pub fn to_radio_frame(msg: &proto::ToRadio) -> Result<Vec<u8>, MeshError> {
    let mut payload = Vec::with_capacity(msg.encoded_len());
    msg.encode(&mut payload)?;
    encode_frame(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshtastic::framer::StreamFramer;

    #[test]
    fn text_packet_frames_decode_back() {
        let pkt = text_packet(0x0a0b0c0d, 0x0a1b2c3d, 2, "hi there", true);
        assert_ne!(pkt.id, 0);
        let frame = to_radio_frame(&packet(pkt)).unwrap();

        let mut framer = StreamFramer::new();
        framer.push(&frame);
        let payload = framer.next_frame().unwrap();
        let decoded = proto::ToRadio::decode(payload.as_slice()).unwrap();
        let Some(PayloadVariant::Packet(p)) = decoded.payload_variant else {
            panic!("expected packet");
        };
        assert_eq!(p.to, 0x0a1b2c3d);
        assert_eq!(p.channel, 2);
        assert_eq!(p.hop_limit, DEFAULT_HOP_LIMIT);
        assert!(p.want_ack);
        let Some(proto::mesh_packet::PayloadVariant::Decoded(d)) = p.payload_variant else {
            panic!("expected decoded data");
        };
        assert_eq!(d.portnum, proto::PortNum::TextMessageApp as i32);
        assert_eq!(&d.payload[..], b"hi there");
    }

    #[test]
    fn oversized_text_is_refused() {
        let pkt = text_packet(1, 2, 0, &"x".repeat(600), false);
        assert!(matches!(
            to_radio_frame(&packet(pkt)),
            Err(MeshError::FrameTooLarge(_))
        ));
    }
}
