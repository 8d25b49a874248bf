//! Broker envelope decoding.

use prost::Message;
use thiserror::Error;

use super::crypto::{decrypt_packet, CryptoError};
use crate::protobuf::meshtastic_generated as proto;
use proto::mesh_packet::PayloadVariant;

#[derive(Debug, Error)]
pub enum RegionalError {
    #[error("malformed service envelope: {0}")]
    Envelope(prost::DecodeError),
    #[error("envelope carries no packet")]
    MissingPacket,
    #[error("decryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("decrypted payload is not packet data: {0}")]
    Payload(prost::DecodeError),
}

/// One packet off the broker, with its data section in clear.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub sender: u32,
    pub packet_id: u32,
    pub channel_id: String,
    pub gateway_id: String,
    pub rx_rssi: i32,
    pub rx_snr: f32,
    pub was_encrypted: bool,
    pub data: proto::Data,
}

/// Decode an envelope and, when needed, decrypt its packet with `key`.
///
/// `Ok(None)` means the packet carried neither decoded nor encrypted data and
/// there is nothing to process.
pub fn decode_envelope(payload: &[u8], key: &[u8]) -> Result<Option<DecodedPacket>, RegionalError> {
    let envelope = proto::ServiceEnvelope::decode(payload).map_err(RegionalError::Envelope)?;
    let packet = envelope.packet.ok_or(RegionalError::MissingPacket)?;

    let (data, was_encrypted) = match &packet.payload_variant {
        Some(PayloadVariant::Decoded(data)) => (data.clone(), false),
        Some(PayloadVariant::Encrypted(sealed)) if !sealed.is_empty() => {
            let clear = decrypt_packet(sealed, key, packet.id, packet.from)?;
            let data = proto::Data::decode(clear.as_slice()).map_err(RegionalError::Payload)?;
            (data, true)
        }
        _ => return Ok(None),
    };

    Ok(Some(DecodedPacket {
        sender: packet.from,
        packet_id: packet.id,
        channel_id: envelope.channel_id,
        gateway_id: envelope.gateway_id,
        rx_rssi: packet.rx_rssi,
        rx_snr: packet.rx_snr,
        was_encrypted,
        data,
    }))
}
