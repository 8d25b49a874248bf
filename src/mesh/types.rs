//! Shared value types passed between transports and their consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Recipient id meaning "every node on this channel".
pub const BROADCAST_ID: &str = "^all";
/// Numeric form of [`BROADCAST_ID`] on the wire.
pub const BROADCAST_NUM: u32 = 0xffff_ffff;

/// A participant on the mesh.
///
/// `is_online` is derived: transports recompute it from their presence
/// tracker every time a node is handed out, so a stored value is never
/// authoritative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshNode {
    pub node_id: String,
    pub short_name: String,
    pub long_name: String,
    pub hardware: String,
    pub battery_level: Option<u32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub last_heard: Option<DateTime<Utc>>,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub hops_away: Option<u32>,
    pub is_online: bool,
    /// Transport-specific fields kept for consumers that want more than the
    /// normalized view.
    #[serde(default)]
    pub raw_data: serde_json::Value,
}

impl MeshNode {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Long name if set, then short name, then the id itself.
    pub fn display_name(&self) -> &str {
        if !self.long_name.trim().is_empty() {
            self.long_name.trim()
        } else if !self.short_name.trim().is_empty() {
            self.short_name.trim()
        } else {
            &self.node_id
        }
    }
}

/// A text event received from (or destined for) the mesh. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshMessage {
    /// Packet id as a string; empty for synthetic messages.
    pub message_id: String,
    pub from_id: String,
    /// `None` for broadcasts.
    pub to_id: Option<String>,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub channel: u32,
    pub is_direct: bool,
    pub hop_start: Option<u32>,
    pub hop_limit: Option<u32>,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    /// Snapshot of the sender as known when the message arrived.
    pub from_node: Option<MeshNode>,
    #[serde(default)]
    pub raw_packet: serde_json::Value,
}

/// Transport connection state. Exactly one value is held at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Canonical `!xxxxxxxx` form of a numeric node id.
pub fn format_node_id(num: u32) -> String {
    format!("!{num:08x}")
}

/// Add the `!` sigil to ids reported without it. The broadcast id is left alone.
pub fn normalize_node_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('!') || trimmed == BROADCAST_ID {
        trimmed.to_string()
    } else {
        format!("!{trimmed}")
    }
}

/// Parse a destination id into its numeric form.
///
/// Accepted: `^all`, `!hex` and `0xhex`. Bare strings are rejected since
/// `12345678` is ambiguous between decimal and hex.
pub fn parse_node_num(id: &str) -> Option<u32> {
    let id = id.trim();
    if id == BROADCAST_ID {
        return Some(BROADCAST_NUM);
    }
    if let Some(hex) = id.strip_prefix('!') {
        return u32::from_str_radix(hex, 16).ok();
    }
    let hex = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X"))?;
    u32::from_str_radix(hex, 16).ok()
}

/// A packet is direct only when addressed to us and not to the broadcast address.
pub fn is_direct(to: u32, my_node_num: Option<u32>) -> bool {
    to != BROADCAST_NUM && my_node_num == Some(to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_format_and_parse() {
        assert_eq!(format_node_id(0x0a1b2c3d), "!0a1b2c3d");
        assert_eq!(parse_node_num("!0a1b2c3d"), Some(0x0a1b2c3d));
        assert_eq!(parse_node_num("0x0A1B2C3D"), Some(0x0a1b2c3d));
        assert_eq!(parse_node_num("abcd"), None);
        assert_eq!(parse_node_num("12345678"), None);
        assert_eq!(parse_node_num("^all"), Some(BROADCAST_NUM));
        assert_eq!(parse_node_num("!nothex"), None);
        assert_eq!(parse_node_num(""), None);
    }

    #[test]
    fn normalize_adds_sigil_once() {
        assert_eq!(normalize_node_id("0a1b2c3d"), "!0a1b2c3d");
        assert_eq!(normalize_node_id("!0a1b2c3d"), "!0a1b2c3d");
        assert_eq!(normalize_node_id("^all"), "^all");
    }

    #[test]
    fn direct_requires_our_id_and_not_broadcast() {
        assert!(is_direct(7, Some(7)));
        assert!(!is_direct(7, Some(8)));
        assert!(!is_direct(7, None));
        assert!(!is_direct(BROADCAST_NUM, Some(BROADCAST_NUM)));
    }

    #[test]
    fn display_name_falls_back() {
        let mut node = MeshNode::new("!00000001");
        assert_eq!(node.display_name(), "!00000001");
        node.short_name = "AB".into();
        assert_eq!(node.display_name(), "AB");
        node.long_name = "Alpha Base".into();
        assert_eq!(node.display_name(), "Alpha Base");
    }
}
