//! # Configuration
//!
//! One TOML file with three sections:
//!
//! - [`MeshConfig`] - which transport to run and how to reach the radio
//! - [`RegionalConfig`] - the optional regional MQTT feed
//! - [`LoggingConfig`] - log level and optional log file
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Environment variables (`MESH_*`, `MQTT_*`) are applied on top of the file by
//! [`Config::apply_env`].
//!
//! ```rust,no_run
//! use groundwave::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load("groundwave.toml").await?;
//!     config.apply_env()?;
//!     config.validate()?;
//!     println!("Radio: {:?} over {:?}", config.mesh.protocol, config.mesh.connection_type);
//!     Ok(())
//! }
//! ```
//!
//! ```toml
//! [mesh]
//! protocol = "meshtastic"
//! connection_type = "tcp"
//! tcp_host = "192.168.1.40"
//!
//! [mqtt]
//! enabled = true
//! broker = "mqtt.meshtastic.org"
//! topic = "msh/US/#"
//! ```

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub mqtt: RegionalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MeshProtocol {
    #[default]
    Meshtastic,
    Meshcore,
}

impl FromStr for MeshProtocol {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "meshtastic" => Ok(MeshProtocol::Meshtastic),
            "meshcore" => Ok(MeshProtocol::Meshcore),
            other => Err(anyhow!("unknown mesh protocol '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    #[default]
    Serial,
    Tcp,
}

impl FromStr for ConnectionKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(ConnectionKind::Serial),
            "tcp" => Ok(ConnectionKind::Tcp),
            other => Err(anyhow!("unknown connection type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeshConfig {
    pub protocol: MeshProtocol,
    pub connection_type: ConnectionKind,
    /// Empty means auto-detect the first USB serial device.
    pub serial_port: String,
    pub baud_rate: u32,
    pub tcp_host: String,
    pub tcp_port: u16,
    /// Chunk size for outgoing text, in characters.
    pub max_message_length: usize,
    pub chunk_delay_seconds: f64,
    pub reconnect_max_attempts: u32,
    pub reconnect_delay_seconds: f64,
    pub online_window_seconds: u64,
    pub handshake_timeout_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub liveness_timeout_seconds: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            protocol: MeshProtocol::Meshtastic,
            connection_type: ConnectionKind::Serial,
            serial_port: String::new(),
            baud_rate: 115200,
            tcp_host: "localhost".to_string(),
            tcp_port: 4403,
            max_message_length: 175,
            chunk_delay_seconds: 15.0,
            reconnect_max_attempts: 20,
            reconnect_delay_seconds: 15.0,
            online_window_seconds: 7200,
            handshake_timeout_seconds: 30,
            heartbeat_interval_seconds: 30,
            liveness_timeout_seconds: 90,
        }
    }
}

impl MeshConfig {
    pub fn chunk_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.chunk_delay_seconds).unwrap_or(Duration::from_secs(15))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.reconnect_delay_seconds)
            .unwrap_or(Duration::from_secs(15))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegionalConfig {
    pub enabled: bool,
    pub broker: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub topic: String,
    pub region_name: String,
    /// Empty means a random id per start.
    pub client_id: String,
    pub keep_alive_seconds: u64,
    pub max_messages: usize,
    pub reconnect_pause_seconds: u64,
    pub stop_timeout_seconds: u64,
}

impl Default for RegionalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: "mqtt.meshtastic.org".to_string(),
            port: 1883,
            username: "meshdev".to_string(),
            password: "large4cats".to_string(),
            topic: "msh/US/#".to_string(),
            region_name: String::new(),
            client_id: String::new(),
            keep_alive_seconds: 60,
            max_messages: 100,
            reconnect_pause_seconds: 5,
            stop_timeout_seconds: 5,
        }
    }
}

impl RegionalConfig {
    /// Topic actually subscribed. The `/json/` feed carries no encrypted
    /// packets, so it is rewritten to the protobuf feed.
    pub fn effective_topic(&self) -> String {
        self.topic.replace("/json/", "/")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Apply `MESH_*` / `MQTT_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Unparseable values are errors.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr>(key: &str, raw: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow!("Invalid value for {}: {}", key, e))
        }

        let m = &mut self.mesh;
        if let Some(v) = lookup("MESH_PROTOCOL") {
            m.protocol = parsed("MESH_PROTOCOL", v)?;
        }
        if let Some(v) = lookup("MESH_CONNECTION_TYPE") {
            m.connection_type = parsed("MESH_CONNECTION_TYPE", v)?;
        }
        if let Some(v) = lookup("MESH_SERIAL_PORT") {
            m.serial_port = v;
        }
        if let Some(v) = lookup("MESH_BAUD_RATE") {
            m.baud_rate = parsed("MESH_BAUD_RATE", v)?;
        }
        if let Some(v) = lookup("MESH_TCP_HOST") {
            m.tcp_host = v;
        }
        if let Some(v) = lookup("MESH_TCP_PORT") {
            m.tcp_port = parsed("MESH_TCP_PORT", v)?;
        }
        if let Some(v) = lookup("MESH_MAX_MESSAGE_LENGTH") {
            m.max_message_length = parsed("MESH_MAX_MESSAGE_LENGTH", v)?;
        }
        if let Some(v) = lookup("MESH_CHUNK_DELAY") {
            m.chunk_delay_seconds = parsed("MESH_CHUNK_DELAY", v)?;
        }

        let q = &mut self.mqtt;
        if let Some(v) = lookup("MQTT_ENABLED") {
            q.enabled = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = lookup("MQTT_BROKER") {
            q.broker = v;
        }
        if let Some(v) = lookup("MQTT_PORT") {
            q.port = parsed("MQTT_PORT", v)?;
        }
        if let Some(v) = lookup("MQTT_USERNAME") {
            q.username = v;
        }
        if let Some(v) = lookup("MQTT_PASSWORD") {
            q.password = v;
        }
        if let Some(v) = lookup("MQTT_TOPIC") {
            q.topic = v;
        }
        if let Some(v) = lookup("MQTT_REGION") {
            q.region_name = v;
        }
        Ok(())
    }

    /// Reject values that would make the services misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        let m = &self.mesh;
        // "[1/9] " plus at least one character.
        if m.max_message_length < 8 {
            bail!("mesh.max_message_length must be at least 8 (got {})", m.max_message_length);
        }
        for (name, value) in [
            ("mesh.chunk_delay_seconds", m.chunk_delay_seconds),
            ("mesh.reconnect_delay_seconds", m.reconnect_delay_seconds),
        ] {
            if !value.is_finite() || value < 0.0 {
                bail!("{} must be a non-negative number (got {})", name, value);
            }
        }
        if m.reconnect_max_attempts == 0 {
            bail!("mesh.reconnect_max_attempts must be at least 1");
        }
        if m.connection_type == ConnectionKind::Tcp && m.tcp_host.trim().is_empty() {
            bail!("mesh.tcp_host is required when connection_type = \"tcp\"");
        }
        if m.heartbeat_interval_seconds == 0 || m.liveness_timeout_seconds <= m.heartbeat_interval_seconds {
            bail!("mesh.liveness_timeout_seconds must exceed a non-zero heartbeat interval");
        }

        let q = &self.mqtt;
        if q.enabled {
            if q.broker.trim().is_empty() {
                bail!("mqtt.broker is required when mqtt.enabled = true");
            }
            if q.topic.trim().is_empty() {
                bail!("mqtt.topic is required when mqtt.enabled = true");
            }
            if q.max_messages == 0 {
                bail!("mqtt.max_messages must be at least 1");
            }
        }
        Ok(())
    }
}
