//! Composition root: builds every service once from [`Config`] and owns them.

use anyhow::{bail, Result};
use log::{info, warn};
use std::sync::Arc;

use crate::config::Config;
use crate::mesh::{MeshInterface, MeshMessage, MeshTransport};
use crate::regional::RegionalService;

pub struct Gateway {
    config: Config,
    mesh: Arc<MeshTransport>,
    regional: Option<Arc<RegionalService>>,
}

impl Gateway {
    /// Select the transport and build the regional service if enabled.
    /// An unsupported transport is a startup error.
    pub fn new(config: Config) -> Result<Self> {
        let mesh = MeshTransport::from_config(&config.mesh);
        if !mesh.is_supported() {
            bail!(
                "Mesh protocol '{}' is not supported by this build",
                mesh.protocol()
            );
        }
        let regional = config
            .mqtt
            .enabled
            .then(|| Arc::new(RegionalService::from_config(&config.mqtt)));
        Ok(Self {
            config,
            mesh: Arc::new(mesh),
            regional,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mesh(&self) -> &Arc<MeshTransport> {
        &self.mesh
    }

    pub fn regional(&self) -> Option<&Arc<RegionalService>> {
        self.regional.as_ref()
    }

    /// Connect the radio and start the regional feed.
    ///
    /// A failed first connect is not fatal: the transport stays in `Error`
    /// and the gateway runs offline. Reconnection only follows a lost link.
    pub async fn start(&self) -> Result<()> {
        if !self.mesh.connect().await {
            warn!(
                "Initial {} connect failed; running without the radio",
                self.mesh.protocol()
            );
        }
        if let Some(regional) = &self.regional {
            if !regional.start() {
                bail!("Failed to start regional MQTT service");
            }
        }
        info!(
            "Gateway started (mesh: {}, regional: {})",
            self.mesh.state(),
            if self.regional.is_some() { "on" } else { "off" }
        );
        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Some(regional) = &self.regional {
            regional.stop().await;
        }
        self.mesh.disconnect().await;
        info!("Gateway stopped");
    }

    /// Answer `message` with the configured chunking: direct messages go back
    /// to the sender, channel messages to the same channel.
    pub async fn reply(&self, message: &MeshMessage, text: &str) -> bool {
        let destination = message.is_direct.then_some(message.from_id.as_str());
        self.mesh
            .send_chunked_message(
                text,
                destination,
                message.channel,
                self.config.mesh.max_message_length,
                self.config.mesh.chunk_delay(),
                true,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionKind, MeshProtocol};
    use crate::mesh::ConnectionState;

    #[test]
    fn meshcore_is_rejected_at_startup() {
        let mut config = Config::default();
        config.mesh.protocol = MeshProtocol::Meshcore;
        let err = Gateway::new(config).err().unwrap();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn regional_service_follows_enabled_flag() {
        let gw = Gateway::new(Config::default()).unwrap();
        assert!(gw.regional().is_none());

        let mut config = Config::default();
        config.mqtt.enabled = true;
        let gw = Gateway::new(config).unwrap();
        assert!(gw.regional().is_some());
    }

    #[tokio::test]
    async fn failed_first_connect_leaves_transport_in_error() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = Config::default();
        config.mesh.connection_type = ConnectionKind::Tcp;
        config.mesh.tcp_host = "127.0.0.1".into();
        config.mesh.tcp_port = port;
        config.mesh.handshake_timeout_seconds = 2;
        let gw = Gateway::new(config).unwrap();

        gw.start().await.unwrap();
        assert_eq!(gw.mesh().state(), ConnectionState::Error);
        let device = gw.mesh().as_meshtastic().unwrap();
        assert!(!device.is_reconnecting());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(gw.mesh().state(), ConnectionState::Error);
        assert!(!device.is_reconnecting());
        gw.shutdown().await;
    }
}
