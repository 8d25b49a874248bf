//! The closed set of mesh transports, selected from configuration.

use async_trait::async_trait;
use log::info;

use super::interface::{InterfaceCore, MeshInterface};
use super::meshcore::MeshCoreInterface;
use super::types::MeshNode;
use crate::config::{ConnectionKind, MeshConfig, MeshProtocol};
use crate::meshtastic::{DeviceSettings, MeshtasticInterface};

pub enum MeshTransport {
    Meshtastic(MeshtasticInterface),
    MeshCore(MeshCoreInterface),
}

impl MeshTransport {
    pub fn from_config(cfg: &MeshConfig) -> Self {
        match cfg.protocol {
            MeshProtocol::Meshtastic => {
                let settings = DeviceSettings::from_config(cfg);
                info!("Using Meshtastic transport ({})", settings.target.describe());
                MeshTransport::Meshtastic(MeshtasticInterface::new(settings))
            }
            MeshProtocol::Meshcore => {
                let endpoint = match cfg.connection_type {
                    ConnectionKind::Serial => cfg.serial_port.clone(),
                    ConnectionKind::Tcp => format!("{}:{}", cfg.tcp_host, cfg.tcp_port),
                };
                MeshTransport::MeshCore(MeshCoreInterface::new(endpoint))
            }
        }
    }

    pub fn as_meshtastic(&self) -> Option<&MeshtasticInterface> {
        match self {
            MeshTransport::Meshtastic(m) => Some(m),
            MeshTransport::MeshCore(_) => None,
        }
    }

    fn inner(&self) -> &dyn MeshInterface {
        match self {
            MeshTransport::Meshtastic(m) => m,
            MeshTransport::MeshCore(m) => m,
        }
    }
}

#[async_trait]
impl MeshInterface for MeshTransport {
    fn core(&self) -> &InterfaceCore {
        self.inner().core()
    }

    fn protocol(&self) -> &'static str {
        self.inner().protocol()
    }

    fn is_supported(&self) -> bool {
        self.inner().is_supported()
    }

    async fn connect(&self) -> bool {
        self.inner().connect().await
    }

    async fn disconnect(&self) {
        self.inner().disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.inner().is_connected()
    }

    async fn send_message(
        &self,
        text: &str,
        destination: Option<&str>,
        channel: u32,
        want_ack: bool,
    ) -> bool {
        self.inner()
            .send_message(text, destination, channel, want_ack)
            .await
    }

    fn get_node(&self, node_id: &str) -> Option<MeshNode> {
        self.inner().get_node(node_id)
    }

    fn get_all_nodes(&self) -> Vec<MeshNode> {
        self.inner().get_all_nodes()
    }
}
