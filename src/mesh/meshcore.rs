//! MeshCore placeholder transport.
//!
//! MeshCore companion radios speak a different framing than Meshtastic and no
//! implementation exists yet. The variant is kept so configuration can name it,
//! and every operation fails with an explicit not-supported result.

use async_trait::async_trait;
use log::{error, warn};

use super::interface::{InterfaceCore, MeshInterface};
use super::types::{ConnectionState, MeshNode};

pub struct MeshCoreInterface {
    core: InterfaceCore,
    endpoint: String,
}

impl MeshCoreInterface {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            core: InterfaceCore::new(),
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl MeshInterface for MeshCoreInterface {
    fn core(&self) -> &InterfaceCore {
        &self.core
    }

    fn protocol(&self) -> &'static str {
        "meshcore"
    }

    fn is_supported(&self) -> bool {
        false
    }

    async fn connect(&self) -> bool {
        self.core.set_state(ConnectionState::Connecting);
        error!(
            "MeshCore transport is not supported (endpoint {}); set mesh.protocol = \"meshtastic\"",
            self.endpoint
        );
        self.core.set_state(ConnectionState::Error);
        false
    }

    async fn disconnect(&self) {
        self.core.set_state(ConnectionState::Disconnected);
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn send_message(
        &self,
        _text: &str,
        _destination: Option<&str>,
        _channel: u32,
        _want_ack: bool,
    ) -> bool {
        warn!("MeshCore transport is not supported; message dropped");
        false
    }

    fn get_node(&self, node_id: &str) -> Option<MeshNode> {
        self.core.node(node_id)
    }

    fn get_all_nodes(&self) -> Vec<MeshNode> {
        self.core.nodes_snapshot()
    }
}
