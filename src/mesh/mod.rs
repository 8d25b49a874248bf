//! Protocol-agnostic mesh layer.
//!
//! Heterogeneous radio transports are normalized into one event stream:
//! [`MeshMessage`] for text, [`MeshNode`] for node sightings and
//! [`ConnectionState`] for link status. Transports implement
//! [`MeshInterface`]; the closed set of them is [`MeshTransport`].

pub mod error;
pub mod interface;
pub mod meshcore;
pub mod observer;
pub mod transport;
pub mod types;

pub use error::MeshError;
pub use interface::{plan_chunks, strip_chunk_marker, InterfaceCore, MeshInterface};
pub use meshcore::MeshCoreInterface;
pub use observer::{forward_to, Callback, Observers};
pub use transport::MeshTransport;
pub use types::{
    format_node_id, is_direct, normalize_node_id, parse_node_num, ConnectionState, MeshMessage,
    MeshNode, BROADCAST_ID, BROADCAST_NUM,
};
