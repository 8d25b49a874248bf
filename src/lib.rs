//! # Groundwave - Mesh Protocol Ingestion Layer
//!
//! Groundwave normalizes traffic from low-power LoRa mesh radios into one event
//! stream that higher layers (bots, bridges, dashboards) can consume without
//! knowing which radio protocol produced it.
//!
//! ## Features
//!
//! - **Transport Contract**: One async [`mesh::MeshInterface`] trait for every radio
//!   protocol, with observer registration and lossless chunked sends built once above it.
//! - **Meshtastic Device Transport**: Serial or TCP stream API, want-config handshake,
//!   per-node presence tracking and a bounded, cancellable reconnection loop.
//! - **Regional Telemetry**: Optional MQTT feed of a whole region, decrypted with the
//!   well-known default channel key and kept in a bounded in-memory table.
//! - **Async Design**: Built with Tokio; blocking radio I/O stays on dedicated threads.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use groundwave::config::Config;
//! use groundwave::gateway::Gateway;
//! use groundwave::mesh::{MeshInterface, MeshMessage};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("groundwave.toml").await?;
//!     let gateway = Gateway::new(config)?;
//!
//!     gateway.mesh().on_message(std::sync::Arc::new(|msg: &MeshMessage| -> anyhow::Result<()> {
//!         println!("{}: {}", msg.from_id, msg.text);
//!         Ok(())
//!     }));
//!
//!     gateway.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`mesh`] - Event model, transport contract, observers and transport selection
//! - [`meshtastic`] - Meshtastic device transport
//! - [`regional`] - Regional MQTT telemetry pipeline
//! - [`gateway`] - Composition root owning every service
//! - [`config`] - Configuration loading and validation
//! - [`protobuf`] - Generated Meshtastic protobuf types
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐      ┌─────────────────┐
//! │    Gateway      │ ───► │ Regional MQTT   │ ← broker feed, decrypted
//! └─────────────────┘      └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ MeshInterface   │ ← observers, chunked send
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Meshtastic /    │ ← device link, reconnection
//! │ MeshCore        │
//! └─────────────────┘
//! ```

pub mod config;
pub mod gateway;
pub mod logutil;
pub mod mesh;
pub mod meshtastic;
pub mod metrics;
pub mod protobuf;
pub mod regional;
