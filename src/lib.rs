//! # Meshgate - Meshtastic MQTT Gateway
//!
//! Meshgate joins an encrypted Meshtastic channel through an MQTT broker and relays text
//! between the mesh and a message sink. It speaks the same wire format as Meshtastic
//! radios that uplink to MQTT: protobuf `ServiceEnvelope`s on `{root}/2/e/{channel}/!{node}`
//! topics, with AES-CTR encrypted payloads.
//!
//! ## Features
//!
//! - **Channel Crypto**: AES-128/256 CTR with per-packet counter blocks and PSK shorthand keys.
//! - **Inbound Relay**: Duplicate suppression, blocklist, node name resolution, `"[name] text"` delivery.
//! - **Outbound Relay**: Broadcast and direct messages, split into numbered fragments when too long.
//! - **Node Tracking**: SQLite store of names, positions and last-heard times.
//! - **Welcome Messages**: One-time direct message to each newly heard node.
//! - **Resilient Transport**: Automatic reconnect with backoff; subscriptions restored on reconnect.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshgate::config::Config;
//! use meshgate::gateway::MeshGateway;
//! use meshgate::sink::LogSink;
//! use meshgate::storage::NodeStore;
//! use meshgate::transport::MqttTransport;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let settings = config.gateway_settings()?;
//!     let transport = Arc::new(MqttTransport::connect(&config.mqtt));
//!     let store = Arc::new(NodeStore::open(&config.storage.db_path)?);
//!     let (gateway, outbound_rx) =
//!         MeshGateway::new(settings, transport, store, Arc::new(LogSink::new()));
//!
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     gateway.run(outbound_rx, shutdown_rx).await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`meshtastic`] - protocol: crypto, envelope codec, dedup, chunking, topics, channel
//! - [`transport`] - MQTT connection management
//! - [`gateway`] - inbound pipeline and outbound queue
//! - [`storage`] - node database
//! - [`sink`] - destinations for relayed text
//! - [`config`] - configuration loading and validation
//! - [`protobuf`] - generated Meshtastic protobuf types
//!
//! ## Architecture
//!
//! ```text
//!   MQTT broker
//!        │
//! ┌─────────────────┐
//! │   Transport     │ ← reconnecting rumqttc client
//! └─────────────────┘
//!        │
//! ┌─────────────────┐     ┌──────────────┐
//! │   MeshGateway   │ ──► │ MessageSink  │
//! └─────────────────┘     └──────────────┘
//!        │
//! ┌─────────────────┐
//! │   NodeStore     │ ← SQLite
//! └─────────────────┘
//! ```

pub mod config;
pub mod gateway;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod protobuf;
pub mod sink;
pub mod storage;
pub mod transport;
