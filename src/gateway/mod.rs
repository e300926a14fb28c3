//! # Gateway Module - Mesh ⇄ Sink Relay
//!
//! [`MeshGateway`] owns the relay logic in both directions.
//!
//! ## Inbound
//!
//! Each message from the broker goes through the same ordered pipeline in
//! [`MeshGateway::handle_inbound`]:
//!
//! 1. topic must be `{root}/2/e/{our channel}/!{node}`
//! 2. decode the `ServiceEnvelope`
//! 3. drop blocklisted senders and echoes of our own publishes
//! 4. drop plaintext packets and packets carrying another channel's hash
//! 5. decrypt and decode the `Data` payload with the channel key
//! 6. drop duplicates (same packet id from the same sender)
//! 7. refresh the sender in the node store, send the welcome DM if due
//! 8. dispatch on port: text goes to the sink, NodeInfo and Position update the store
//!
//! Every step that drops a message logs why and returns a matching [`InboundOutcome`];
//! nothing in this path returns an error to the caller.
//!
//! ## Outbound
//!
//! Text destined for the mesh is queued as an [`OutboundRequest`] through an
//! [`OutboundHandle`] and published by a single task, so fragments of one message are
//! never interleaved with another. [`MeshGateway::send_text`] does the actual work:
//! chunk, build one encrypted packet per fragment and publish with a fixed gap.
//!
//! ## Tasks
//!
//! [`MeshGateway::run`] spawns one inbound and one outbound task and waits for both.
//! They stop when the shutdown watch flips to `true`.

use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::config::GatewaySettings;
use crate::logutil::{escape_log, hex_snippet, truncate_for_log};
use crate::meshtastic::{
    chunker, crypto, envelope, fmt_node_id, new_packet_id, topic, AppData, ChunkError,
    CryptoError, DedupCache, Envelope, Nonce, Packet, PacketPayload, PortNum,
    ProtocolParseError, BROADCAST_ADDR,
};
use crate::metrics;
use crate::sink::MessageSink;
use crate::storage::{NodeStore, NodeUpdate, StorageError};
use crate::transport::{RawMessage, Transport, TransportError};

/// Bitfield value the firmware sets on direct messages (ok-to-mqtt + want-response).
const BITFIELD_DIRECT: u32 = 3;
/// Bitfield value for broadcasts (ok-to-mqtt).
const BITFIELD_BROADCAST: u32 = 1;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("outbound queue is closed")]
    QueueClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Cli,
    Sink,
    Welcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub destination: u32,
    pub text: String,
    pub origin: Origin,
}

/// Cloneable producer side of the outbound queue.
#[derive(Debug, Clone)]
pub struct OutboundHandle {
    tx: mpsc::UnboundedSender<OutboundRequest>,
}

impl OutboundHandle {
    pub fn send(&self, request: OutboundRequest) -> Result<(), GatewayError> {
        self.tx.send(request).map_err(|_| GatewayError::QueueClosed)
    }

    pub fn broadcast(&self, text: impl Into<String>, origin: Origin) -> Result<(), GatewayError> {
        self.send(OutboundRequest {
            destination: BROADCAST_ADDR,
            text: text.into(),
            origin,
        })
    }

    pub fn direct(
        &self,
        node_id: u32,
        text: impl Into<String>,
        origin: Origin,
    ) -> Result<(), GatewayError> {
        self.send(OutboundRequest {
            destination: node_id,
            text: text.into(),
            origin,
        })
    }
}

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    /// Topic outside our channel's `2/e` tree.
    UnrelatedTopic,
    /// Envelope, data or text could not be parsed.
    Malformed,
    Blocked { from: u32 },
    OwnPacket,
    ForeignChannel { hash: u32 },
    /// Packet arrived as plaintext `Data` instead of channel-encrypted bytes.
    Unencrypted { from: u32 },
    /// Payload did not decrypt into a valid `Data` message (wrong key or corrupt).
    Undecryptable { from: u32 },
    Duplicate { from: u32, id: u32 },
    Delivered { from: u32, line: String },
    /// Text received while mesh → sink relay is disabled.
    NotRelayed { from: u32 },
    NodeInfo { from: u32 },
    Position { from: u32 },
    Ignored { from: u32, portnum: i32 },
}

pub struct MeshGateway {
    settings: GatewaySettings,
    transport: Arc<dyn Transport>,
    store: Arc<NodeStore>,
    sink: Arc<dyn MessageSink>,
    dedup: Mutex<DedupCache>,
    outbound: OutboundHandle,
}

impl MeshGateway {
    /// Build a gateway. The returned receiver is the outbound queue to pass to
    /// [`MeshGateway::run`].
    pub fn new(
        settings: GatewaySettings,
        transport: Arc<dyn Transport>,
        store: Arc<NodeStore>,
        sink: Arc<dyn MessageSink>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dedup = DedupCache::new(settings.dedup_window, settings.dedup_capacity);
        let gateway = MeshGateway {
            settings,
            transport,
            store,
            sink,
            dedup: Mutex::new(dedup),
            outbound: OutboundHandle { tx },
        };
        (Arc::new(gateway), rx)
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn handle(&self) -> OutboundHandle {
        self.outbound.clone()
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    fn publish_topic(&self) -> String {
        let channel = &self.settings.channel;
        topic::build_topic(channel.root_topic(), channel.name(), self.settings.gateway_id)
    }

    pub fn subscription(&self) -> String {
        let channel = &self.settings.channel;
        topic::subscription_pattern(channel.root_topic(), channel.name())
    }

    /// Run one broker message through the inbound pipeline.
    ///
    /// Synchronous: node store writes happen inline on the calling task. Each is a single
    /// indexed SQLite statement, small next to the rate a mesh channel can produce.
    pub fn handle_inbound(&self, msg: &RawMessage) -> InboundOutcome {
        metrics::inc_received();
        match topic::parse_topic(&msg.topic) {
            Some((channel, _)) if channel == self.settings.channel.name() => {}
            _ => {
                debug!("Ignoring message on unrelated topic {}", escape_log(&msg.topic));
                return InboundOutcome::UnrelatedTopic;
            }
        }

        let env = match envelope::decode_envelope(&msg.payload) {
            Ok(env) => env,
            Err(e) => {
                metrics::inc_parse_failures();
                debug!(
                    "Undecodable envelope on {}: {} ({})",
                    msg.topic,
                    e,
                    hex_snippet(&msg.payload, 32)
                );
                return InboundOutcome::Malformed;
            }
        };
        let packet = env.packet;
        let from = packet.from;

        if self.settings.blocklist.contains(&from) {
            metrics::inc_blocked();
            debug!("Ignoring packet from blocked node {}", fmt_node_id(from));
            return InboundOutcome::Blocked { from };
        }
        if from == self.settings.gateway_id {
            return InboundOutcome::OwnPacket;
        }

        let data = match packet.payload {
            PacketPayload::Encrypted(ciphertext) => {
                let hash = self.settings.channel.hash();
                if packet.channel != 0 && packet.channel != hash {
                    debug!(
                        "Packet {:#010x} from {} is for channel hash {}, ours is {}",
                        packet.id,
                        fmt_node_id(from),
                        packet.channel,
                        hash
                    );
                    return InboundOutcome::ForeignChannel {
                        hash: packet.channel,
                    };
                }
                match self.decrypt_data(packet.id, from, &ciphertext) {
                    Ok(data) => data,
                    Err(e) => {
                        metrics::inc_decrypt_failures();
                        debug!(
                            "Could not decrypt packet {:#010x} from {}: {}",
                            packet.id,
                            fmt_node_id(from),
                            e
                        );
                        return InboundOutcome::Undecryptable { from };
                    }
                }
            }
            // the 2/e tree only carries channel-encrypted payloads
            PacketPayload::Decoded(data) => {
                metrics::inc_unencrypted();
                warn!(
                    "Dropping unencrypted packet {:#010x} from {} (portnum {})",
                    packet.id,
                    fmt_node_id(from),
                    data.portnum
                );
                return InboundOutcome::Unencrypted { from };
            }
        };

        let first_seen = self
            .dedup
            .lock()
            .map(|mut cache| cache.observe(packet.id, from, std::time::Instant::now()))
            .unwrap_or(true);
        if !first_seen {
            metrics::inc_duplicates();
            debug!(
                "Duplicate packet {:#010x} from {} ignored",
                packet.id,
                fmt_node_id(from)
            );
            return InboundOutcome::Duplicate {
                from,
                id: packet.id,
            };
        }

        if let Err(e) = self.store.upsert(&NodeUpdate::heard(from)) {
            warn!("Failed to record node {}: {}", fmt_node_id(from), e);
        }
        self.maybe_welcome(from);

        self.dispatch(from, &data)
    }

    fn decrypt_data(&self, packet_id: u32, from: u32, ciphertext: &[u8]) -> Result<AppData, DecryptError> {
        let nonce = Nonce::new(packet_id, from);
        let plain = crypto::decrypt(self.settings.channel.key(), &nonce, ciphertext)?;
        Ok(envelope::decode_data(&plain)?)
    }

    fn maybe_welcome(&self, from: u32) {
        if !self.settings.welcome_enabled {
            return;
        }
        match self.store.is_first_observation(from) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!("Welcome check failed for {}: {}", fmt_node_id(from), e);
                return;
            }
        }
        info!("Sending welcome message to new node {}", fmt_node_id(from));
        if let Err(e) = self.store.mark_welcome_sent(from) {
            warn!("Failed to mark {} as welcomed: {}", fmt_node_id(from), e);
            return;
        }
        if let Err(e) = self
            .outbound
            .direct(from, self.settings.welcome_message.clone(), Origin::Welcome)
        {
            warn!("Could not queue welcome for {}: {}", fmt_node_id(from), e);
        }
    }

    fn dispatch(&self, from: u32, data: &AppData) -> InboundOutcome {
        match data.port() {
            Some(PortNum::TextMessageApp) => {
                let text = match data.as_text() {
                    Ok(text) => text,
                    Err(e) => {
                        metrics::inc_parse_failures();
                        debug!("Text from {} rejected: {}", fmt_node_id(from), e);
                        return InboundOutcome::Malformed;
                    }
                };
                if !self.settings.relay_mesh_to_sink {
                    debug!("Mesh to sink relay disabled; not forwarding text from {}", fmt_node_id(from));
                    return InboundOutcome::NotRelayed { from };
                }
                let name = self
                    .store
                    .display_name(from)
                    .unwrap_or_else(|_| fmt_node_id(from));
                let line = format!("[{}] {}", name, text);
                info!("Relaying: {}", escape_log(&line));
                self.sink.enqueue(line.clone());
                metrics::inc_delivered();
                InboundOutcome::Delivered { from, line }
            }
            Some(PortNum::NodeinfoApp) => match envelope::decode_user(&data.payload) {
                Ok(user) => {
                    info!(
                        "NodeInfo from {}: '{}' ({})",
                        fmt_node_id(from),
                        escape_log(&user.long_name),
                        escape_log(&user.short_name)
                    );
                    let update = NodeUpdate::heard(from)
                        .with_names(Some(&user.long_name), Some(&user.short_name));
                    if let Err(e) = self.store.upsert(&update) {
                        warn!("Failed to store NodeInfo for {}: {}", fmt_node_id(from), e);
                    }
                    InboundOutcome::NodeInfo { from }
                }
                Err(e) => {
                    metrics::inc_parse_failures();
                    debug!("Bad NodeInfo from {}: {}", fmt_node_id(from), e);
                    InboundOutcome::Malformed
                }
            },
            Some(PortNum::PositionApp) => match envelope::decode_position(&data.payload) {
                Ok(pos) => {
                    if let (Some(lat), Some(lon)) = (pos.latitude_i, pos.longitude_i) {
                        let update = NodeUpdate::heard(from)
                            .with_position(lat as f64 * 1e-7, lon as f64 * 1e-7);
                        if let Err(e) = self.store.upsert(&update) {
                            warn!("Failed to store position for {}: {}", fmt_node_id(from), e);
                        }
                    }
                    InboundOutcome::Position { from }
                }
                Err(e) => {
                    metrics::inc_parse_failures();
                    debug!("Bad Position from {}: {}", fmt_node_id(from), e);
                    InboundOutcome::Malformed
                }
            },
            _ => {
                debug!(
                    "Ignoring portnum {} from {}",
                    data.portnum,
                    fmt_node_id(from)
                );
                InboundOutcome::Ignored {
                    from,
                    portnum: data.portnum,
                }
            }
        }
    }

    /// Build the encrypted envelope for one text fragment.
    pub fn build_text_envelope(&self, destination: u32, text: &str) -> Result<Envelope, GatewayError> {
        let direct = destination != BROADCAST_ADDR;
        let mut data = AppData::text(PortNum::TextMessageApp, text);
        data.bitfield = Some(if direct { BITFIELD_DIRECT } else { BITFIELD_BROADCAST });

        let id = new_packet_id();
        let from = self.settings.gateway_id;
        let nonce = Nonce::new(id, from);
        let ciphertext = crypto::encrypt(
            self.settings.channel.key(),
            &nonce,
            &envelope::encode_data(&data),
        )?;

        let mut packet = Packet::new(id, from, destination, PacketPayload::Encrypted(ciphertext));
        packet.channel = self.settings.channel.hash();
        packet.hop_limit = self.settings.hop_limit;
        packet.hop_start = self.settings.hop_limit;
        packet.want_ack = direct;
        Ok(Envelope {
            packet,
            channel_id: self.settings.channel.name().to_string(),
            gateway_id: self.settings.gateway_id_text(),
        })
    }

    /// Chunk, encrypt and publish `text`. Returns the number of fragments published.
    pub async fn send_text(&self, destination: u32, text: &str) -> Result<usize, GatewayError> {
        let fragments = chunker::split(text, self.settings.max_payload_bytes)?;
        if fragments.is_empty() {
            debug!("Nothing to send to {}", fmt_node_id(destination));
            return Ok(0);
        }
        let topic = self.publish_topic();
        let total = fragments.len();
        if total > 1 {
            info!("Splitting message to {} into {} parts", fmt_node_id(destination), total);
        }
        for (i, fragment) in fragments.iter().enumerate() {
            let env = self.build_text_envelope(destination, fragment)?;
            let bytes = envelope::encode_envelope(&env);
            if let Err(e) = self.transport.publish(&topic, bytes).await {
                metrics::inc_publish_failures();
                return Err(e.into());
            }
            metrics::inc_fragments_published();
            debug!(
                "Published packet {:#010x} ({}/{}) to {}",
                env.packet.id,
                i + 1,
                total,
                topic
            );
            if i + 1 < total {
                tokio::time::sleep(self.settings.fragment_gap).await;
            }
        }
        Ok(total)
    }

    async fn process_outbound(&self, request: OutboundRequest) {
        if request.origin == Origin::Sink && !self.settings.relay_sink_to_mesh {
            debug!("Sink to mesh relay disabled; dropping outbound message");
            return;
        }
        let dest = fmt_node_id(request.destination);
        debug!(
            "Outbound {:?} to {}: {}",
            request.origin,
            dest,
            truncate_for_log(&request.text, 80)
        );
        match self.send_text(request.destination, &request.text).await {
            Ok(n) => info!("Sent {:?} message to {} in {} packet(s)", request.origin, dest, n),
            Err(e) => error!("Failed to send {:?} message to {}: {}", request.origin, dest, e),
        }
    }

    /// Run the inbound and outbound tasks until `shutdown` flips to `true`, then close the
    /// transport and stop the sink.
    pub async fn run(
        self: Arc<Self>,
        mut outbound_rx: mpsc::UnboundedReceiver<OutboundRequest>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        self.sink.start().await?;
        self.transport.subscribe(&self.subscription()).await?;
        info!(
            "Gateway {} relaying channel '{}' under {}",
            self.settings.gateway_id_text(),
            self.settings.channel.name(),
            self.settings.channel.root_topic()
        );

        let inbound = {
            let gw = self.clone();
            let mut shutdown = shutdown.clone();
            let mut stats = self.settings.stats_interval.map(|period| {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker
            });
            tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = next_tick(&mut stats) => {
                            info!("Traffic: {}", metrics::snapshot());
                        }
                        msg = gw.transport.receive() => match msg {
                            Some(msg) => {
                                gw.handle_inbound(&msg);
                            }
                            None => {
                                warn!("Transport closed; inbound task exiting");
                                break;
                            }
                        }
                    }
                }
                debug!("Inbound task finished");
            })
        };

        let outbound = {
            let gw = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        req = outbound_rx.recv() => match req {
                            Some(req) => gw.process_outbound(req).await,
                            None => break,
                        }
                    }
                }
                debug!("Outbound task finished");
            })
        };

        let (inbound_res, outbound_res) = tokio::join!(inbound, outbound);
        if let Err(e) = inbound_res {
            error!("Inbound task failed: {}", e);
        }
        if let Err(e) = outbound_res {
            error!("Outbound task failed: {}", e);
        }

        self.transport.close().await;
        self.sink.stop().await;
        info!("Gateway stopped. {}", metrics::snapshot());
        Ok(())
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[derive(Debug, Error)]
enum DecryptError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Parse(#[from] ProtocolParseError),
}
