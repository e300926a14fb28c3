//! Test utilities & fixtures.
//! An in-memory transport double plus helpers to build encrypted mesh traffic.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use meshgate::config::{Config, GatewaySettings};
use meshgate::gateway::{MeshGateway, OutboundRequest};
use meshgate::meshtastic::{
    crypto, envelope, topic, AppData, Envelope, Nonce, Packet, PacketPayload, PortNum,
};
use meshgate::sink::ChannelSink;
use meshgate::storage::NodeStore;
use meshgate::transport::{RawMessage, Transport, TransportError, TransportState};

pub const GATEWAY_ID: u32 = 0xabcd1234;
pub const ALICE: u32 = 0x7f4dbc79;

pub struct MemoryTransport {
    state: Mutex<TransportState>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    subscriptions: Mutex<Vec<String>>,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<RawMessage>>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RawMessage>>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(TransportState::Connected),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            incoming_tx: Mutex::new(Some(tx)),
            incoming_rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Queue a message as if the broker delivered it.
    pub fn inject(&self, msg: RawMessage) {
        if let Some(tx) = self.incoming_tx.lock().unwrap().as_ref() {
            tx.send(msg).unwrap();
        }
    }

    pub fn set_state(&self, state: TransportState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Poll until at least `n` messages were published.
    pub async fn wait_published(&self, n: usize) -> Vec<(String, Vec<u8>)> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let published = self.published();
            if published.len() >= n || tokio::time::Instant::now() > deadline {
                return published;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(&self, pattern: &str) -> Result<(), TransportError> {
        self.subscriptions.lock().unwrap().push(pattern.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let state = self.state();
        if state != TransportState::Connected {
            return Err(TransportError::NotConnected(state));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn receive(&self) -> Option<RawMessage> {
        self.incoming_rx.lock().await.recv().await
    }

    async fn close(&self) {
        self.set_state(TransportState::Stopped);
        self.incoming_tx.lock().unwrap().take();
    }

    fn state(&self) -> TransportState {
        *self.state.lock().unwrap()
    }
}

pub fn test_config() -> Config {
    toml::from_str(
        r#"
        [mqtt]
        host = "localhost"
        port = 1883

        [meshtastic]
        gateway_id = "!abcd1234"
        channel_name = "LongFast"
        channel_key = "AQ=="
        root_topic = "msh/test"
        fragment_gap_ms = 0

        [welcome]
        enabled = false
        message = "Welcome aboard!"

        [moderation]
        blocklist = ["!deadbeef"]
        "#,
    )
    .expect("test config parses")
}

pub fn settings_from(config: &Config) -> GatewaySettings {
    config.gateway_settings().expect("valid test settings")
}

pub struct Harness {
    pub gateway: Arc<MeshGateway>,
    pub transport: Arc<MemoryTransport>,
    pub store: Arc<NodeStore>,
    pub sink_rx: mpsc::UnboundedReceiver<String>,
    pub outbound_rx: mpsc::UnboundedReceiver<OutboundRequest>,
}

pub fn harness(config: &Config) -> Harness {
    let transport = MemoryTransport::new();
    let store = Arc::new(NodeStore::open_in_memory().expect("in-memory store"));
    let (sink, sink_rx) = ChannelSink::new();
    let (gateway, outbound_rx) = MeshGateway::new(
        settings_from(config),
        transport.clone(),
        store.clone(),
        Arc::new(sink),
    );
    Harness {
        gateway,
        transport,
        store,
        sink_rx,
        outbound_rx,
    }
}

/// Encrypted broker message from `from` carrying `data`, as another gateway would publish it.
pub fn mesh_message_with_key(
    settings: &GatewaySettings,
    key: &[u8],
    from: u32,
    id: u32,
    data: &AppData,
) -> RawMessage {
    let channel = &settings.channel;
    let ciphertext = crypto::encrypt(key, &Nonce::new(id, from), &envelope::encode_data(data))
        .expect("encrypt");
    let mut packet = Packet::new(id, from, 0xffff_ffff, PacketPayload::Encrypted(ciphertext));
    packet.channel = channel.hash();
    packet.hop_limit = 3;
    let env = Envelope {
        packet,
        channel_id: channel.name().to_string(),
        gateway_id: "!00c0ffee".to_string(),
    };
    RawMessage {
        topic: topic::build_topic(channel.root_topic(), channel.name(), 0x00c0ffee),
        payload: Bytes::from(envelope::encode_envelope(&env)),
    }
}

pub fn mesh_message(settings: &GatewaySettings, from: u32, id: u32, data: &AppData) -> RawMessage {
    mesh_message_with_key(settings, settings.channel.key(), from, id, data)
}

pub fn text_message(settings: &GatewaySettings, from: u32, id: u32, text: &str) -> RawMessage {
    mesh_message(settings, from, id, &AppData::text(PortNum::TextMessageApp, text))
}

/// Decode and decrypt one published envelope back to its `Data`.
pub fn open_published(settings: &GatewaySettings, payload: &[u8]) -> (Envelope, AppData) {
    let env = envelope::decode_envelope(payload).expect("published envelope decodes");
    let ciphertext = match &env.packet.payload {
        PacketPayload::Encrypted(bytes) => bytes.clone(),
        PacketPayload::Decoded(_) => panic!("published packet must be encrypted"),
    };
    let nonce = Nonce::new(env.packet.id, env.packet.from);
    let plain = crypto::decrypt(settings.channel.key(), &nonce, &ciphertext).expect("decrypt");
    let data = envelope::decode_data(&plain).expect("data decodes");
    (env, data)
}
