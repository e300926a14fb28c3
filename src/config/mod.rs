//! # Configuration Management Module
//!
//! Loads, validates and writes the gateway configuration.
//!
//! ## Configuration Structure
//!
//! - [`MqttConfig`] - broker connection and reconnect tuning
//! - [`MeshtasticConfig`] - channel, key, root topic, gateway node id, packet sizing
//! - [`RelayConfig`] - which relay directions are enabled
//! - [`WelcomeConfig`] - direct welcome message for newly heard nodes
//! - [`ModerationConfig`] - node blocklist
//! - [`DedupConfig`] - duplicate suppression window and capacity
//! - [`StorageConfig`] - node database location
//! - [`LoggingConfig`] - log level, log file and stats interval
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshgate::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     // Validates the channel key and node ids; fails fast on a bad key.
//!     let settings = config.gateway_settings()?;
//!     println!("Channel: {}", settings.channel.name());
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [mqtt]
//! host = "mqtt.meshtastic.org"
//! port = 1883
//! username = "meshdev"
//! password = "large4cats"
//!
//! [meshtastic]
//! gateway_id = "!abcd1234"
//! channel_name = "LongFast"
//! channel_key = "AQ=="
//! root_topic = "msh/US"
//!
//! [moderation]
//! blocklist = ["!deadbeef"]
//! ```
//!
//! The raw [`Config`] is what lives on disk. [`GatewaySettings`] is the validated,
//! immutable view handed to the gateway at construction; nothing reads configuration
//! from global state.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

use crate::meshtastic::{self, Channel};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("channel key is not valid base64: {0}")]
    InvalidKeyEncoding(String),
    #[error("channel key must decode to 16 or 32 bytes (or a 1-byte PSK index), got {0}")]
    InvalidKeyLength(usize),
    #[error("channel key disables encryption; an encrypted channel is required")]
    UnencryptedChannel,
    #[error("invalid node id '{0}' (expected !xxxxxxxx)")]
    InvalidNodeId(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub meshtastic: MeshtasticConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub welcome: WelcomeConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Client identifier; a random one is generated when unset or empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Ceiling for the exponential reconnect delay.
    #[serde(default = "default_max_backoff")]
    pub reconnect_max_backoff_secs: u64,
}

fn default_keep_alive() -> u64 {
    30
}

fn default_max_backoff() -> u64 {
    30
}

impl MqttConfig {
    pub fn effective_client_id(&self) -> String {
        match self.client_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("meshgate-{:08x}", rand::random::<u32>()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshtasticConfig {
    /// Node id this gateway transmits as, e.g. "!abcd1234".
    pub gateway_id: String,
    pub channel_name: String,
    /// Base64 PSK. "AQ==" selects the default Meshtastic key.
    pub channel_key: String,
    /// MQTT root, e.g. "msh/US". The "2/e" segment is appended automatically.
    pub root_topic: String,
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,
    /// Delay between fragments of one long message (ms).
    #[serde(default = "default_fragment_gap")]
    pub fragment_gap_ms: u64,
    #[serde(default = "default_hop_limit")]
    pub hop_limit: u32,
}

fn default_max_payload() -> usize {
    meshtastic::MAX_PAYLOAD_BYTES
}

fn default_fragment_gap() -> u64 {
    1000
}

fn default_hop_limit() -> u32 {
    meshtastic::DEFAULT_HOP_LIMIT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Deliver mesh text messages to the message sink.
    #[serde(default = "default_true")]
    pub mesh_to_sink: bool,
    /// Accept outbound requests coming from the message sink.
    #[serde(default = "default_true")]
    pub sink_to_mesh: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mesh_to_sink: true,
            sink_to_mesh: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WelcomeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModerationConfig {
    /// Node ids whose packets are ignored, e.g. ["!deadbeef"].
    #[serde(default)]
    pub blocklist: Vec<String>,
}

impl ModerationConfig {
    /// Parsed blocklist. Entries that are not node ids are skipped with a warning.
    pub fn blocked_ids(&self) -> HashSet<u32> {
        let mut ids = HashSet::new();
        for entry in &self.blocklist {
            match meshtastic::parse_node_id(entry) {
                Some(id) => {
                    ids.insert(id);
                }
                None => warn!("Invalid node id '{}' in blocklist, ignoring", entry),
            }
        }
        ids
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_window")]
    pub window_secs: u64,
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,
}

fn default_dedup_window() -> u64 {
    meshtastic::dedup::DEFAULT_WINDOW.as_secs()
}

fn default_dedup_capacity() -> usize {
    meshtastic::dedup::DEFAULT_CAPACITY
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: default_dedup_window(),
            capacity: default_dedup_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "data/nodes.sqlite".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path; an empty string disables file logging.
    #[serde(default = "default_log_file", skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Interval for the periodic traffic summary (0 disables it).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> Option<String> {
    Some("meshgate.log".to_string())
}

fn default_stats_interval() -> u64 {
    300
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

/// Validated, immutable gateway settings.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub channel: Channel,
    pub gateway_id: u32,
    pub blocklist: HashSet<u32>,
    pub relay_mesh_to_sink: bool,
    pub relay_sink_to_mesh: bool,
    pub welcome_enabled: bool,
    pub welcome_message: String,
    pub max_payload_bytes: usize,
    pub fragment_gap: Duration,
    pub hop_limit: u32,
    pub dedup_window: Duration,
    pub dedup_capacity: usize,
    pub stats_interval: Option<Duration>,
}

impl GatewaySettings {
    /// Text form of the gateway id as carried in `ServiceEnvelope.gateway_id`.
    pub fn gateway_id_text(&self) -> String {
        meshtastic::fmt_node_id(self.gateway_id)
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Write a default configuration file
    pub async fn create_default(path: &str) -> Result<(), ConfigError> {
        Config::default().save(path).await
    }

    pub async fn save(&self, path: &str) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)
            .await
            .map_err(|source| ConfigError::Write {
                path: path.to_string(),
                source,
            })
    }

    /// Validate and freeze the settings the gateway runs with.
    pub fn gateway_settings(&self) -> Result<GatewaySettings, ConfigError> {
        let m = &self.meshtastic;
        let channel = Channel::new(&m.channel_name, &m.channel_key, &m.root_topic)?;
        let gateway_id = meshtastic::parse_node_id(&m.gateway_id)
            .filter(|id| *id != 0 && *id != meshtastic::BROADCAST_ADDR)
            .ok_or_else(|| ConfigError::InvalidNodeId(m.gateway_id.clone()))?;
        // the smallest multi-part fragment needs "(1/2) " plus a 4-byte character
        if m.max_payload_bytes < 10 {
            return Err(ConfigError::Invalid(format!(
                "meshtastic.max_payload_bytes must be at least 10, got {}",
                m.max_payload_bytes
            )));
        }
        if self.welcome.enabled && self.welcome.message.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "welcome.enabled is set but welcome.message is empty".into(),
            ));
        }
        Ok(GatewaySettings {
            channel,
            gateway_id,
            blocklist: self.moderation.blocked_ids(),
            relay_mesh_to_sink: self.relay.mesh_to_sink,
            relay_sink_to_mesh: self.relay.sink_to_mesh,
            welcome_enabled: self.welcome.enabled,
            welcome_message: self.welcome.message.clone(),
            max_payload_bytes: m.max_payload_bytes,
            fragment_gap: Duration::from_millis(m.fragment_gap_ms),
            hop_limit: m.hop_limit,
            dedup_window: Duration::from_secs(self.dedup.window_secs),
            dedup_capacity: self.dedup.capacity,
            stats_interval: match self.logging.stats_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mqtt: MqttConfig {
                host: "mqtt.meshtastic.org".to_string(),
                port: 1883,
                username: Some("meshdev".to_string()),
                password: Some("large4cats".to_string()),
                client_id: None,
                keep_alive_secs: default_keep_alive(),
                reconnect_max_backoff_secs: default_max_backoff(),
            },
            meshtastic: MeshtasticConfig {
                gateway_id: "!00000000".to_string(), // placeholder; run `meshgate generate-id`
                channel_name: "LongFast".to_string(),
                channel_key: "AQ==".to_string(),
                root_topic: "msh/US".to_string(),
                max_payload_bytes: default_max_payload(),
                fragment_gap_ms: default_fragment_gap(),
                hop_limit: default_hop_limit(),
            },
            relay: RelayConfig::default(),
            welcome: WelcomeConfig {
                enabled: false,
                message: "Welcome to the mesh! This channel is bridged by a gateway.".to_string(),
            },
            moderation: ModerationConfig::default(),
            dedup: DedupConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut cfg = Config::default();
        cfg.meshtastic.gateway_id = "!abcd1234".to_string();
        cfg
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = Config::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.meshtastic.channel_name, "LongFast");
        assert_eq!(back.meshtastic.max_payload_bytes, 220);
        assert_eq!(back.dedup.capacity, 100);
        assert!(back.relay.mesh_to_sink);
    }

    #[test]
    fn minimal_file_fills_defaults() {
        let text = r#"
            [mqtt]
            host = "localhost"
            port = 1883

            [meshtastic]
            gateway_id = "!abcd1234"
            channel_name = "LongFast"
            channel_key = "AQ=="
            root_topic = "msh/test"

            [moderation]
            blocklist = ["!deadbeef", "nonsense", "0x00000042"]
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.mqtt.keep_alive_secs, 30);
        assert_eq!(cfg.meshtastic.fragment_gap_ms, 1000);
        assert!(!cfg.welcome.enabled);
        let settings = cfg.gateway_settings().unwrap();
        assert_eq!(settings.gateway_id, 0xabcd1234);
        assert_eq!(settings.gateway_id_text(), "!abcd1234");
        assert_eq!(settings.blocklist.len(), 2);
        assert!(settings.blocklist.contains(&0xdeadbeef));
        assert!(settings.blocklist.contains(&0x42));
        assert_eq!(settings.stats_interval, Some(Duration::from_secs(300)));
    }

    #[test]
    fn logging_section_defaults_match_default_config() {
        let partial: LoggingConfig = toml::from_str("level = \"debug\"").unwrap();
        assert_eq!(partial.file, LoggingConfig::default().file);
        assert_eq!(partial.stats_interval_secs, 300);
        let off: LoggingConfig = toml::from_str("file = \"\"").unwrap();
        assert_eq!(off.file.as_deref(), Some(""));
    }

    #[test]
    fn bad_channel_key_is_fatal() {
        let mut cfg = valid();
        cfg.meshtastic.channel_key = "AAAAAAAAAAA=".to_string(); // 8 bytes
        assert!(matches!(
            cfg.gateway_settings(),
            Err(ConfigError::InvalidKeyLength(8))
        ));
        cfg.meshtastic.channel_key = "%%%".to_string();
        assert!(matches!(
            cfg.gateway_settings(),
            Err(ConfigError::InvalidKeyEncoding(_))
        ));
    }

    #[test]
    fn placeholder_gateway_id_is_rejected() {
        let cfg = Config::default();
        assert!(matches!(
            cfg.gateway_settings(),
            Err(ConfigError::InvalidNodeId(_))
        ));
        let mut cfg = valid();
        cfg.meshtastic.gateway_id = "!ffffffff".to_string();
        assert!(cfg.gateway_settings().is_err());
    }

    #[test]
    fn welcome_requires_text() {
        let mut cfg = valid();
        cfg.welcome.enabled = true;
        cfg.welcome.message = "  ".to_string();
        assert!(matches!(cfg.gateway_settings(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn tiny_payload_limit_is_rejected() {
        let mut cfg = valid();
        cfg.meshtastic.max_payload_bytes = 6;
        assert!(matches!(cfg.gateway_settings(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn client_id_falls_back_to_random() {
        let mut cfg = valid();
        assert!(cfg.mqtt.effective_client_id().starts_with("meshgate-"));
        cfg.mqtt.client_id = Some("bridge-1".to_string());
        assert_eq!(cfg.mqtt.effective_client_id(), "bridge-1");
    }

    #[tokio::test]
    async fn save_and_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        let cfg = valid();
        cfg.save(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.meshtastic.gateway_id, "!abcd1234");
        assert!(matches!(
            Config::load("/nonexistent/meshgate.toml").await,
            Err(ConfigError::Read { .. })
        ));
    }
}
