//! # Meshtastic Protocol Module
//!
//! Everything needed to speak the Meshtastic encrypted-channel protocol over MQTT,
//! independent of any particular transport or sink:
//!
//! - [`crypto`] - AES-CTR payload encryption with per-packet counter blocks
//! - [`envelope`] - `ServiceEnvelope` / `MeshPacket` / `Data` codec
//! - [`dedup`] - duplicate packet suppression
//! - [`chunker`] - splitting outbound text into numbered fragments
//! - [`topic`] - MQTT topic layout
//! - [`channel`] - channel name, expanded key and hash
//!
//! ## Node identifiers
//!
//! Node ids are plain `u32` values. Their text form is `!` followed by eight lowercase
//! hex digits, e.g. `!7f4dbc79`; [`BROADCAST_ADDR`] addresses every node.
//!
//! ```rust
//! use meshgate::meshtastic::{fmt_node_id, parse_node_id};
//!
//! assert_eq!(fmt_node_id(0x7f4dbc79), "!7f4dbc79");
//! assert_eq!(parse_node_id("!7f4dbc79"), Some(0x7f4dbc79));
//! ```

pub mod channel;
pub mod chunker;
pub mod crypto;
pub mod dedup;
pub mod envelope;
pub mod topic;

pub use channel::Channel;
pub use chunker::ChunkError;
pub use crypto::{CryptoError, Nonce};
pub use dedup::DedupCache;
pub use envelope::{AppData, Envelope, Packet, PacketPayload, ProtocolParseError};

pub use crate::protobuf::meshtastic_generated::PortNum;

/// Destination address reaching every node on the channel.
pub const BROADCAST_ADDR: u32 = 0xffff_ffff;

/// Default hop limit for packets we originate.
pub const DEFAULT_HOP_LIMIT: u32 = 5;

/// Maximum application payload carried by one packet.
pub const MAX_PAYLOAD_BYTES: usize = 220;

pub fn fmt_node_id(id: u32) -> String {
    format!("!{:08x}", id)
}

/// Parse `!7f4dbc79`, `0x7f4dbc79` or bare hex into a node id.
pub fn parse_node_id(s: &str) -> Option<u32> {
    let s = s.trim();
    let hex = s
        .strip_prefix('!')
        .or_else(|| s.strip_prefix("0x"))
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if hex.is_empty() || hex.len() > 8 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

/// Random non-zero packet id. Zero means "no id" to the firmware.
pub fn new_packet_id() -> u32 {
    loop {
        let id: u32 = rand::random();
        if id != 0 {
            return id;
        }
    }
}
