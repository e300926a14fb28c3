//! MQTT topic layout for encrypted channel traffic.
//!
//! ```text
//! {root}/2/e/{channel}/!{node id as 8 hex digits}
//! ```
//!
//! `2/e` is the protocol-version / encrypted-payload segment used by Meshtastic gateways.
//! Sibling trees such as `2/json/…` or `2/map/…` share the root but are not ours, and the
//! `#` subscription can deliver them, so parsing returns `None` instead of failing.

use super::{fmt_node_id, parse_node_id};

pub const PROTOCOL_SEGMENT: &str = "2/e";

fn trim_root(root: &str) -> &str {
    root.trim_end_matches('/')
}

pub fn build_topic(root: &str, channel: &str, node_id: u32) -> String {
    format!(
        "{}/{}/{}/{}",
        trim_root(root),
        PROTOCOL_SEGMENT,
        channel,
        fmt_node_id(node_id)
    )
}

/// Wildcard subscription covering every node publishing on `channel`.
pub fn subscription_pattern(root: &str, channel: &str) -> String {
    format!("{}/{}/{}/#", trim_root(root), PROTOCOL_SEGMENT, channel)
}

/// Parse a topic into `(channel, node id)`.
pub fn parse_topic(topic: &str) -> Option<(String, u32)> {
    let parts: Vec<&str> = topic.split('/').collect();
    // at least one root segment in front of "2/e/{channel}/{node}"
    if parts.len() < 5 {
        return None;
    }
    let n = parts.len();
    let (version, kind, channel, node) = (parts[n - 4], parts[n - 3], parts[n - 2], parts[n - 1]);
    if format!("{}/{}", version, kind) != PROTOCOL_SEGMENT {
        return None;
    }
    if parts[..n - 4].iter().any(|s| s.is_empty()) || channel.is_empty() {
        return None;
    }
    let node_id = parse_node_id(node).filter(|_| node.starts_with('!'))?;
    Some((channel.to_string(), node_id))
}
