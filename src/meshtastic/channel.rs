//! Channel identity: name, expanded PSK and root topic.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::config::ConfigError;

/// Well-known Meshtastic default PSK. Single-byte keys in channel settings are shorthand
/// for this key with the last byte offset by `index - 1`.
pub const DEFAULT_PSK: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59, 0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69, 0x01,
];

/// An encrypted channel. Immutable once built; the key length is validated here so the
/// crypto layer never sees a bad key at runtime.
#[derive(Clone, PartialEq, Eq)]
pub struct Channel {
    name: String,
    key: Vec<u8>,
    root_topic: String,
    hash: u32,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("key_len", &self.key.len())
            .field("root_topic", &self.root_topic)
            .field("hash", &self.hash)
            .finish()
    }
}

impl Channel {
    /// Build a channel from its configured name, base64 key and MQTT root topic.
    pub fn new(name: &str, key_b64: &str, root_topic: &str) -> Result<Self, ConfigError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::Invalid("meshtastic.channel_name is empty".into()));
        }
        // the name is a single topic level
        if name.contains(['/', '+', '#']) {
            return Err(ConfigError::Invalid(format!(
                "meshtastic.channel_name '{}' must not contain '/', '+' or '#'",
                name
            )));
        }
        let raw = BASE64
            .decode(key_b64.trim())
            .map_err(|e| ConfigError::InvalidKeyEncoding(e.to_string()))?;
        let key = expand_psk(&raw)?;
        let root_topic = root_topic.trim().trim_end_matches('/').to_string();
        if root_topic.is_empty() {
            return Err(ConfigError::Invalid("meshtastic.root_topic is empty".into()));
        }
        if root_topic.contains(['+', '#']) || root_topic.split('/').any(str::is_empty) {
            return Err(ConfigError::Invalid(format!(
                "meshtastic.root_topic '{}' must be a plain topic path without wildcards",
                root_topic
            )));
        }
        let hash = channel_hash(name, &key);
        Ok(Channel {
            name: name.to_string(),
            key,
            root_topic,
            hash,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn root_topic(&self) -> &str {
        &self.root_topic
    }

    /// Value carried in `MeshPacket.channel` for packets on this channel.
    pub fn hash(&self) -> u32 {
        self.hash
    }
}

fn expand_psk(raw: &[u8]) -> Result<Vec<u8>, ConfigError> {
    match raw.len() {
        16 | 32 => Ok(raw.to_vec()),
        1 => {
            let index = raw[0];
            if index == 0 {
                return Err(ConfigError::UnencryptedChannel);
            }
            let mut key = DEFAULT_PSK.to_vec();
            key[15] = key[15].wrapping_add(index - 1);
            Ok(key)
        }
        0 => Err(ConfigError::UnencryptedChannel),
        other => Err(ConfigError::InvalidKeyLength(other)),
    }
}

fn xor_hash(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Meshtastic channel hash: XOR of the name bytes XOR XOR of the expanded key bytes.
pub fn channel_hash(name: &str, key: &[u8]) -> u32 {
    (xor_hash(name.as_bytes()) ^ xor_hash(key)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthand_key_expands_to_default_psk() {
        let ch = Channel::new("LongFast", "AQ==", "msh/US").unwrap();
        assert_eq!(ch.key(), &DEFAULT_PSK);
        let ch2 = Channel::new("LongFast", "Ag==", "msh/US").unwrap();
        assert_eq!(ch2.key()[15], 0x02);
        assert_eq!(&ch2.key()[..15], &DEFAULT_PSK[..15]);
    }

    #[test]
    fn full_length_keys_are_kept() {
        let ch = Channel::new("Ops", "1PG7OiApB1nwvP+rz05pAQ==", "msh/EU_868/").unwrap();
        assert_eq!(ch.key(), &DEFAULT_PSK);
        assert_eq!(ch.root_topic(), "msh/EU_868");
        let key32 = BASE64.encode([5u8; 32]);
        assert_eq!(Channel::new("Ops", &key32, "msh").unwrap().key().len(), 32);
    }

    #[test]
    fn invalid_keys_are_config_errors() {
        assert!(matches!(
            Channel::new("LongFast", "not base64!!", "msh/US"),
            Err(ConfigError::InvalidKeyEncoding(_))
        ));
        let key8 = BASE64.encode([1u8; 8]);
        assert!(matches!(
            Channel::new("LongFast", &key8, "msh/US"),
            Err(ConfigError::InvalidKeyLength(8))
        ));
        assert!(matches!(
            Channel::new("LongFast", "AA==", "msh/US"),
            Err(ConfigError::UnencryptedChannel)
        ));
        assert!(matches!(
            Channel::new("LongFast", "", "msh/US"),
            Err(ConfigError::UnencryptedChannel)
        ));
    }

    #[test]
    fn names_that_break_the_topic_layout_are_rejected() {
        for name in ["Long/Fast", "Long#", "+", "a/b/c"] {
            assert!(
                matches!(Channel::new(name, "AQ==", "msh/US"), Err(ConfigError::Invalid(_))),
                "channel name {:?}",
                name
            );
        }
        for root in ["msh/+", "msh/#", "msh//US", "/msh"] {
            assert!(
                matches!(Channel::new("LongFast", "AQ==", root), Err(ConfigError::Invalid(_))),
                "root topic {:?}",
                root
            );
        }
        let ch = Channel::new("Long-Fast_2", "AQ==", "msh/US").unwrap();
        let topic = crate::meshtastic::topic::build_topic(ch.root_topic(), ch.name(), 0x7f4dbc79);
        assert_eq!(
            crate::meshtastic::topic::parse_topic(&topic),
            Some(("Long-Fast_2".to_string(), 0x7f4dbc79))
        );
    }

    #[test]
    fn default_longfast_hash_matches_firmware() {
        // LongFast on the default key hashes to slot 8 on real devices.
        let ch = Channel::new("LongFast", "AQ==", "msh/US").unwrap();
        assert_eq!(ch.hash(), 8);
    }

    #[test]
    fn debug_does_not_leak_key() {
        let ch = Channel::new("LongFast", "AQ==", "msh/US").unwrap();
        let dbg = format!("{:?}", ch);
        assert!(dbg.contains("key_len: 16"));
        assert!(!dbg.contains("212"));
    }
}
