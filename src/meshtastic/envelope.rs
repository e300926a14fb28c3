//! Envelope codec: `ServiceEnvelope` → `MeshPacket` → `Data`.
//!
//! The MQTT payload is a protobuf `ServiceEnvelope` wrapping one `MeshPacket`. The
//! packet's payload is either the encrypted bytes of a `Data` message or, for
//! unencrypted uplinks, the decoded `Data` itself. Decoding here never decrypts; the
//! gateway hands the opaque bytes to [`crate::meshtastic::crypto`] and then back to
//! [`decode_data`].
//!
//! All decoders are total: any input either parses into a domain value or yields a
//! [`ProtocolParseError`]. The MQTT topic is a shared medium and carries plenty of
//! traffic we did not produce.

use prost::Message;
use thiserror::Error;

use crate::protobuf::meshtastic_generated as proto;
use proto::mesh_packet::PayloadVariant;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolParseError {
    #[error("malformed {layer}: {reason}")]
    Malformed { layer: &'static str, reason: String },
    #[error("envelope carries no packet")]
    MissingPacket,
    #[error("packet carries no payload")]
    MissingPayload,
    #[error("text payload is not valid UTF-8")]
    InvalidText,
}

fn malformed(layer: &'static str, err: prost::DecodeError) -> ProtocolParseError {
    ProtocolParseError::Malformed {
        layer,
        reason: err.to_string(),
    }
}

/// Innermost application payload (`Data`).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AppData {
    /// Raw port number; see [`AppData::port`] for the known ones.
    pub portnum: i32,
    pub payload: Vec<u8>,
    pub want_response: bool,
    pub dest: u32,
    pub source: u32,
    pub request_id: u32,
    pub reply_id: u32,
    pub emoji: u32,
    pub bitfield: Option<u32>,
}

impl AppData {
    pub fn text(port: proto::PortNum, text: &str) -> Self {
        AppData {
            portnum: port as i32,
            payload: text.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    pub fn port(&self) -> Option<proto::PortNum> {
        proto::PortNum::try_from(self.portnum).ok()
    }

    /// Payload as UTF-8 text.
    pub fn as_text(&self) -> Result<&str, ProtocolParseError> {
        std::str::from_utf8(&self.payload).map_err(|_| ProtocolParseError::InvalidText)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PacketPayload {
    Encrypted(Vec<u8>),
    Decoded(AppData),
}

/// One mesh packet. `(id, from)` identifies it for duplicate suppression.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub id: u32,
    pub from: u32,
    pub to: u32,
    /// Channel hash (not an index) when seen on MQTT.
    pub channel: u32,
    pub hop_limit: u32,
    pub hop_start: u32,
    pub want_ack: bool,
    pub via_mqtt: bool,
    pub priority: i32,
    pub rx_time: u32,
    pub rx_snr: f32,
    pub rx_rssi: i32,
    pub payload: PacketPayload,
}

impl Packet {
    pub fn new(id: u32, from: u32, to: u32, payload: PacketPayload) -> Self {
        Packet {
            id,
            from,
            to,
            channel: 0,
            hop_limit: 0,
            hop_start: 0,
            want_ack: false,
            via_mqtt: false,
            priority: 0,
            rx_time: 0,
            rx_snr: 0.0,
            rx_rssi: 0,
            payload,
        }
    }
}

/// The unit published on MQTT.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub packet: Packet,
    pub channel_id: String,
    pub gateway_id: String,
}

impl From<proto::Data> for AppData {
    fn from(d: proto::Data) -> Self {
        AppData {
            portnum: d.portnum,
            payload: d.payload,
            want_response: d.want_response,
            dest: d.dest,
            source: d.source,
            request_id: d.request_id,
            reply_id: d.reply_id,
            emoji: d.emoji,
            bitfield: d.bitfield,
        }
    }
}

impl From<&AppData> for proto::Data {
    fn from(d: &AppData) -> Self {
        proto::Data {
            portnum: d.portnum,
            payload: d.payload.clone(),
            want_response: d.want_response,
            dest: d.dest,
            source: d.source,
            request_id: d.request_id,
            reply_id: d.reply_id,
            emoji: d.emoji,
            bitfield: d.bitfield,
        }
    }
}

impl TryFrom<proto::MeshPacket> for Packet {
    type Error = ProtocolParseError;

    fn try_from(p: proto::MeshPacket) -> Result<Self, Self::Error> {
        let payload = match p.payload_variant {
            Some(PayloadVariant::Encrypted(bytes)) => PacketPayload::Encrypted(bytes),
            Some(PayloadVariant::Decoded(data)) => PacketPayload::Decoded(data.into()),
            None => return Err(ProtocolParseError::MissingPayload),
        };
        Ok(Packet {
            id: p.id,
            from: p.from,
            to: p.to,
            channel: p.channel,
            hop_limit: p.hop_limit,
            hop_start: p.hop_start,
            want_ack: p.want_ack,
            via_mqtt: p.via_mqtt,
            priority: p.priority,
            rx_time: p.rx_time,
            rx_snr: p.rx_snr,
            rx_rssi: p.rx_rssi,
            payload,
        })
    }
}

impl From<&Packet> for proto::MeshPacket {
    fn from(p: &Packet) -> Self {
        let payload_variant = match &p.payload {
            PacketPayload::Encrypted(bytes) => PayloadVariant::Encrypted(bytes.clone()),
            PacketPayload::Decoded(data) => PayloadVariant::Decoded(data.into()),
        };
        proto::MeshPacket {
            from: p.from,
            to: p.to,
            channel: p.channel,
            payload_variant: Some(payload_variant),
            id: p.id,
            rx_time: p.rx_time,
            rx_snr: p.rx_snr,
            hop_limit: p.hop_limit,
            want_ack: p.want_ack,
            priority: p.priority,
            rx_rssi: p.rx_rssi,
            via_mqtt: p.via_mqtt,
            hop_start: p.hop_start,
        }
    }
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, ProtocolParseError> {
    let env = proto::ServiceEnvelope::decode(bytes).map_err(|e| malformed("envelope", e))?;
    let packet = env.packet.ok_or(ProtocolParseError::MissingPacket)?;
    Ok(Envelope {
        packet: packet.try_into()?,
        channel_id: env.channel_id,
        gateway_id: env.gateway_id,
    })
}

pub fn encode_envelope(env: &Envelope) -> Vec<u8> {
    proto::ServiceEnvelope {
        packet: Some((&env.packet).into()),
        channel_id: env.channel_id.clone(),
        gateway_id: env.gateway_id.clone(),
    }
    .encode_to_vec()
}

pub fn decode_packet(bytes: &[u8]) -> Result<Packet, ProtocolParseError> {
    proto::MeshPacket::decode(bytes)
        .map_err(|e| malformed("packet", e))?
        .try_into()
}

pub fn encode_packet(packet: &Packet) -> Vec<u8> {
    proto::MeshPacket::from(packet).encode_to_vec()
}

pub fn decode_data(bytes: &[u8]) -> Result<AppData, ProtocolParseError> {
    proto::Data::decode(bytes)
        .map(AppData::from)
        .map_err(|e| malformed("data", e))
}

pub fn encode_data(data: &AppData) -> Vec<u8> {
    proto::Data::from(data).encode_to_vec()
}

/// NODEINFO_APP payload.
pub fn decode_user(bytes: &[u8]) -> Result<proto::User, ProtocolParseError> {
    proto::User::decode(bytes).map_err(|e| malformed("user", e))
}

/// POSITION_APP payload.
pub fn decode_position(bytes: &[u8]) -> Result<proto::Position, ProtocolParseError> {
    proto::Position::decode(bytes).map_err(|e| malformed("position", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::PortNum;

    fn sample_envelope(payload: PacketPayload) -> Envelope {
        let mut packet = Packet::new(0xdead_beef, 0x7f4d_bc79, 0xffff_ffff, payload);
        packet.channel = 8;
        packet.hop_limit = 3;
        packet.hop_start = 5;
        packet.want_ack = true;
        packet.via_mqtt = true;
        packet.rx_time = 1_700_000_000;
        packet.rx_snr = 6.25;
        packet.rx_rssi = -91;
        Envelope {
            packet,
            channel_id: "LongFast".into(),
            gateway_id: "!7f4dbc79".into(),
        }
    }

    #[test]
    fn envelope_round_trips_with_encrypted_payload() {
        let env = sample_envelope(PacketPayload::Encrypted(vec![1, 2, 3, 250, 0]));
        let bytes = encode_envelope(&env);
        assert_eq!(decode_envelope(&bytes).unwrap(), env);
    }

    #[test]
    fn envelope_round_trips_with_decoded_payload() {
        let mut data = AppData::text(PortNum::TextMessageApp, "hello");
        data.bitfield = Some(1);
        data.reply_id = 77;
        let env = sample_envelope(PacketPayload::Decoded(data));
        assert_eq!(decode_envelope(&encode_envelope(&env)).unwrap(), env);
    }

    #[test]
    fn packet_and_data_layers_round_trip() {
        let data = AppData {
            portnum: 9999, // unknown ports survive as raw numbers
            payload: vec![0xff; 40],
            want_response: true,
            emoji: 1,
            ..Default::default()
        };
        assert_eq!(decode_data(&encode_data(&data)).unwrap(), data);
        assert_eq!(data.port(), None);

        let packet = Packet::new(1, 2, 3, PacketPayload::Decoded(data));
        assert_eq!(decode_packet(&encode_packet(&packet)).unwrap(), packet);
    }

    #[test]
    fn envelope_without_packet_is_rejected() {
        let bytes = proto::ServiceEnvelope {
            packet: None,
            channel_id: "LongFast".into(),
            gateway_id: "!00000001".into(),
        }
        .encode_to_vec();
        assert_eq!(decode_envelope(&bytes), Err(ProtocolParseError::MissingPacket));
    }

    #[test]
    fn packet_without_payload_is_rejected() {
        let bytes = proto::MeshPacket {
            id: 5,
            from: 6,
            ..Default::default()
        }
        .encode_to_vec();
        assert_eq!(decode_packet(&bytes), Err(ProtocolParseError::MissingPayload));
    }

    #[test]
    fn garbage_never_panics() {
        let inputs: Vec<Vec<u8>> = vec![
            b"garbage".to_vec(),
            vec![0xff; 64],
            vec![0x0a, 0xff, 0xff, 0xff, 0xff, 0x0f],
            vec![0x0a],
            (0u8..=255).collect(),
        ];
        for input in inputs {
            assert!(decode_envelope(&input).is_err());
            let _ = decode_packet(&input);
            let _ = decode_data(&input);
            let _ = decode_user(&input);
        }
    }

    #[test]
    fn truncated_envelope_is_malformed() {
        let env = sample_envelope(PacketPayload::Encrypted(vec![9; 32]));
        let bytes = encode_envelope(&env);
        let err = decode_envelope(&bytes[..bytes.len() - 4]).unwrap_err();
        assert!(matches!(err, ProtocolParseError::Malformed { layer: "envelope", .. }));
    }

    #[test]
    fn text_helper_checks_utf8() {
        let ok = AppData::text(PortNum::TextMessageApp, "grüße");
        assert_eq!(ok.as_text().unwrap(), "grüße");
        assert_eq!(ok.port(), Some(PortNum::TextMessageApp));
        let bad = AppData {
            payload: vec![0xc3, 0x28],
            ..Default::default()
        };
        assert_eq!(bad.as_text(), Err(ProtocolParseError::InvalidText));
    }
}
