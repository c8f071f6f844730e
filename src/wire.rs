//! On-the-wire message envelope shared by the GBN transport and the
//! distance-vector engine.
//!
//! Every datagram is a single UTF-8 JSON object:
//!
//! ```text
//! {"type": "message" | "ack" | "stats" | "dv",
//!  "payload": <string | object | null>,
//!  "metadata": {"port": <u16>, "packet_num"?: <u32>, "total_message"?: <string>, ...}}
//! ```
//!
//! `Message` is the typed, in-process representation; `encode`/`decode`
//! convert to and from the JSON envelope above. Keeping one module
//! responsible for the wire shape means the transport and routing code never
//! touch `serde_json::Value` directly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{NetCoreError, Result};
use crate::routing::RouteEntry;

/// Maximum datagram size this system supports. Payloads here are tiny
/// (single characters and small routing tables) so this is generous.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// The decoded, typed form of a datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// One character of a GBN transfer.
    Data {
        port: u16,
        packet_num: u32,
        total_message: String,
        payload: char,
    },
    /// Cumulative ACK for `packet_num`.
    Ack {
        port: u16,
        packet_num: u32,
        total_message: String,
    },
    /// End-of-transfer summary sent by the GBN receiver.
    Stats {
        port: u16,
        dropped_packets: u32,
        total_packets: u32,
    },
    /// A full distance-vector broadcast.
    Dv {
        port: u16,
        vector: BTreeMap<u16, RouteEntry>,
    },
}

impl Message {
    /// The sender port carried in every message's metadata.
    pub fn port(&self) -> u16 {
        match self {
            Message::Data { port, .. } => *port,
            Message::Ack { port, .. } => *port,
            Message::Stats { port, .. } => *port,
            Message::Dv { port, .. } => *port,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    payload: serde_json::Value,
    metadata: EnvelopeMetadata,
}

#[derive(Serialize, Deserialize, Default)]
struct EnvelopeMetadata {
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    packet_num: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_message: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct StatsPayload {
    dropped_packets: u32,
    total_packets: u32,
}

#[derive(Serialize, Deserialize)]
struct DvPayload {
    vector: BTreeMap<u16, RouteEntry>,
}

/// Serialize a `Message` into a UTF-8 JSON datagram.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let envelope = match message {
        Message::Data {
            port,
            packet_num,
            total_message,
            payload,
        } => Envelope {
            kind: "message".into(),
            payload: serde_json::Value::String(payload.to_string()),
            metadata: EnvelopeMetadata {
                port: *port,
                packet_num: Some(*packet_num),
                total_message: Some(total_message.clone()),
            },
        },
        Message::Ack {
            port,
            packet_num,
            total_message,
        } => Envelope {
            kind: "ack".into(),
            payload: serde_json::Value::Null,
            metadata: EnvelopeMetadata {
                port: *port,
                packet_num: Some(*packet_num),
                total_message: Some(total_message.clone()),
            },
        },
        Message::Stats {
            port,
            dropped_packets,
            total_packets,
        } => Envelope {
            kind: "stats".into(),
            payload: serde_json::to_value(StatsPayload {
                dropped_packets: *dropped_packets,
                total_packets: *total_packets,
            })?,
            metadata: EnvelopeMetadata {
                port: *port,
                ..Default::default()
            },
        },
        Message::Dv { port, vector } => Envelope {
            kind: "dv".into(),
            payload: serde_json::to_value(DvPayload {
                vector: vector.clone(),
            })?,
            metadata: EnvelopeMetadata {
                port: *port,
                ..Default::default()
            },
        },
    };

    Ok(serde_json::to_vec(&envelope)?)
}

/// Parse a raw datagram into a `Message`.
///
/// Malformed JSON or a structurally invalid envelope is reported as
/// [`NetCoreError::Codec`]/[`NetCoreError::Protocol`] so the caller can log
/// and drop it rather than tear down the connection.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    let port = envelope.metadata.port;

    match envelope.kind.as_str() {
        "message" => {
            let payload = envelope
                .payload
                .as_str()
                .and_then(|s| s.chars().next())
                .ok_or_else(|| NetCoreError::Protocol("message payload missing char".into()))?;
            let packet_num = envelope
                .metadata
                .packet_num
                .ok_or_else(|| NetCoreError::Protocol("message missing packet_num".into()))?;
            let total_message = envelope
                .metadata
                .total_message
                .ok_or_else(|| NetCoreError::Protocol("message missing total_message".into()))?;
            Ok(Message::Data {
                port,
                packet_num,
                total_message,
                payload,
            })
        }
        "ack" => {
            let packet_num = envelope
                .metadata
                .packet_num
                .ok_or_else(|| NetCoreError::Protocol("ack missing packet_num".into()))?;
            let total_message = envelope.metadata.total_message.unwrap_or_default();
            Ok(Message::Ack {
                port,
                packet_num,
                total_message,
            })
        }
        "stats" => {
            let payload: StatsPayload = serde_json::from_value(envelope.payload)?;
            Ok(Message::Stats {
                port,
                dropped_packets: payload.dropped_packets,
                total_packets: payload.total_packets,
            })
        }
        "dv" => {
            let payload: DvPayload = serde_json::from_value(envelope.payload)?;
            Ok(Message::Dv {
                port,
                vector: payload.vector,
            })
        }
        other => Err(NetCoreError::Protocol(format!("unknown message type: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_data_message() {
        let msg = Message::Data {
            port: 5000,
            packet_num: 3,
            total_message: "abcd".into(),
            payload: 'd',
        };
        let bytes = encode(&msg).unwrap();
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn round_trips_ack_message() {
        let msg = Message::Ack {
            port: 5001,
            packet_num: 2,
            total_message: "abcd".into(),
        };
        let bytes = encode(&msg).unwrap();
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn round_trips_stats_message() {
        let msg = Message::Stats {
            port: 5001,
            dropped_packets: 1,
            total_packets: 5,
        };
        let bytes = encode(&msg).unwrap();
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn round_trips_dv_message() {
        let mut vector = BTreeMap::new();
        vector.insert(1025, RouteEntry { cost: 0.05, hops: vec![] });
        vector.insert(1027, RouteEntry { cost: 0.09, hops: vec![1025] });
        let msg = Message::Dv { port: 1024, vector };
        let bytes = encode(&msg).unwrap();
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn unknown_type_is_protocol_error() {
        let bytes = br#"{"type":"bogus","payload":null,"metadata":{"port":1}}"#;
        let err = decode(bytes).unwrap_err();
        assert!(matches!(err, NetCoreError::Protocol(_)));
    }

    #[test]
    fn malformed_json_is_codec_error() {
        let err = decode(b"not json").unwrap_err();
        assert!(matches!(err, NetCoreError::Codec(_)));
    }
}
