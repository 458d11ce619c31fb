use log::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Envelope version understood by this build. Envelopes carrying any other
/// version are ignored on receipt.
pub const PROTOCOL_VERSION: u64 = 1;

/// Identifies one server process within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport-neutral form of one event as it travels between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
}

/// `{ "v": 1, "m": { ... }, "n": "<node id>" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "v")]
    pub protocol_version: u64,
    #[serde(rename = "m")]
    pub message: WireMessage,
    #[serde(rename = "n")]
    pub origin_node_id: String,
}

/// Builds outgoing envelopes and filters incoming ones for a single node.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    node_id: NodeId,
    prefix: String,
}

impl EnvelopeCodec {
    pub fn new(node_id: NodeId, prefix: impl Into<String>) -> Self {
        Self {
            node_id,
            prefix: prefix.into(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Channel name carrying broadcasts for `room`.
    pub fn channel(&self, room: &str) -> String {
        format!("{}{}", self.prefix, room)
    }

    pub fn encode(&self, message: &WireMessage) -> Result<String, serde_json::Error> {
        serde_json::to_string(&Envelope {
            protocol_version: PROTOCOL_VERSION,
            message: message.clone(),
            origin_node_id: self.node_id.as_str().to_string(),
        })
    }

    /// Returns the room and message carried by `payload`, or `None` when the
    /// envelope must be ignored.
    pub fn decode(&self, channel: &str, payload: &str) -> Option<(String, WireMessage)> {
        let room = channel.strip_prefix(self.prefix.as_str())?;

        let envelope: Envelope = match serde_json::from_str(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping malformed envelope on channel {channel}: {e}");
                return None;
            }
        };

        if envelope.protocol_version != PROTOCOL_VERSION {
            debug!(
                "Ignoring envelope with protocol version {} on channel {channel}",
                envelope.protocol_version
            );
            return None;
        }

        if envelope.origin_node_id == self.node_id.as_str() {
            trace!("Ignoring locally originated envelope on channel {channel}");
            return None;
        }

        Some((room.to_string(), envelope.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn codec(node: &str) -> EnvelopeCodec {
        EnvelopeCodec::new(NodeId::from(node), "eventcast:room:")
    }

    fn message() -> WireMessage {
        WireMessage {
            event: Some("chat".to_string()),
            data: json!({"text": "hi"}),
            id: Some("7".to_string()),
            retry: None,
        }
    }

    #[test]
    fn test_encode_uses_short_field_names() {
        let payload = codec("node-a").encode(&message()).unwrap();
        let value: Value = serde_json::from_str(&payload).unwrap();

        assert_eq!(
            value,
            json!({
                "v": 1,
                "m": {"event": "chat", "data": {"text": "hi"}, "id": "7"},
                "n": "node-a"
            })
        );
    }

    #[test]
    fn test_decode_accepts_envelope_from_other_node() {
        let payload = codec("node-a").encode(&message()).unwrap();
        let decoded = codec("node-b").decode("eventcast:room:lobby", &payload);

        assert_eq!(decoded, Some(("lobby".to_string(), message())));
    }

    #[test]
    fn test_decode_ignores_own_origin() {
        let codec = codec("node-a");
        let payload = codec.encode(&message()).unwrap();

        assert_eq!(codec.decode("eventcast:room:lobby", &payload), None);
    }

    #[test]
    fn test_decode_ignores_unknown_protocol_version() {
        let payload = json!({"v": 2, "m": {"data": "x"}, "n": "node-a"}).to_string();

        assert_eq!(codec("node-b").decode("eventcast:room:lobby", &payload), None);
    }

    #[test]
    fn test_decode_drops_malformed_payloads() {
        let codec = codec("node-b");

        assert_eq!(codec.decode("eventcast:room:lobby", "not json"), None);
        assert_eq!(codec.decode("eventcast:room:lobby", "{\"v\":1}"), None);
    }

    #[test]
    fn test_decode_ignores_foreign_channels() {
        let payload = codec("node-a").encode(&message()).unwrap();

        assert_eq!(codec("node-b").decode("other:lobby", &payload), None);
    }

    #[test]
    fn test_bare_string_data_survives_envelope() {
        let wire = WireMessage {
            event: None,
            data: Value::String("plain text".to_string()),
            id: None,
            retry: Some(2000),
        };
        let payload = codec("node-a").encode(&wire).unwrap();

        let (_, decoded) = codec("node-b")
            .decode("eventcast:room:r", &payload)
            .unwrap();
        assert_eq!(decoded, wire);
    }
}
