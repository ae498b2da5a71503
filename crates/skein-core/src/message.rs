//! Mesh messages and their payloads.
//!
//! A [`Message`] is the unit of multi-hop exchange: originated once,
//! forwarded with a strictly decreasing TTL, deduplicated by id. The
//! payload is a type-dependent JSON value; the four types the core handles
//! (`data`, `peerAnnounce`, `ping`, `pong`) have typed payload structs,
//! every reserved type rides through as opaque JSON so forwarding keeps it
//! byte-equivalent.

use crate::peer::{now_ms, Peer};
use crate::MAX_MESH_TTL;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Wire-stable message type tags (lowerCamelCase on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    /// Application payload
    Data,
    /// Peer table announcement
    PeerAnnounce,
    /// Reserved: incremental peer sync
    PeerSync,
    /// Reserved: on-demand route discovery
    RouteRequest,
    /// Reserved: route discovery response
    RouteResponse,
    /// Reserved: end-to-end acknowledgement
    Ack,
    /// Reserved: file availability announcement
    FileAnnounce,
    /// File chunk carrying base-64 bytes
    FileChunk,
    /// Reserved: chunk acknowledgement
    FileChunkAck,
    /// End of a file transfer
    FileComplete,
    /// Liveness probe
    Ping,
    /// Liveness reply
    Pong,
    /// Any tag this build does not know
    #[serde(other)]
    Unknown,
}

/// A mesh message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Origination-unique id; the dedup key, never rewritten on forward
    pub id: String,

    /// Message type tag
    #[serde(rename = "type")]
    pub message_type: MessageType,

    /// Originating peer id, set once
    pub source_id: String,

    /// Originator display name
    pub source_username: String,

    /// Destination peer ids; empty means broadcast
    #[serde(default)]
    pub target_ids: Vec<String>,

    /// Remaining hop budget
    pub ttl: u32,

    /// Origination time, epoch milliseconds
    pub created_at: u64,

    /// Type-dependent payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Message {
    fn build(
        message_type: MessageType,
        source_id: &str,
        source_username: &str,
        target_ids: Vec<String>,
        ttl: u32,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            source_id: source_id.to_string(),
            source_username: source_username.to_string(),
            target_ids,
            ttl: ttl.min(MAX_MESH_TTL),
            created_at: now_ms(),
            payload,
        }
    }

    /// Originate a `data` message. Empty `target_ids` broadcasts.
    pub fn data(
        source_id: &str,
        source_username: &str,
        target_ids: Vec<String>,
        payload: &DataPayload,
        ttl: u32,
    ) -> Self {
        Self::build(
            MessageType::Data,
            source_id,
            source_username,
            target_ids,
            ttl,
            serde_json::to_value(payload).ok(),
        )
    }

    /// Originate a broadcast `peerAnnounce`.
    pub fn announce(
        source_id: &str,
        source_username: &str,
        payload: &PeerAnnounce,
        ttl: u32,
    ) -> Self {
        Self::build(
            MessageType::PeerAnnounce,
            source_id,
            source_username,
            Vec::new(),
            ttl,
            serde_json::to_value(payload).ok(),
        )
    }

    /// Originate a `ping` aimed at one peer.
    pub fn ping(source_id: &str, source_username: &str, target_id: &str, ttl: u32) -> Self {
        Self::build(
            MessageType::Ping,
            source_id,
            source_username,
            vec![target_id.to_string()],
            ttl,
            None,
        )
    }

    /// The reply to `ping`, aimed back at its originator.
    pub fn pong(source_id: &str, source_username: &str, ping: &Message, ttl: u32) -> Self {
        Self::build(
            MessageType::Pong,
            source_id,
            source_username,
            vec![ping.source_id.clone()],
            ttl,
            serde_json::to_value(PongPayload {
                ping_id: ping.id.clone(),
            })
            .ok(),
        )
    }

    /// Whether this message goes to every reachable node.
    pub fn is_broadcast(&self) -> bool {
        self.target_ids.is_empty()
    }

    /// The forwarded copy, one hop spent. `None` when the budget is gone:
    /// a message never leaves a forwarder with ttl 0.
    pub fn forwarded(&self) -> Option<Self> {
        if self.ttl <= 1 {
            return None;
        }
        let mut copy = self.clone();
        copy.ttl -= 1;
        Some(copy)
    }

    /// Decode the payload into a typed struct.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let value = self.payload.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value)
    }
}

/// Payload of `data` messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPayload {
    /// Free-form text
    #[serde(default)]
    pub text: String,

    /// Files being announced alongside the text
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileInfo>,

    /// Opaque application mapping
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_data: HashMap<String, serde_json::Value>,
}

impl DataPayload {
    /// Text-only payload.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// File availability announcement. Transfer of chunks happens elsewhere;
/// at this layer a file is only ever described.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// Unique file id
    pub id: String,

    /// File name as shown to users
    pub name: String,

    /// Size in bytes
    pub size: u64,

    /// MIME type
    pub mime_type: String,

    /// Content hash, if the host computed one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    /// Peer hosting the bytes
    pub host_peer_id: String,

    /// Chunk size the host will serve
    pub chunk_size: u32,

    /// Number of chunks at that size
    pub total_chunks: u32,

    /// Opaque metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Payload of `peerAnnounce` messages: the announcer plus its table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAnnounce {
    /// The announcer's self-description, always at hop 0
    pub peer: Peer,

    /// Every peer the announcer knows, with its own local hop counts
    #[serde(default)]
    pub known_peers: Vec<Peer>,
}

/// Payload of `pong` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    /// Id of the `ping` being answered
    pub ping_id: String,
}

/// Payload of `fileChunk` messages. Bytes travel base-64 encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunkPayload {
    /// Which file this chunk belongs to
    pub file_id: String,

    /// Zero-based chunk index
    pub chunk_index: u32,

    /// Total chunks in the file
    pub total_chunks: u32,

    /// Base-64 encoded chunk bytes
    pub data: String,
}

impl FileChunkPayload {
    /// Encode raw chunk bytes into a payload.
    pub fn from_bytes(file_id: &str, chunk_index: u32, total_chunks: u32, bytes: &[u8]) -> Self {
        Self {
            file_id: file_id.to_string(),
            chunk_index,
            total_chunks,
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Decode the base-64 chunk bytes.
    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.data)
    }
}

/// Payload of `fileComplete` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCompletePayload {
    /// Which file finished
    pub file_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags_lower_camel() {
        assert_eq!(
            serde_json::to_string(&MessageType::PeerAnnounce).unwrap(),
            "\"peerAnnounce\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::FileChunkAck).unwrap(),
            "\"fileChunkAck\""
        );
        assert_eq!(serde_json::to_string(&MessageType::Data).unwrap(), "\"data\"");
    }

    #[test]
    fn test_unknown_tag_decodes_to_unknown() {
        let tag: MessageType = serde_json::from_str("\"quantumTunnel\"").unwrap();
        assert_eq!(tag, MessageType::Unknown);
    }

    #[test]
    fn test_data_builder() {
        let msg = Message::data("a", "alice", vec![], &DataPayload::text("hi"), 5);
        assert!(msg.is_broadcast());
        assert_eq!(msg.message_type, MessageType::Data);
        assert_eq!(msg.ttl, 5);
        assert_eq!(msg.source_id, "a");

        let payload: DataPayload = msg.decode_payload().unwrap();
        assert_eq!(payload.text, "hi");
    }

    #[test]
    fn test_ttl_clamped_to_max() {
        let msg = Message::data("a", "alice", vec![], &DataPayload::text("hi"), 200);
        assert_eq!(msg.ttl, MAX_MESH_TTL);
    }

    #[test]
    fn test_forwarded_decrements_ttl() {
        let msg = Message::data("a", "alice", vec![], &DataPayload::text("hi"), 3);
        let hop1 = msg.forwarded().unwrap();
        assert_eq!(hop1.ttl, 2);
        assert_eq!(hop1.id, msg.id);

        let hop2 = hop1.forwarded().unwrap();
        assert_eq!(hop2.ttl, 1);
        assert!(hop2.forwarded().is_none());
    }

    #[test]
    fn test_zero_ttl_never_forwards() {
        let mut msg = Message::data("a", "alice", vec![], &DataPayload::text("hi"), 1);
        assert!(msg.forwarded().is_none());
        msg.ttl = 0;
        assert!(msg.forwarded().is_none());
    }

    #[test]
    fn test_pong_answers_ping() {
        let ping = Message::ping("a", "alice", "c", 3);
        let pong = Message::pong("c", "carol", &ping, 5);

        assert_eq!(pong.message_type, MessageType::Pong);
        assert_eq!(pong.target_ids, vec!["a".to_string()]);
        let payload: PongPayload = pong.decode_payload().unwrap();
        assert_eq!(payload.ping_id, ping.id);
    }

    #[test]
    fn test_message_ids_unique() {
        let a = Message::ping("a", "alice", "b", 3);
        let b = Message::ping("a", "alice", "b", 3);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_file_chunk_base64_roundtrip() {
        let bytes = [0u8, 1, 2, 250, 255];
        let payload = FileChunkPayload::from_bytes("f1", 0, 4, &bytes);
        assert_eq!(payload.bytes().unwrap(), bytes);
    }

    #[test]
    fn test_decode_payload_failure_surfaces() {
        let mut msg = Message::ping("a", "alice", "b", 3);
        msg.payload = Some(serde_json::json!({"pingId": 42}));
        assert!(msg.decode_payload::<PongPayload>().is_err());
    }
}
