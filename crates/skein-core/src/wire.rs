//! Wire framing: one JSON object per line.
//!
//! Each adapter byte-pipe carries messages as single-line JSON text; the
//! adapter's own framing (newline, MTU chunking, datagram boundary)
//! demarcates messages. Keys are lowerCamelCase and stable across
//! implementations.

use crate::message::Message;
use thiserror::Error;

/// Wire decode failure. Swallowed and logged by the node; a malformed
/// frame never disturbs other peers' flows.
#[derive(Debug, Error)]
pub enum WireError {
    /// Not valid JSON or not a message object
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Frames are single-line; embedded newlines would split them
    #[error("message encodes with embedded newline")]
    EmbeddedNewline,
}

/// Encode a message as one line of JSON (no trailing newline).
pub fn encode_message(message: &Message) -> Result<String, WireError> {
    let line = serde_json::to_string(message)?;
    if line.contains('\n') {
        return Err(WireError::EmbeddedNewline);
    }
    Ok(line)
}

/// Decode one line of JSON into a message.
pub fn decode_message(text: &str) -> Result<Message, WireError> {
    Ok(serde_json::from_str(text.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DataPayload, FileInfo, Message, MessageType};
    use std::collections::HashMap;

    #[test]
    fn test_roundtrip_broadcast_data() {
        let msg = Message::data("a", "alice", vec![], &DataPayload::text("hello mesh"), 5);
        let line = encode_message(&msg).unwrap();
        assert!(!line.contains('\n'));
        let back = decode_message(&line).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_roundtrip_targeted_with_files() {
        let payload = DataPayload {
            text: "take this".to_string(),
            files: vec![FileInfo {
                id: "f1".to_string(),
                name: "notes.txt".to_string(),
                size: 1024,
                mime_type: "text/plain".to_string(),
                sha256: Some("ab".repeat(32)),
                host_peer_id: "a".to_string(),
                chunk_size: 65536,
                total_chunks: 1,
                metadata: HashMap::new(),
            }],
            custom_data: HashMap::from([(
                "k".to_string(),
                serde_json::json!({"nested": [1, 2, 3]}),
            )]),
        };
        let msg = Message::data("a", "alice", vec!["b".to_string()], &payload, 3);
        let back = decode_message(&encode_message(&msg).unwrap()).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.decode_payload::<DataPayload>().unwrap(), payload);
    }

    #[test]
    fn test_wire_keys_lower_camel() {
        let msg = Message::ping("a", "alice", "b", 2);
        let line = encode_message(&msg).unwrap();
        assert!(line.contains("\"sourceId\":\"a\""));
        assert!(line.contains("\"sourceUsername\":\"alice\""));
        assert!(line.contains("\"targetIds\":[\"b\"]"));
        assert!(line.contains("\"createdAt\":"));
        assert!(line.contains("\"type\":\"ping\""));
    }

    #[test]
    fn test_unknown_type_preserves_payload() {
        let line = r#"{"id":"m1","type":"routeRequest","sourceId":"a","sourceUsername":"alice","targetIds":["z"],"ttl":4,"createdAt":17,"payload":{"probe":true}}"#;
        let msg = decode_message(line).unwrap();
        assert_eq!(msg.message_type, MessageType::RouteRequest);
        assert_eq!(msg.payload, Some(serde_json::json!({"probe": true})));

        // Re-encoding keeps the reserved payload intact for forwarding.
        let reencoded = encode_message(&msg).unwrap();
        let again = decode_message(&reencoded).unwrap();
        assert_eq!(again, msg);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decode_message("not json at all").is_err());
        assert!(decode_message("{\"id\":\"x\"}").is_err());
        assert!(decode_message("").is_err());
    }

    #[test]
    fn test_trailing_newline_tolerated() {
        let msg = Message::ping("a", "alice", "b", 2);
        let line = format!("{}\n", encode_message(&msg).unwrap());
        assert_eq!(decode_message(&line).unwrap(), msg);
    }
}
