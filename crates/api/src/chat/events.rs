//! Chat wire-format frames
//!
//! Defines the inbound message frame and all server-to-client event types
//! with type-safe serde serialization.

use serde::{Deserialize, Serialize};

use chatrelay_shared::HistoryEntry;

// =============================================================================
// Client-to-Server Frames
// =============================================================================

/// Inbound chat frame.
///
/// Unknown fields are ignored. A missing `message` is treated as the empty
/// string; `timestamp` is client-supplied and echoed back, never validated.
#[derive(Debug, Deserialize)]
pub struct ChatFrame {
    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub timestamp: Option<String>,
}

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Events sent from server to client
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full history backlog, sent once immediately after a successful join
    ChatHistory { history: Vec<HistoryEntry> },

    /// One delivered message (live or drained from the offline queue)
    ChatMessage {
        message: String,
        username: String,
        timestamp: String,
    },

    /// A user was added to the room's membership
    UserJoined { username: String, room: String },

    /// A user was removed from the room's membership
    UserLeft { username: String, room: String },

    /// Error message
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_frame_defaults() {
        // Missing message defaults to empty, unknown fields are ignored
        let frame: ChatFrame = serde_json::from_str(r#"{"extra": 1}"#).unwrap();
        assert_eq!(frame.message, "");
        assert!(frame.timestamp.is_none());

        let frame: ChatFrame =
            serde_json::from_str(r#"{"message":"hi","timestamp":"2025-01-01T00:00:00Z"}"#).unwrap();
        assert_eq!(frame.message, "hi");
        assert_eq!(frame.timestamp.as_deref(), Some("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn test_chat_message_serialization() {
        let event = ServerEvent::ChatMessage {
            message: "hello".to_string(),
            username: "alice".to_string(),
            timestamp: "T".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"chat_message","message":"hello","username":"alice","timestamp":"T"}"#
        );
    }

    #[test]
    fn test_chat_history_serialization() {
        let event = ServerEvent::ChatHistory {
            history: vec![HistoryEntry {
                message: "hello".to_string(),
                username: "alice".to_string(),
                timestamp: "T".to_string(),
            }],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.starts_with(r#"{"type":"chat_history","history":["#));
        assert!(json.contains(r#""username":"alice""#));
    }

    #[test]
    fn test_presence_event_serialization() {
        let event = ServerEvent::UserJoined {
            username: "bob".to_string(),
            room: "lobby".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"user_joined","username":"bob","room":"lobby"}"#
        );
    }

    #[test]
    fn test_error_event_serialization() {
        let event = ServerEvent::Error {
            message: "Room does not exist".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"error","message":"Room does not exist"}"#
        );
    }
}
