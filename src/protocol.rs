//! Socket frames exchanged between chat clients and the hub.
//!
//! Every frame is a JSON object tagged by `event`. Client frames may carry an
//! `ack` number; the server answers those with an `ack` frame using the same
//! number.

use crate::chat::{Message, MessageKind, RoomView};
use crate::entity::Identity;
use crate::error::ChatError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Bind this connection to an identity.
    Register {
        identity: Identity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Find or create the room with `peer_id`, then join it.
    OpenRoom { peer_id: String },
    JoinRoom { room_id: String },
    LeaveRoom { room_id: String },
    SendMessage {
        room_id: String,
        body: String,
        #[serde(default)]
        kind: MessageKind,
        /// Temporary key of the optimistic copy, echoed back on the broadcast.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
    },
    MarkSeen { room_id: String },
    Typing { room_id: String },
    StopTyping { room_id: String },
}

impl ClientEvent {
    /// Typing signals are best effort; their failures are never reported.
    pub fn is_best_effort(&self) -> bool {
        matches!(self, ClientEvent::Typing { .. } | ClientEvent::StopTyping { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
    #[serde(flatten)]
    pub event: ClientEvent,
}

impl ClientFrame {
    pub fn new(event: ClientEvent) -> Self {
        Self { ack: None, event }
    }

    pub fn with_ack(ack: u64, event: ClientEvent) -> Self {
        Self {
            ack: Some(ack),
            event,
        }
    }
}

/// Payload of a successful acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AckData {
    Done,
    Registered { identity: Identity },
    Room(RoomView),
    Message(Message),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckError {
    pub code: String,
    pub message: String,
}

impl From<&ChatError> for AckError {
    fn from(e: &ChatError) -> Self {
        AckError {
            code: e.code().into(),
            message: e.client_message(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full persisted message, delivered to every connection joined to its room.
    ReceiveMessage {
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
    },
    /// Lightweight ping for a participant who is not viewing the room.
    NewMessageNotification {
        room_id: String,
        sender_id: String,
        sender_name: String,
        preview: String,
        timestamp: DateTime<Utc>,
        unread: i64,
    },
    MessagesSeen { room_id: String, identity: String },
    Typing { room_id: String, identity: String },
    StopTyping { room_id: String, identity: String },
    PresenceChanged { identity: String, online: bool },
    Ack {
        ack: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<AckData>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<AckError>,
    },
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ReceiveMessage { .. } => "receive_message",
            ServerEvent::NewMessageNotification { .. } => "new_message_notification",
            ServerEvent::MessagesSeen { .. } => "messages_seen",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::StopTyping { .. } => "stop_typing",
            ServerEvent::PresenceChanged { .. } => "presence_changed",
            ServerEvent::Ack { .. } => "ack",
            ServerEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Role;
    use serde_json::json;

    #[test]
    fn client_frame_reads_flat_json() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "event": "send_message",
            "ack": 7,
            "room_id": "r1",
            "body": "Is breakfast included?",
            "client_ref": "tmp-1"
        }))
        .unwrap();

        assert_eq!(frame.ack, Some(7));
        assert_eq!(
            frame.event,
            ClientEvent::SendMessage {
                room_id: "r1".into(),
                body: "Is breakfast included?".into(),
                kind: MessageKind::Text,
                client_ref: Some("tmp-1".into()),
            }
        );
    }

    #[test]
    fn register_frame_shape() {
        let frame = ClientFrame::new(ClientEvent::Register {
            identity: Identity::new("v1", "Reef Divers", Role::Vendor),
            token: None,
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["event"], "register");
        assert_eq!(value["identity"]["role"], "vendor");
        assert!(value.get("ack").is_none());
    }

    #[test]
    fn unknown_event_is_rejected() {
        let result = serde_json::from_str::<ClientFrame>(r#"{"event":"delete_room","room_id":"r1"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn server_event_tags_match_names() {
        let event = ServerEvent::PresenceChanged {
            identity: "u1".into(),
            online: true,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], event.name());
    }
}
