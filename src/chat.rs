use crate::entity::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
        }
    }
}

impl FromStr for MessageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            other => anyhow::bail!("unknown message kind: {}", other),
        }
    }
}

/// A persisted chat message. `id` is assigned by the store, never by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub sender_role: Role,
    pub body: String,
    #[serde(default)]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub seen: bool,
}

/// A message that has been accepted by the relay but not yet written.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: String,
    pub sender_id: String,
    pub sender_role: Role,
    pub body: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
}

/// The conversation between exactly one user and one vendor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub user_id: String,
    pub vendor_id: String,
    pub created_at: DateTime<Utc>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub user_unread: i64,
    pub vendor_unread: i64,
}

impl Room {
    pub fn participant_id(&self, role: Role) -> &str {
        match role {
            Role::User => &self.user_id,
            Role::Vendor => &self.vendor_id,
        }
    }

    pub fn role_of(&self, participant_id: &str) -> Option<Role> {
        if self.user_id == participant_id {
            Some(Role::User)
        } else if self.vendor_id == participant_id {
            Some(Role::Vendor)
        } else {
            None
        }
    }

    /// The other participant, if `participant_id` is one of the two.
    pub fn peer_of(&self, participant_id: &str) -> Option<(&str, Role)> {
        self.role_of(participant_id).map(|role| {
            let peer_role = role.counterpart();
            (self.participant_id(peer_role), peer_role)
        })
    }

    pub fn unread_for(&self, role: Role) -> i64 {
        match role {
            Role::User => self.user_unread,
            Role::Vendor => self.vendor_unread,
        }
    }

    /// Sort key for conversation lists: last activity, or creation for empty rooms.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(self.created_at)
    }
}

/// Room plus whether the other side currently has a live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomView {
    pub room: Room,
    pub peer_online: bool,
}

/// Sidebar entry for one participant's conversation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room: Room,
    pub peer_id: String,
    pub unread: i64,
    pub peer_online: bool,
}

/// One page of history. Page 0 holds the newest messages; each page is newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    pub room_id: String,
    pub page: u32,
    pub page_size: u32,
    pub has_more: bool,
    pub messages: Vec<Message>,
}

/// Short text used for last-message columns and notifications.
pub fn preview(body: &str, kind: MessageKind, max_chars: usize) -> String {
    match kind {
        MessageKind::Image => return "[image]".to_string(),
        MessageKind::File => return "[file]".to_string(),
        MessageKind::Text => {}
    }

    let flat: String = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
