//! Client-side view of the chat: conversation list, the open room's messages
//! and the optimistic copies waiting for the server.
//!
//! Everything changes through [`ChatState::apply`]; the socket and REST layers
//! only translate what they see into [`ChatAction`]s.

use crate::chat::{self, Message, MessageKind, MessagePage, Room, RoomSummary, RoomView};
use crate::entity::Identity;
use crate::protocol::{AckData, ServerEvent};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

const PREVIEW_LEN: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Shown optimistically, not yet confirmed.
    Pending,
    /// Persisted by the server.
    Sent,
    /// The peer has read it.
    Seen,
    /// Rejected or never left the device.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    /// Durable id, known once the server confirms the message.
    pub id: Option<String>,
    /// Temporary key of a locally sent message.
    pub client_ref: Option<String>,
    pub sender_id: String,
    pub body: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
}

impl ChatEntry {
    fn confirmed(message: &Message, me: &str) -> Self {
        Self {
            id: Some(message.id.clone()),
            client_ref: None,
            sender_id: message.sender_id.clone(),
            body: message.body.clone(),
            kind: message.kind,
            timestamp: message.timestamp,
            status: status_of(message, me),
        }
    }
}

fn status_of(message: &Message, me: &str) -> DeliveryStatus {
    if message.sender_id == me && message.seen {
        DeliveryStatus::Seen
    } else {
        DeliveryStatus::Sent
    }
}

/// One row of the sidebar.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub room_id: String,
    pub peer_id: String,
    pub peer_name: Option<String>,
    pub preview: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub unread: i64,
    pub peer_online: bool,
}

impl Conversation {
    fn from_room(room: &Room, me: &str) -> Self {
        Self {
            room_id: room.id.clone(),
            peer_id: room.peer_of(me).map(|(p, _)| p.to_string()).unwrap_or_default(),
            peer_name: None,
            preview: room.last_message.clone(),
            last_activity: room.last_activity(),
            unread: room.role_of(me).map(|r| room.unread_for(r)).unwrap_or(0),
            peer_online: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenRoom {
    pub room_id: String,
    pub peer_id: String,
    pub messages: Vec<ChatEntry>,
    /// Next history page to request, and whether one exists.
    pub next_page: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone)]
pub enum ChatAction {
    RoomsLoaded(Vec<RoomSummary>),
    HistoryLoaded(MessagePage),
    RoomOpened(RoomView),
    RoomClosed,
    LocalSend {
        client_ref: String,
        body: String,
        kind: MessageKind,
        /// Ack number the send frame went out with.
        ack: Option<u64>,
    },
    /// The send frame for this key never reached the server.
    Undelivered { client_ref: String },
    Server(ServerEvent),
}

pub struct ChatState {
    me: Identity,
    conversations: Vec<Conversation>,
    open: Option<OpenRoom>,
    online: HashMap<String, bool>,
    // room -> typist -> last signal
    typing: HashMap<String, HashMap<String, DateTime<Utc>>>,
    typing_stale_after: Duration,
    // ack number -> client_ref of the send it belongs to
    pending_acks: HashMap<u64, String>,
    last_error: Option<String>,
}

impl ChatState {
    pub fn new(me: Identity) -> Self {
        Self {
            me,
            conversations: Vec::new(),
            open: None,
            online: HashMap::new(),
            typing: HashMap::new(),
            typing_stale_after: Duration::seconds(6),
            pending_acks: HashMap::new(),
            last_error: None,
        }
    }

    /// How long a typing indicator survives without a fresh signal.
    pub fn with_typing_stale_after(mut self, after: Duration) -> Self {
        self.typing_stale_after = after;
        self
    }

    pub fn me(&self) -> &Identity {
        &self.me
    }

    /// Most recently active first.
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, room_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.room_id == room_id)
    }

    pub fn open_room(&self) -> Option<&OpenRoom> {
        self.open.as_ref()
    }

    /// Messages of the open room in display order.
    pub fn messages(&self) -> &[ChatEntry] {
        self.open.as_ref().map(|o| o.messages.as_slice()).unwrap_or(&[])
    }

    pub fn total_unread(&self) -> i64 {
        self.conversations.iter().map(|c| c.unread).sum()
    }

    pub fn is_online(&self, participant_id: &str) -> bool {
        self.online.get(participant_id).copied().unwrap_or(false)
    }

    /// Who is typing in a room right now.
    pub fn typing_in(&self, room_id: &str, now: DateTime<Utc>) -> Vec<&str> {
        let mut typists: Vec<&str> = self
            .typing
            .get(room_id)
            .map(|typists| {
                typists
                    .iter()
                    .filter(|(_, since)| now - **since < self.typing_stale_after)
                    .map(|(id, _)| id.as_str())
                    .collect()
            })
            .unwrap_or_default();
        typists.sort_unstable();
        typists
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Put a failed entry back to pending under a new key and return what to
    /// send again.
    pub fn retry(
        &mut self,
        client_ref: &str,
        new_ref: &str,
        ack: Option<u64>,
    ) -> Option<(String, MessageKind)> {
        let open = self.open.as_mut()?;
        let entry = open.messages.iter_mut().find(|e| {
            e.status == DeliveryStatus::Failed && e.client_ref.as_deref() == Some(client_ref)
        })?;
        entry.client_ref = Some(new_ref.to_string());
        entry.status = DeliveryStatus::Pending;
        entry.timestamp = Utc::now();
        let resend = (entry.body.clone(), entry.kind);
        open.messages.sort_by_key(|e| e.timestamp);
        if let Some(ack) = ack {
            self.pending_acks.insert(ack, new_ref.to_string());
        }
        Some(resend)
    }

    pub fn apply(&mut self, action: ChatAction) {
        self.apply_at(action, Utc::now());
    }

    pub fn apply_at(&mut self, action: ChatAction, now: DateTime<Utc>) {
        match action {
            ChatAction::RoomsLoaded(summaries) => self.rooms_loaded(summaries),
            ChatAction::HistoryLoaded(page) => self.history_loaded(page),
            ChatAction::RoomOpened(view) => self.room_opened(view),
            ChatAction::RoomClosed => self.open = None,
            ChatAction::LocalSend {
                client_ref,
                body,
                kind,
                ack,
            } => self.local_send(client_ref, body, kind, ack, now),
            ChatAction::Undelivered { client_ref } => self.mark_failed(&client_ref),
            ChatAction::Server(event) => self.server_event(event, now),
        }
    }

    fn rooms_loaded(&mut self, summaries: Vec<RoomSummary>) {
        let open_id = self.open.as_ref().map(|o| o.room_id.clone());
        self.conversations = summaries
            .into_iter()
            .map(|summary| {
                self.online.insert(summary.peer_id.clone(), summary.peer_online);
                let mut conversation = Conversation::from_room(&summary.room, &self.me.id);
                conversation.peer_id = summary.peer_id;
                conversation.unread = summary.unread;
                conversation.peer_online = summary.peer_online;
                if open_id.as_deref() == Some(conversation.room_id.as_str()) {
                    conversation.unread = 0;
                }
                conversation
            })
            .collect();
        self.resort_conversations();
    }

    fn history_loaded(&mut self, page: MessagePage) {
        let me = self.me.id.clone();
        let Some(open) = self.open.as_mut().filter(|o| o.room_id == page.room_id) else {
            return;
        };
        for message in &page.messages {
            insert_confirmed(&mut open.messages, message, &me);
        }
        open.next_page = open.next_page.max(page.page + 1);
        open.has_more = page.has_more;
    }

    fn room_opened(&mut self, view: RoomView) {
        let peer_id = view
            .room
            .peer_of(&self.me.id)
            .map(|(p, _)| p.to_string())
            .unwrap_or_default();
        self.online.insert(peer_id.clone(), view.peer_online);

        let already_open = self.open.as_ref().is_some_and(|o| o.room_id == view.room.id);
        if !already_open {
            self.open = Some(OpenRoom {
                room_id: view.room.id.clone(),
                peer_id: peer_id.clone(),
                messages: Vec::new(),
                next_page: 0,
                has_more: true,
            });
        }

        let conversation = self.upsert_conversation(&view.room);
        conversation.unread = 0;
        conversation.peer_online = view.peer_online;
    }

    fn local_send(
        &mut self,
        client_ref: String,
        body: String,
        kind: MessageKind,
        ack: Option<u64>,
        now: DateTime<Utc>,
    ) {
        let Some(open) = self.open.as_mut() else {
            return;
        };
        let room_id = open.room_id.clone();
        place(&mut open.messages, ChatEntry {
            id: None,
            client_ref: Some(client_ref.clone()),
            sender_id: self.me.id.clone(),
            body: body.clone(),
            kind,
            timestamp: now,
            status: DeliveryStatus::Pending,
        });
        if let Some(ack) = ack {
            self.pending_acks.insert(ack, client_ref);
        }
        self.touch(&room_id, chat::preview(&body, kind, PREVIEW_LEN), now);
    }

    fn mark_failed(&mut self, client_ref: &str) {
        if let Some(entry) = self.pending_entry(client_ref) {
            entry.status = DeliveryStatus::Failed;
        }
        self.pending_acks.retain(|_, r| r != client_ref);
    }

    fn server_event(&mut self, event: ServerEvent, now: DateTime<Utc>) {
        match event {
            ServerEvent::ReceiveMessage {
                message,
                client_ref,
            } => self.receive(&message, client_ref.as_deref()),
            ServerEvent::NewMessageNotification {
                room_id,
                sender_id,
                sender_name,
                preview,
                timestamp,
                unread,
            } => {
                let is_open = self.is_open(&room_id);
                let conversation = match self.conversations.iter().position(|c| c.room_id == room_id) {
                    Some(i) => &mut self.conversations[i],
                    None => {
                        self.conversations.push(Conversation {
                            room_id: room_id.clone(),
                            peer_id: sender_id.clone(),
                            peer_name: None,
                            preview: None,
                            last_activity: timestamp,
                            unread: 0,
                            peer_online: self.online.get(&sender_id).copied().unwrap_or(false),
                        });
                        let last = self.conversations.len() - 1;
                        &mut self.conversations[last]
                    }
                };
                if !sender_name.is_empty() {
                    conversation.peer_name = Some(sender_name);
                }
                conversation.preview = Some(preview);
                conversation.last_activity = conversation.last_activity.max(timestamp);
                if !is_open {
                    conversation.unread = if unread > 0 { unread } else { conversation.unread + 1 };
                }
                self.clear_typing(&room_id, &sender_id);
                self.resort_conversations();
            }
            ServerEvent::MessagesSeen { room_id, identity } => {
                if identity == self.me.id {
                    if let Some(conversation) = self.conversation_mut(&room_id) {
                        conversation.unread = 0;
                    }
                } else if let Some(open) = self.open.as_mut().filter(|o| o.room_id == room_id) {
                    for entry in open.messages.iter_mut() {
                        if entry.sender_id == self.me.id && entry.status == DeliveryStatus::Sent {
                            entry.status = DeliveryStatus::Seen;
                        }
                    }
                }
            }
            ServerEvent::Typing { room_id, identity } => {
                if identity != self.me.id {
                    self.typing.entry(room_id).or_default().insert(identity, now);
                }
            }
            ServerEvent::StopTyping { room_id, identity } => self.clear_typing(&room_id, &identity),
            ServerEvent::PresenceChanged { identity, online } => {
                for conversation in self.conversations.iter_mut().filter(|c| c.peer_id == identity) {
                    conversation.peer_online = online;
                }
                self.online.insert(identity, online);
            }
            ServerEvent::Ack {
                ack,
                ok,
                data,
                error,
            } => {
                let Some(client_ref) = self.pending_acks.remove(&ack) else {
                    return;
                };
                if ok {
                    if let Some(AckData::Message(message)) = data {
                        self.receive(&message, Some(&client_ref));
                    }
                } else {
                    if let Some(error) = error {
                        self.last_error = Some(error.message);
                    }
                    if let Some(entry) = self.pending_entry(&client_ref) {
                        entry.status = DeliveryStatus::Failed;
                    }
                }
            }
            ServerEvent::Error { message, .. } => self.last_error = Some(message),
        }
    }

    fn receive(&mut self, message: &Message, client_ref: Option<&str>) {
        let me = self.me.id.clone();
        if let Some(open) = self.open.as_mut().filter(|o| o.room_id == message.room_id) {
            let already_shown = open
                .messages
                .iter()
                .any(|e| e.id.as_deref() == Some(message.id.as_str()));
            let optimistic = client_ref.and_then(|r| {
                open.messages
                    .iter()
                    .position(|e| e.id.is_none() && e.client_ref.as_deref() == Some(r))
            });

            match optimistic {
                Some(index) if !already_shown => {
                    // The local clock may disagree with the server's, so the
                    // confirmed copy moves to where its server time puts it.
                    let mut entry = open.messages.remove(index);
                    entry.id = Some(message.id.clone());
                    entry.body = message.body.clone();
                    entry.timestamp = message.timestamp;
                    entry.status = status_of(message, &me);
                    place(&mut open.messages, entry);
                }
                Some(index) => {
                    // Already shown via history: drop the leftover copy.
                    open.messages.remove(index);
                }
                None if already_shown => {}
                None => insert_confirmed(&mut open.messages, message, &me),
            }
        }

        self.clear_typing(&message.room_id, &message.sender_id);
        let preview = chat::preview(&message.body, message.kind, PREVIEW_LEN);
        if self.conversation(&message.room_id).is_none() && message.sender_id != me {
            self.conversations.push(Conversation {
                room_id: message.room_id.clone(),
                peer_id: message.sender_id.clone(),
                peer_name: None,
                preview: None,
                last_activity: message.timestamp,
                unread: 0,
                peer_online: self.is_online(&message.sender_id),
            });
        }
        self.touch(&message.room_id, preview, message.timestamp);
    }

    fn touch(&mut self, room_id: &str, preview: String, at: DateTime<Utc>) {
        if let Some(conversation) = self.conversation_mut(room_id) {
            conversation.preview = Some(preview);
            conversation.last_activity = conversation.last_activity.max(at);
        }
        self.resort_conversations();
    }

    fn upsert_conversation(&mut self, room: &Room) -> &mut Conversation {
        let index = match self.conversations.iter().position(|c| c.room_id == room.id) {
            Some(index) => index,
            None => {
                self.conversations.push(Conversation::from_room(room, &self.me.id));
                self.resort_conversations();
                self.conversations
                    .iter()
                    .position(|c| c.room_id == room.id)
                    .unwrap_or(0)
            }
        };
        &mut self.conversations[index]
    }

    fn pending_entry(&mut self, client_ref: &str) -> Option<&mut ChatEntry> {
        self.open.as_mut()?.messages.iter_mut().find(|e| {
            e.id.is_none() && e.client_ref.as_deref() == Some(client_ref)
        })
    }

    fn conversation_mut(&mut self, room_id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.room_id == room_id)
    }

    fn is_open(&self, room_id: &str) -> bool {
        self.open.as_ref().is_some_and(|o| o.room_id == room_id)
    }

    fn clear_typing(&mut self, room_id: &str, identity: &str) {
        if let Some(typists) = self.typing.get_mut(room_id) {
            typists.remove(identity);
            if typists.is_empty() {
                self.typing.remove(room_id);
            }
        }
    }

    fn resort_conversations(&mut self) {
        self.conversations
            .sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    }
}

/// Insert a server message at its timestamp position, unless already shown.
fn insert_confirmed(messages: &mut Vec<ChatEntry>, message: &Message, me: &str) {
    if messages
        .iter()
        .any(|e| e.id.as_deref() == Some(message.id.as_str()))
    {
        return;
    }
    place(messages, ChatEntry::confirmed(message, me));
}

/// Insert after every entry with the same or an earlier timestamp, so the
/// list stays sorted and ties keep arrival order.
fn place(messages: &mut Vec<ChatEntry>, entry: ChatEntry) {
    let at = messages.partition_point(|e| e.timestamp <= entry.timestamp);
    messages.insert(at, entry);
}
