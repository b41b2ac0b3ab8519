//! Chat client: socket connection, REST calls and the local chat state.

pub mod api;
pub mod connection;
pub mod state;
pub mod typing;

pub use api::ChatApi;
pub use connection::{ChatConnection, ConnectionConfig, ConnectionEvent, ConnectionEvents, ReconnectPolicy};
pub use state::{ChatAction, ChatEntry, ChatState, Conversation, DeliveryStatus};
pub use typing::{TypingDebouncer, TypingSignal};

use crate::chat::{MessageKind, RoomView};
use crate::entity::Identity;
use crate::protocol::{AckData, ClientEvent, ClientFrame, ServerEvent};
use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `http://host:port` of the chat service.
    pub base_url: String,
    pub identity: Identity,
    /// Bearer issued by the marketplace auth service. Without one the client
    /// falls back to the `role:id` form a development server accepts.
    pub token: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub request_timeout: Duration,
    pub page_size: Option<u32>,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, identity: Identity) -> Self {
        Self {
            base_url: base_url.into(),
            identity,
            token: None,
            reconnect: ReconnectPolicy::default(),
            request_timeout: Duration::from_secs(10),
            page_size: None,
        }
    }

    fn socket_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        match &self.token {
            Some(token) => format!("{}/ws?token={}", base, token),
            None => format!("{}/ws", base),
        }
    }

    fn bearer(&self) -> String {
        self.token
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.identity.role, self.identity.id))
    }
}

/// One participant's chat session.
///
/// Socket events are folded into [`ChatState`] as they are read with
/// [`ChatClient::next_event`].
pub struct ChatClient {
    config: ClientConfig,
    api: ChatApi,
    connection: ChatConnection,
    events: ConnectionEvents,
    state: ChatState,
    typing: TypingDebouncer,
    // Set between a drop and the next successful reconnect.
    dropped: bool,
}

impl ChatClient {
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let api = ChatApi::new(&config.base_url, config.bearer())?;
        let (connection, events) = ChatConnection::spawn(ConnectionConfig {
            url: config.socket_url(),
            identity: config.identity.clone(),
            token: config.token.clone(),
            reconnect: config.reconnect,
            request_timeout: config.request_timeout,
        });
        Ok(Self {
            state: ChatState::new(config.identity.clone()),
            config,
            api,
            connection,
            events,
            typing: TypingDebouncer::default(),
            dropped: false,
        })
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn api(&self) -> &ChatApi {
        &self.api
    }

    /// Next socket event, after it has been applied to the state.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        let event = self.events.recv().await?;
        match &event {
            ConnectionEvent::Server(server) => {
                self.state.apply(ChatAction::Server(server.clone()));
            }
            ConnectionEvent::Undelivered(frame) => {
                if let ClientEvent::SendMessage {
                    client_ref: Some(client_ref),
                    ..
                } = &frame.event
                {
                    self.state.apply(ChatAction::Undelivered {
                        client_ref: client_ref.clone(),
                    });
                }
            }
            ConnectionEvent::Disconnected => self.dropped = true,
            ConnectionEvent::Connected => {
                if std::mem::take(&mut self.dropped) {
                    if let Err(e) = self.resync().await {
                        warn!("Failed to catch up after reconnect: {:#}", e);
                    }
                }
            }
        }
        Some(event)
    }

    /// The socket re-joined the open room on reconnect; pick up whatever the
    /// peer sent while it was down and clear the unread it caused.
    async fn resync(&mut self) -> Result<()> {
        let Some(room_id) = self.state.open_room().map(|o| o.room_id.clone()) else {
            return Ok(());
        };
        let page = self.api.history(&room_id, 0, self.config.page_size).await?;
        debug!(room = %room_id, fetched = page.messages.len(), "Resynced open room");
        self.state.apply(ChatAction::HistoryLoaded(page));
        self.connection
            .emit(ClientFrame::new(ClientEvent::MarkSeen { room_id }))
    }

    /// Read events until one matches, applying everything on the way.
    pub async fn wait_for<F>(&mut self, within: Duration, mut matches: F) -> Result<ServerEvent>
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let event = tokio::time::timeout_at(deadline, self.next_event())
                .await
                .context("Timed out waiting for chat event")?
                .context("Chat connection closed")?;
            if let ConnectionEvent::Server(server) = event {
                if matches(&server) {
                    return Ok(server);
                }
            }
        }
    }

    /// Register explicitly and wait for the server to accept it. The
    /// connection also registers by itself on every (re)connect.
    pub async fn register(&self) -> Result<Identity> {
        let event = ClientEvent::Register {
            identity: self.config.identity.clone(),
            token: self.config.token.clone(),
        };
        match self.connection.request(event).await? {
            AckData::Registered { identity } => Ok(identity),
            other => anyhow::bail!("Unexpected register reply: {:?}", other),
        }
    }

    pub async fn load_rooms(&mut self) -> Result<()> {
        let rooms = self.api.rooms(&self.config.identity.id).await?;
        self.state.apply(ChatAction::RoomsLoaded(rooms));
        Ok(())
    }

    /// Open (creating if needed) the conversation with `peer_id`: join it,
    /// fetch the newest history page and mark it seen.
    pub async fn open_with(&mut self, peer_id: &str) -> Result<RoomView> {
        let reply = self
            .connection
            .request(ClientEvent::OpenRoom {
                peer_id: peer_id.to_string(),
            })
            .await?;
        self.opened(reply).await
    }

    /// Open an existing room by id.
    pub async fn open_room(&mut self, room_id: &str) -> Result<RoomView> {
        let reply = self
            .connection
            .request(ClientEvent::JoinRoom {
                room_id: room_id.to_string(),
            })
            .await?;
        self.opened(reply).await
    }

    async fn opened(&mut self, reply: AckData) -> Result<RoomView> {
        let view = match reply {
            AckData::Room(view) => view,
            other => anyhow::bail!("Unexpected open reply: {:?}", other),
        };
        let room_id = view.room.id.clone();
        self.connection.set_open_room(Some(room_id.clone())).await;
        self.state.apply(ChatAction::RoomOpened(view.clone()));

        let page = self.api.history(&room_id, 0, self.config.page_size).await?;
        self.state.apply(ChatAction::HistoryLoaded(page));
        self.connection
            .emit(ClientFrame::new(ClientEvent::MarkSeen { room_id }))?;
        Ok(view)
    }

    /// Fetch the next older page of the open room. Returns false when there
    /// is nothing older.
    pub async fn load_older(&mut self) -> Result<bool> {
        let Some(open) = self.state.open_room() else {
            return Ok(false);
        };
        if !open.has_more {
            return Ok(false);
        }
        let (room_id, page) = (open.room_id.clone(), open.next_page);
        let page = self.api.history(&room_id, page, self.config.page_size).await?;
        self.state.apply(ChatAction::HistoryLoaded(page));
        Ok(true)
    }

    pub async fn close_room(&mut self) -> Result<()> {
        if let Some(open) = self.state.open_room() {
            let room_id = open.room_id.clone();
            self.connection
                .emit(ClientFrame::new(ClientEvent::LeaveRoom { room_id }))?;
        }
        self.connection.set_open_room(None).await;
        self.state.apply(ChatAction::RoomClosed);
        Ok(())
    }

    /// Send to the open room. The message shows immediately as pending and
    /// is reconciled when the server's copy arrives. Returns its temporary key.
    pub fn send(&mut self, body: &str, kind: MessageKind) -> Result<String> {
        let room_id = self
            .state
            .open_room()
            .map(|o| o.room_id.clone())
            .context("No room is open")?;
        let client_ref = new_client_ref();
        let ack = self.connection.next_ack();
        self.state.apply(ChatAction::LocalSend {
            client_ref: client_ref.clone(),
            body: body.to_string(),
            kind,
            ack: Some(ack),
        });
        self.transmit(ack, room_id, body.to_string(), kind, client_ref.clone())?;
        Ok(client_ref)
    }

    pub fn send_text(&mut self, body: &str) -> Result<String> {
        self.send(body, MessageKind::Text)
    }

    /// Re-send a failed message under a new temporary key.
    pub fn retry(&mut self, client_ref: &str) -> Result<String> {
        let room_id = self
            .state
            .open_room()
            .map(|o| o.room_id.clone())
            .context("No room is open")?;
        let new_ref = new_client_ref();
        let ack = self.connection.next_ack();
        let (body, kind) = self
            .state
            .retry(client_ref, &new_ref, Some(ack))
            .context("No failed message with that key")?;
        self.transmit(ack, room_id, body, kind, new_ref.clone())?;
        Ok(new_ref)
    }

    fn transmit(
        &mut self,
        ack: u64,
        room_id: String,
        body: String,
        kind: MessageKind,
        client_ref: String,
    ) -> Result<()> {
        if let Some(signal) = self.typing.stop() {
            self.signal_typing(&room_id, signal);
        }
        let frame = ClientFrame::with_ack(
            ack,
            ClientEvent::SendMessage {
                room_id,
                body,
                kind,
                client_ref: Some(client_ref),
            },
        );
        self.connection.emit(frame)
    }

    /// A keystroke in the open room's composer.
    pub fn typing_input(&mut self) {
        let Some(room_id) = self.state.open_room().map(|o| o.room_id.clone()) else {
            return;
        };
        if let Some(signal) = self.typing.input(Instant::now()) {
            self.signal_typing(&room_id, signal);
        }
    }

    /// Call periodically so an idle composer stops the indicator.
    pub fn typing_tick(&mut self) {
        let Some(room_id) = self.state.open_room().map(|o| o.room_id.clone()) else {
            return;
        };
        if let Some(signal) = self.typing.poll(Instant::now()) {
            self.signal_typing(&room_id, signal);
        }
    }

    fn signal_typing(&self, room_id: &str, signal: TypingSignal) {
        let room_id = room_id.to_string();
        let event = match signal {
            TypingSignal::Start => ClientEvent::Typing { room_id },
            TypingSignal::Stop => ClientEvent::StopTyping { room_id },
        };
        if let Err(e) = self.connection.emit(ClientFrame::new(event)) {
            debug!("Typing signal dropped: {}", e);
        }
    }

    pub fn disconnect(&self) {
        self.connection.close();
    }
}

fn new_client_ref() -> String {
    format!("local-{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_follows_base_url() {
        let mut config = ClientConfig::new("http://127.0.0.1:3000/", Identity::vendor("v1", ""));
        assert_eq!(config.socket_url(), "ws://127.0.0.1:3000/ws");
        assert_eq!(config.bearer(), "vendor:v1");

        config.base_url = "https://chat.example.com".into();
        config.token = Some("abc".into());
        assert_eq!(config.socket_url(), "wss://chat.example.com/ws?token=abc");
        assert_eq!(config.bearer(), "abc");
    }
}
