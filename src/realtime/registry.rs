use crate::entity::Identity;
use crate::error::ChatError;
use crate::protocol::ServerEvent;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use uuid::Uuid;

/// Unique identifier for one live socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0.simple())
    }
}

struct ConnectionEntry {
    identity: Option<Identity>,
    sender: UnboundedSender<ServerEvent>,
    opened_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    // participant id -> registered connections
    by_participant: HashMap<String, HashSet<ConnectionId>>,
}

/// Result of closing a connection that had been registered.
#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    pub identity: Identity,
    /// No other live connection remains for this participant.
    pub was_last: bool,
}

/// Live sockets and the identities bound to them.
///
/// Outbound channels are unbounded so a slow client never blocks whoever is
/// delivering to it.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new, not yet registered connection.
    pub async fn open(&self) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = unbounded_channel();
        let id = ConnectionId::new();

        let mut guard = self.inner.write().await;
        guard.connections.insert(
            id,
            ConnectionEntry {
                identity: None,
                sender: tx,
                opened_at: Utc::now(),
            },
        );

        tracing::debug!(connection = %id, total = guard.connections.len(), "Connection opened");
        (id, rx)
    }

    /// Bind a connection to an identity. Returns true when this is the
    /// participant's first live connection.
    pub async fn register(&self, id: ConnectionId, identity: Identity) -> Result<bool, ChatError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        let entry = inner
            .connections
            .get_mut(&id)
            .ok_or(ChatError::NotRegistered)?;

        if let Some(existing) = &entry.identity {
            if existing.same_account(&identity) {
                return Ok(false);
            }
            return Err(ChatError::Forbidden(format!(
                "connection already registered as {}",
                existing.id
            )));
        }

        entry.identity = Some(identity.clone());
        let set = inner.by_participant.entry(identity.id.clone()).or_default();
        set.insert(id);
        let first = set.len() == 1;

        tracing::debug!(
            connection = %id,
            participant = %identity.id,
            live = set.len(),
            "Connection registered"
        );
        Ok(first)
    }

    pub async fn identity_of(&self, id: ConnectionId) -> Option<Identity> {
        let guard = self.inner.read().await;
        guard.connections.get(&id).and_then(|e| e.identity.clone())
    }

    /// Forget a connection. Returns who it belonged to if it was registered.
    pub async fn close(&self, id: ConnectionId) -> Option<Departure> {
        let mut guard = self.inner.write().await;
        let entry = guard.connections.remove(&id)?;
        let identity = entry.identity?;

        let was_last = match guard.by_participant.get_mut(&identity.id) {
            Some(set) => {
                set.remove(&id);
                set.is_empty()
            }
            None => true,
        };
        if was_last {
            guard.by_participant.remove(&identity.id);
        }

        tracing::debug!(
            connection = %id,
            participant = %identity.id,
            was_last,
            lifetime_secs = (Utc::now() - entry.opened_at).num_seconds(),
            "Connection closed"
        );
        Some(Departure { identity, was_last })
    }

    /// Hand an event to the given connections. Returns how many accepted it.
    pub async fn send_to(&self, ids: &[ConnectionId], event: &ServerEvent) -> usize {
        let guard = self.inner.read().await;
        ids.iter()
            .filter_map(|id| guard.connections.get(id))
            .filter(|entry| entry.sender.send(event.clone()).is_ok())
            .count()
    }

    pub async fn connections_of(&self, participant_id: &str) -> Vec<ConnectionId> {
        let guard = self.inner.read().await;
        guard
            .by_participant
            .get(participant_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}
