use crate::protocol::ServerEvent;
use crate::realtime::ConnectionId;
use tokio::sync::broadcast;

/// Who an outbound event is addressed to.
#[derive(Debug, Clone, PartialEq)]
pub enum Audience {
    /// Every connection joined to the room, optionally skipping one participant's connections.
    Room {
        room_id: String,
        except: Option<String>,
    },
    /// Every live connection of a participant, joined or not.
    Participant { participant_id: String },
    Connection(ConnectionId),
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub audience: Audience,
    pub event: ServerEvent,
    /// Number of local connections the event was handed to.
    pub delivered: usize,
}

/// Tap on everything the hub delivers. Local sockets are served directly by
/// the hub; subscribers here are observers such as audit logging or a
/// cross-instance bridge.
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish(&self, envelope: Envelope) {
        // We ignore the error if there are no receivers
        let _ = self.tx.send(envelope);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
