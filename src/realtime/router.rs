use super::ConnectionId;
use crate::chat::Room;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

struct RoomChannel {
    user_id: String,
    vendor_id: String,
    // joined connection -> participant id
    members: HashMap<ConnectionId, String>,
    send_lock: Arc<Mutex<()>>,
}

impl RoomChannel {
    fn includes(&self, participant_id: &str) -> bool {
        self.user_id == participant_id || self.vendor_id == participant_id
    }
}

/// Routing table: which connections currently view which room.
///
/// A channel exists only while at least one connection is joined.
#[derive(Default)]
pub struct RoomRouter {
    rooms: RwLock<HashMap<String, RoomChannel>>,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the connection was already joined.
    pub async fn join(&self, room: &Room, connection: ConnectionId, participant_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let channel = rooms.entry(room.id.clone()).or_insert_with(|| RoomChannel {
            user_id: room.user_id.clone(),
            vendor_id: room.vendor_id.clone(),
            members: HashMap::new(),
            send_lock: Arc::new(Mutex::new(())),
        });
        channel
            .members
            .insert(connection, participant_id.to_string())
            .is_none()
    }

    /// Returns false if the connection was not joined.
    pub async fn leave(&self, room_id: &str, connection: ConnectionId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(channel) = rooms.get_mut(room_id) else {
            return false;
        };
        let removed = channel.members.remove(&connection).is_some();
        if channel.members.is_empty() {
            rooms.remove(room_id);
        }
        removed
    }

    /// Drop a connection from every room; returns the rooms it had joined.
    pub async fn leave_all(&self, connection: ConnectionId) -> Vec<String> {
        let mut rooms = self.rooms.write().await;
        let mut left = Vec::new();
        rooms.retain(|room_id, channel| {
            if channel.members.remove(&connection).is_some() {
                left.push(room_id.clone());
            }
            !channel.members.is_empty()
        });
        left
    }

    /// Connections joined to the room, optionally skipping one participant.
    pub async fn members(&self, room_id: &str, except: Option<&str>) -> Vec<ConnectionId> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|channel| {
                channel
                    .members
                    .iter()
                    .filter(|(_, participant)| Some(participant.as_str()) != except)
                    .map(|(connection, _)| *connection)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn is_joined(&self, room_id: &str, connection: ConnectionId) -> bool {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .is_some_and(|channel| channel.members.contains_key(&connection))
    }

    /// A participant is viewing a room when any of their connections has joined it.
    pub async fn is_viewing(&self, room_id: &str, participant_id: &str) -> bool {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .is_some_and(|channel| channel.members.values().any(|p| p == participant_id))
    }

    /// Rooms with at least one viewer that include this participant.
    pub async fn rooms_with_participant(&self, participant_id: &str) -> Vec<String> {
        let rooms = self.rooms.read().await;
        rooms
            .iter()
            .filter(|(_, channel)| channel.includes(participant_id))
            .map(|(room_id, _)| room_id.clone())
            .collect()
    }

    /// Serialises sends within one room. `None` when nobody is joined.
    pub async fn send_lock(&self, room_id: &str) -> Option<Arc<Mutex<()>>> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map(|channel| channel.send_lock.clone())
    }

    pub async fn active_rooms(&self) -> usize {
        self.rooms.read().await.len()
    }
}
