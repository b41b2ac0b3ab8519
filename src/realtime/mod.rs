//! In-process realtime hub: connections, rooms, presence and message relay.
//!
//! Everything here is transport-agnostic. Sockets (see `server::ws`) open a
//! connection on the hub, feed it client events and drain the returned
//! channel; tests do the same without any socket at all.

pub mod fanout;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod router;
pub mod typing;

pub use presence::PresenceTracker;
pub use registry::{ConnectionId, ConnectionRegistry, Departure};
pub use relay::OutgoingMessage;
pub use router::RoomRouter;

use crate::bus::{Audience, Envelope, EventBus};
use crate::chat::{MessagePage, Room, RoomSummary, RoomView};
use crate::config::ChatLimits;
use crate::entity::{Identity, Role};
use crate::error::{ChatError, ChatResult};
use crate::protocol::ServerEvent;
use crate::store::Store;
use std::sync::Arc;
use tokio::sync::{mpsc::UnboundedReceiver, Mutex};
use tracing::{debug, info};

pub struct ChatHub {
    store: Store,
    registry: ConnectionRegistry,
    router: RoomRouter,
    presence: PresenceTracker,
    bus: Arc<EventBus>,
    limits: ChatLimits,
    // Held across a registry change and the presence change it causes.
    transitions: Mutex<()>,
}

impl ChatHub {
    pub fn new(store: Store, bus: Arc<EventBus>, limits: ChatLimits) -> Self {
        Self {
            store,
            registry: ConnectionRegistry::new(),
            router: RoomRouter::new(),
            presence: PresenceTracker::new(),
            bus,
            limits,
            transitions: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn limits(&self) -> &ChatLimits {
        &self.limits
    }

    /// Live sockets and rooms with at least one viewer.
    pub async fn load(&self) -> (usize, usize) {
        (
            self.registry.connection_count().await,
            self.router.active_rooms().await,
        )
    }

    /// Live connections registered to a participant.
    pub async fn connections_of(&self, participant_id: &str) -> Vec<ConnectionId> {
        self.registry.connections_of(participant_id).await
    }

    /// Accept a new connection. Events for it arrive on the returned channel.
    pub async fn connect(&self) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
        self.registry.open().await
    }

    /// Bind an authenticated identity to a connection.
    pub async fn register(&self, connection: ConnectionId, identity: Identity) -> ChatResult<Identity> {
        let _transition = self.transitions.lock().await;
        let first = self.registry.register(connection, identity.clone()).await?;
        if first && self.presence.set_online(&identity.id).await {
            info!(participant = %identity.id, role = %identity.role, "Participant online");
            self.announce_presence(&identity.id, true).await;
        }
        Ok(identity)
    }

    /// Tear down a connection: leave its rooms and, if it was the
    /// participant's last one, go offline.
    pub async fn disconnect(&self, connection: ConnectionId) {
        let left = self.router.leave_all(connection).await;
        let _transition = self.transitions.lock().await;
        let Some(departure) = self.registry.close(connection).await else {
            return;
        };

        debug!(
            connection = %connection,
            participant = %departure.identity.id,
            rooms_left = left.len(),
            "Connection left"
        );

        if departure.was_last && self.presence.set_offline(&departure.identity.id).await {
            info!(participant = %departure.identity.id, "Participant offline");
            self.announce_presence(&departure.identity.id, false).await;
        }
    }

    /// Find-or-create the room for a user/vendor pair on behalf of `caller`,
    /// who must be one of the two.
    pub async fn find_or_create_room(
        &self,
        caller: &Identity,
        user_id: &str,
        vendor_id: &str,
    ) -> ChatResult<Room> {
        let (user_id, vendor_id) = (user_id.trim(), vendor_id.trim());
        if user_id.is_empty() || vendor_id.is_empty() {
            return Err(ChatError::BadRequest("user_id and vendor_id are required".into()));
        }
        if user_id == vendor_id {
            return Err(ChatError::BadRequest("a room needs two different participants".into()));
        }

        let own_side = match caller.role {
            Role::User => user_id,
            Role::Vendor => vendor_id,
        };
        if own_side != caller.id {
            return Err(ChatError::Forbidden(
                "callers may only open their own conversations".into(),
            ));
        }

        Ok(self.store.find_or_create_room(user_id, vendor_id).await?)
    }

    /// Find-or-create the room between this connection's participant and
    /// `peer_id` (who is on the other side), then join it.
    pub async fn open_room(&self, connection: ConnectionId, peer_id: &str) -> ChatResult<RoomView> {
        let caller = self.registered(connection).await?;
        let room = match caller.role {
            Role::User => self.find_or_create_room(&caller, &caller.id, peer_id).await?,
            Role::Vendor => self.find_or_create_room(&caller, peer_id, &caller.id).await?,
        };
        self.join_room(connection, &caller, room).await
    }

    pub async fn join(&self, connection: ConnectionId, room_id: &str) -> ChatResult<RoomView> {
        let caller = self.registered(connection).await?;
        let room = self
            .store
            .get_room(room_id)
            .await?
            .ok_or(ChatError::RoomNotFound)?;
        participant_role(&room, &caller)?;
        self.join_room(connection, &caller, room).await
    }

    pub async fn leave(&self, connection: ConnectionId, room_id: &str) -> ChatResult<()> {
        let caller = self.registered(connection).await?;
        if self.router.leave(room_id, connection).await {
            debug!(participant = %caller.id, room = %room_id, "Left room");
        }
        Ok(())
    }

    /// Conversation list for a participant, most recent first.
    pub async fn room_summaries(&self, participant_id: &str) -> ChatResult<Vec<RoomSummary>> {
        let rooms = self.store.list_rooms_for_participant(participant_id).await?;

        let mut summaries = Vec::with_capacity(rooms.len());
        for room in rooms {
            let Some((peer_id, _)) = room.peer_of(participant_id) else {
                continue;
            };
            let peer_id = peer_id.to_string();
            let unread = room
                .role_of(participant_id)
                .map(|role| room.unread_for(role))
                .unwrap_or(0);
            let peer_online = self.presence.is_online(&peer_id).await;
            summaries.push(RoomSummary {
                room,
                peer_id,
                unread,
                peer_online,
            });
        }
        Ok(summaries)
    }

    /// One page of a room's history for one of its participants.
    pub async fn history(
        &self,
        caller: &Identity,
        room_id: &str,
        page: u32,
        page_size: Option<u32>,
    ) -> ChatResult<MessagePage> {
        let room = self
            .store
            .get_room(room_id)
            .await?
            .ok_or(ChatError::RoomNotFound)?;
        participant_role(&room, caller)?;

        let page_size = page_size
            .unwrap_or(self.limits.default_page_size)
            .clamp(1, self.limits.max_page_size.max(1));
        Ok(self.store.get_messages(room_id, page, page_size).await?)
    }

    /// Single delivery seam for everything the hub emits.
    pub async fn deliver(&self, audience: Audience, event: ServerEvent) -> usize {
        let targets = match &audience {
            Audience::Room { room_id, except } => {
                self.router.members(room_id, except.as_deref()).await
            }
            Audience::Participant { participant_id } => self.connections_of(participant_id).await,
            Audience::Connection(id) => vec![*id],
        };

        let delivered = self.registry.send_to(&targets, &event).await;
        self.bus.publish(Envelope {
            audience,
            event,
            delivered,
        });
        delivered
    }

    pub(crate) async fn registered(&self, connection: ConnectionId) -> ChatResult<Identity> {
        self.registry
            .identity_of(connection)
            .await
            .ok_or(ChatError::NotRegistered)
    }

    async fn join_room(
        &self,
        connection: ConnectionId,
        caller: &Identity,
        room: Room,
    ) -> ChatResult<RoomView> {
        if self.router.join(&room, connection, &caller.id).await {
            debug!(participant = %caller.id, room = %room.id, "Joined room");
        }
        let peer_online = match room.peer_of(&caller.id) {
            Some((peer_id, _)) => self.presence.is_online(peer_id).await,
            None => false,
        };
        Ok(RoomView { room, peer_online })
    }

    async fn announce_presence(&self, participant_id: &str, online: bool) {
        for room_id in self.router.rooms_with_participant(participant_id).await {
            self.deliver(
                Audience::Room {
                    room_id,
                    except: Some(participant_id.to_string()),
                },
                ServerEvent::PresenceChanged {
                    identity: participant_id.to_string(),
                    online,
                },
            )
            .await;
        }
    }
}

/// The caller's role in the room, checked against the role they registered with.
pub(crate) fn participant_role(room: &Room, caller: &Identity) -> ChatResult<Role> {
    room.role_of(&caller.id)
        .filter(|role| *role == caller.role)
        .ok_or_else(|| ChatError::Forbidden("not a participant of this room".into()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub async fn hub() -> ChatHub {
        ChatHub::new(
            Store::in_memory().await.unwrap(),
            Arc::new(EventBus::default()),
            ChatLimits::default(),
        )
    }

    pub async fn connect_as(
        hub: &ChatHub,
        identity: Identity,
    ) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
        let (id, rx) = hub.connect().await;
        hub.register(id, identity).await.unwrap();
        (id, rx)
    }

    pub fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn open_room_creates_once_from_either_side() {
        let hub = hub().await;
        let (u, _rx_u) = connect_as(&hub, Identity::user("u1", "Ana")).await;
        let (v, _rx_v) = connect_as(&hub, Identity::vendor("v1", "Reef Divers")).await;

        let from_user = hub.open_room(u, "v1").await.unwrap();
        let from_vendor = hub.open_room(v, "u1").await.unwrap();
        assert_eq!(from_user.room.id, from_vendor.room.id);
        assert!(from_vendor.peer_online);
    }

    #[tokio::test]
    async fn outsiders_cannot_join() {
        let hub = hub().await;
        let (u, _rx_u) = connect_as(&hub, Identity::user("u1", "")).await;
        let (intruder, _rx_i) = connect_as(&hub, Identity::user("u2", "")).await;
        let view = hub.open_room(u, "v1").await.unwrap();

        assert!(matches!(
            hub.join(intruder, &view.room.id).await,
            Err(ChatError::Forbidden(_))
        ));
        assert!(matches!(
            hub.join(intruder, "no-such-room").await,
            Err(ChatError::RoomNotFound)
        ));

        let (anon, _rx_a) = hub.connect().await;
        assert!(matches!(
            hub.join(anon, &view.room.id).await,
            Err(ChatError::NotRegistered)
        ));
    }

    #[tokio::test]
    async fn vendor_cannot_open_room_for_someone_else() {
        let hub = hub().await;
        let vendor = Identity::vendor("v1", "");
        assert!(matches!(
            hub.find_or_create_room(&vendor, "u1", "v2").await,
            Err(ChatError::Forbidden(_))
        ));
        assert!(matches!(
            hub.find_or_create_room(&vendor, "v1", "v1").await,
            Err(ChatError::BadRequest(_))
        ));
        assert!(hub.find_or_create_room(&vendor, "u1", "v1").await.is_ok());
    }

    #[tokio::test]
    async fn presence_follows_the_last_connection() {
        let hub = hub().await;
        let (u, mut rx_u) = connect_as(&hub, Identity::user("u1", "")).await;
        let view = hub.open_room(u, "v1").await.unwrap();
        assert!(!view.peer_online);

        let (tab_one, _rx1) = connect_as(&hub, Identity::vendor("v1", "")).await;
        let (tab_two, _rx2) = connect_as(&hub, Identity::vendor("v1", "")).await;
        assert_eq!(
            drain(&mut rx_u),
            vec![ServerEvent::PresenceChanged {
                identity: "v1".into(),
                online: true
            }]
        );

        hub.disconnect(tab_one).await;
        assert!(drain(&mut rx_u).is_empty());
        assert!(hub.presence().is_online("v1").await);

        hub.disconnect(tab_two).await;
        assert_eq!(
            drain(&mut rx_u),
            vec![ServerEvent::PresenceChanged {
                identity: "v1".into(),
                online: false
            }]
        );
        assert!(!hub.presence().is_online("v1").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reconnect_racing_the_old_socket_stays_online() {
        let hub = Arc::new(hub().await);
        let vendor = Identity::vendor("v1", "");
        let (mut old, _rx) = connect_as(&hub, vendor.clone()).await;

        for _ in 0..200 {
            let (new, rx) = hub.connect().await;
            let closing = {
                let hub = hub.clone();
                tokio::spawn(async move { hub.disconnect(old).await })
            };
            let registering = {
                let hub = hub.clone();
                let vendor = vendor.clone();
                tokio::spawn(async move { hub.register(new, vendor).await })
            };
            closing.await.unwrap();
            registering.await.unwrap().unwrap();

            assert!(hub.presence().is_online("v1").await);
            old = new;
            drop(rx);
        }
    }

    #[tokio::test]
    async fn summaries_carry_unread_and_presence() {
        let hub = hub().await;
        let (u, _rx_u) = connect_as(&hub, Identity::user("u1", "")).await;
        let view = hub.open_room(u, "v1").await.unwrap();
        hub.send(u, OutgoingMessage::text(&view.room.id, "Hello"))
            .await
            .unwrap();

        let summaries = hub.room_summaries("v1").await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].peer_id, "u1");
        assert_eq!(summaries[0].unread, 1);
        assert!(summaries[0].peer_online);
        assert_eq!(summaries[0].room.last_message.as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn history_clamps_page_size_and_checks_membership() {
        let hub = hub().await;
        let user = Identity::user("u1", "");
        let (u, _rx_u) = connect_as(&hub, user.clone()).await;
        let view = hub.open_room(u, "v1").await.unwrap();

        let page = hub.history(&user, &view.room.id, 0, Some(10_000)).await.unwrap();
        assert_eq!(page.page_size, hub.limits().max_page_size);

        let stranger = Identity::vendor("v2", "");
        assert!(matches!(
            hub.history(&stranger, &view.room.id, 0, None).await,
            Err(ChatError::Forbidden(_))
        ));
    }
}
