use super::{participant_role, ChatHub, ConnectionId};
use crate::bus::Audience;
use crate::chat::{Message, Room};
use crate::entity::Identity;
use crate::error::{ChatError, ChatResult};
use crate::protocol::ServerEvent;
use tracing::debug;

impl ChatHub {
    /// Ping the other participant on all their live connections after a
    /// message they were not viewing. Their unread counter has already been
    /// bumped with the message write; when nobody is connected the counter is
    /// the only record of the miss.
    pub(crate) async fn notify_unviewed(
        &self,
        room: &Room,
        sender: &Identity,
        message: &Message,
        preview: &str,
    ) -> usize {
        let Some((peer_id, peer_role)) = room.peer_of(&sender.id) else {
            return 0;
        };

        let event = ServerEvent::NewMessageNotification {
            room_id: room.id.clone(),
            sender_id: sender.id.clone(),
            sender_name: sender.display_name().to_string(),
            preview: preview.to_string(),
            timestamp: message.timestamp,
            unread: room.unread_for(peer_role),
        };

        let delivered = self
            .deliver(
                Audience::Participant {
                    participant_id: peer_id.to_string(),
                },
                event,
            )
            .await;
        if delivered == 0 {
            debug!(room = %room.id, peer = %peer_id, "Peer offline, notification dropped");
        }
        delivered
    }

    /// The reader has seen everything in the room: reset their counter, flag
    /// the peer's messages as seen and tell both sides.
    pub async fn mark_seen(&self, connection: ConnectionId, room_id: &str) -> ChatResult<Room> {
        let reader = self.registered(connection).await?;
        let room = self
            .store
            .get_room(room_id)
            .await?
            .ok_or(ChatError::RoomNotFound)?;
        let role = participant_role(&room, &reader)?;

        let (room, flipped) = self.store.mark_seen(room_id, role).await?;
        debug!(room = %room_id, reader = %reader.id, flipped, "Marked seen");

        let peer_id = room.participant_id(role.counterpart()).to_string();
        let event = ServerEvent::MessagesSeen {
            room_id: room.id.clone(),
            identity: reader.id.clone(),
        };
        self.deliver(
            Audience::Participant {
                participant_id: peer_id,
            },
            event.clone(),
        )
        .await;
        // Other devices of the reader clear their badge too.
        self.deliver(
            Audience::Participant {
                participant_id: reader.id.clone(),
            },
            event,
        )
        .await;

        Ok(room)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::OutgoingMessage;
    use super::*;
    use crate::entity::Role;

    fn notifications(events: &[ServerEvent]) -> Vec<&ServerEvent> {
        events
            .iter()
            .filter(|e| matches!(e, ServerEvent::NewMessageNotification { .. }))
            .collect()
    }

    #[tokio::test]
    async fn unread_counts_messages_sent_while_away() {
        let hub = hub().await;
        let (u, _rx_u) = connect_as(&hub, Identity::user("u1", "Ana")).await;
        let (v, mut rx_v) = connect_as(&hub, Identity::vendor("v1", "")).await;
        let room_id = hub.open_room(u, "v1").await.unwrap().room.id;

        for n in 0..4 {
            hub.send(u, OutgoingMessage::text(&room_id, format!("question {}", n)))
                .await
                .unwrap();
        }

        let room = hub.store().get_room(&room_id).await.unwrap().unwrap();
        assert_eq!(room.unread_for(Role::Vendor), 4);

        let events = drain(&mut rx_v);
        // Connected elsewhere: pings only, never the full message.
        assert_eq!(notifications(&events).len(), 4);
        assert!(!events
            .iter()
            .any(|e| matches!(e, ServerEvent::ReceiveMessage { .. })));
        match notifications(&events)[3] {
            ServerEvent::NewMessageNotification {
                sender_name,
                preview,
                unread,
                ..
            } => {
                assert_eq!(sender_name, "Ana");
                assert_eq!(preview, "question 3");
                assert_eq!(*unread, 4);
            }
            other => panic!("unexpected event {:?}", other),
        }

        hub.join(v, &room_id).await.unwrap();
        let room = hub.mark_seen(v, &room_id).await.unwrap();
        assert_eq!(room.vendor_unread, 0);
    }

    #[tokio::test]
    async fn viewing_member_is_not_counted() {
        let hub = hub().await;
        let (u, _rx_u) = connect_as(&hub, Identity::user("u1", "")).await;
        let (v, mut rx_v) = connect_as(&hub, Identity::vendor("v1", "")).await;
        let room_id = hub.open_room(u, "v1").await.unwrap().room.id;
        hub.join(v, &room_id).await.unwrap();
        drain(&mut rx_v);

        hub.send(u, OutgoingMessage::text(&room_id, "hi")).await.unwrap();
        hub.send(u, OutgoingMessage::text(&room_id, "hello?")).await.unwrap();

        let room = hub.store().get_room(&room_id).await.unwrap().unwrap();
        assert_eq!(room.vendor_unread, 0);
        assert!(notifications(&drain(&mut rx_v)).is_empty());
    }

    #[tokio::test]
    async fn viewing_on_one_device_counts_for_all() {
        let hub = hub().await;
        let (u, _rx_u) = connect_as(&hub, Identity::user("u1", "")).await;
        let (desk, _rx_desk) = connect_as(&hub, Identity::vendor("v1", "")).await;
        let (_phone, mut rx_phone) = connect_as(&hub, Identity::vendor("v1", "")).await;
        let room_id = hub.open_room(u, "v1").await.unwrap().room.id;
        hub.join(desk, &room_id).await.unwrap();

        hub.send(u, OutgoingMessage::text(&room_id, "hi")).await.unwrap();
        assert!(notifications(&drain(&mut rx_phone)).is_empty());
        let room = hub.store().get_room(&room_id).await.unwrap().unwrap();
        assert_eq!(room.vendor_unread, 0);
    }

    #[tokio::test]
    async fn mark_seen_sends_read_receipt_to_both_sides() {
        let hub = hub().await;
        let (u, mut rx_u) = connect_as(&hub, Identity::user("u1", "")).await;
        let room_id = hub.open_room(u, "v1").await.unwrap().room.id;
        let sent = hub.send(u, OutgoingMessage::text(&room_id, "Hello")).await.unwrap();
        hub.leave(u, &room_id).await.unwrap();
        drain(&mut rx_u);

        let (v, mut rx_v) = connect_as(&hub, Identity::vendor("v1", "")).await;
        hub.join(v, &room_id).await.unwrap();
        hub.mark_seen(v, &room_id).await.unwrap();

        let receipt = ServerEvent::MessagesSeen {
            room_id: room_id.clone(),
            identity: "v1".into(),
        };
        assert!(drain(&mut rx_u).contains(&receipt));
        assert!(drain(&mut rx_v).contains(&receipt));

        let user = Identity::user("u1", "");
        let page = hub.history(&user, &room_id, 0, None).await.unwrap();
        assert_eq!(page.messages[0].id, sent.id);
        assert!(page.messages[0].seen);
    }

    #[tokio::test]
    async fn mark_seen_requires_participation() {
        let hub = hub().await;
        let (u, _rx_u) = connect_as(&hub, Identity::user("u1", "")).await;
        let room_id = hub.open_room(u, "v1").await.unwrap().room.id;
        let (other, _rx_o) = connect_as(&hub, Identity::vendor("v9", "")).await;

        assert!(matches!(
            hub.mark_seen(other, &room_id).await,
            Err(ChatError::Forbidden(_))
        ));
    }
}
