use super::{participant_role, ChatHub, ConnectionId};
use crate::bus::Audience;
use crate::chat::{self, Message, MessageKind, NewMessage};
use crate::error::{ChatError, ChatResult};
use crate::protocol::ServerEvent;
use chrono::Utc;
use tracing::{debug, error};

/// A message as submitted by a connected client.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub room_id: String,
    pub body: String,
    pub kind: MessageKind,
    /// Temporary key of the sender's optimistic copy.
    pub client_ref: Option<String>,
}

impl OutgoingMessage {
    pub fn text(room_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            body: body.into(),
            kind: MessageKind::Text,
            client_ref: None,
        }
    }

    pub fn with_client_ref(mut self, client_ref: impl Into<String>) -> Self {
        self.client_ref = Some(client_ref.into());
        self
    }
}

impl ChatHub {
    /// Persist a message, then broadcast it to every connection joined to the
    /// room (the sender's own included). Nothing is broadcast unless the write
    /// committed.
    pub async fn send(&self, connection: ConnectionId, outgoing: OutgoingMessage) -> ChatResult<Message> {
        let sender = self.registered(connection).await?;

        let body = outgoing.body.trim();
        if body.is_empty() {
            return Err(ChatError::BadRequest("message body must not be empty".into()));
        }
        if body.chars().count() > self.limits.max_message_len {
            return Err(ChatError::BadRequest(format!(
                "message body exceeds {} characters",
                self.limits.max_message_len
            )));
        }

        if !self.router.is_joined(&outgoing.room_id, connection).await {
            return Err(ChatError::NotJoined(outgoing.room_id));
        }
        let lock = self
            .router
            .send_lock(&outgoing.room_id)
            .await
            .ok_or_else(|| ChatError::NotJoined(outgoing.room_id.clone()))?;
        // Held until the broadcast is queued so room order matches persisted order.
        let _serial = lock.lock().await;

        let room = self
            .store
            .get_room(&outgoing.room_id)
            .await?
            .ok_or(ChatError::RoomNotFound)?;
        let sender_role = participant_role(&room, &sender)?;
        let peer_role = sender_role.counterpart();
        let peer_id = room.participant_id(peer_role).to_string();
        let peer_viewing = self.router.is_viewing(&room.id, &peer_id).await;

        let draft = NewMessage {
            room_id: room.id.clone(),
            sender_id: sender.id.clone(),
            sender_role,
            body: body.to_string(),
            kind: outgoing.kind,
            timestamp: Utc::now(),
        };
        let preview = chat::preview(body, outgoing.kind, self.limits.preview_len);
        let bump = (!peer_viewing).then_some(peer_role);

        let (message, room) = match self.store.append_message(&draft, &preview, bump).await {
            Ok(saved) => saved,
            Err(e) => {
                error!(
                    room = %draft.room_id,
                    sender = %sender.id,
                    error = %format!("{:#}", e),
                    "Failed to persist message, nothing relayed"
                );
                return Err(ChatError::Storage(e));
            }
        };

        let delivered = self
            .deliver(
                Audience::Room {
                    room_id: room.id.clone(),
                    except: None,
                },
                ServerEvent::ReceiveMessage {
                    message: message.clone(),
                    client_ref: outgoing.client_ref,
                },
            )
            .await;
        debug!(
            room = %room.id,
            message = %message.id,
            delivered,
            peer_viewing,
            "Relayed message"
        );

        if !peer_viewing {
            self.notify_unviewed(&room, &sender, &message, &preview).await;
        }

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::entity::Identity;

    fn received(events: &[ServerEvent]) -> Vec<(&Message, Option<&str>)> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::ReceiveMessage {
                    message,
                    client_ref,
                } => Some((message, client_ref.as_deref())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn durable_id_is_the_same_everywhere() {
        let hub = hub().await;
        let user = Identity::user("u1", "Ana");
        let (u, mut rx_u) = connect_as(&hub, user.clone()).await;
        let (v, mut rx_v) = connect_as(&hub, Identity::vendor("v1", "Reef Divers")).await;
        let room_id = hub.open_room(u, "v1").await.unwrap().room.id;
        hub.join(v, &room_id).await.unwrap();
        drain(&mut rx_u);
        drain(&mut rx_v);

        let acked = hub
            .send(u, OutgoingMessage::text(&room_id, "Do you rent snorkels?").with_client_ref("tmp-1"))
            .await
            .unwrap();

        let to_sender = drain(&mut rx_u);
        let to_vendor = drain(&mut rx_v);
        let (echo, echo_ref) = received(&to_sender)[0];
        let (delivered, _) = received(&to_vendor)[0];
        assert_eq!(echo.id, acked.id);
        assert_eq!(echo_ref, Some("tmp-1"));
        assert_eq!(delivered.id, acked.id);

        let page = hub.history(&user, &room_id, 0, None).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].id, acked.id);
        assert_eq!(page.messages[0].body, "Do you rent snorkels?");
    }

    #[tokio::test]
    async fn echo_reaches_senders_other_devices() {
        let hub = hub().await;
        let (phone, mut rx_phone) = connect_as(&hub, Identity::user("u1", "")).await;
        let (laptop, mut rx_laptop) = connect_as(&hub, Identity::user("u1", "")).await;
        let room_id = hub.open_room(phone, "v1").await.unwrap().room.id;
        hub.join(laptop, &room_id).await.unwrap();

        hub.send(phone, OutgoingMessage::text(&room_id, "hi")).await.unwrap();
        assert_eq!(received(&drain(&mut rx_phone)).len(), 1);
        assert_eq!(received(&drain(&mut rx_laptop)).len(), 1);
    }

    #[tokio::test]
    async fn sender_must_be_joined() {
        let hub = hub().await;
        let (u, _rx_u) = connect_as(&hub, Identity::user("u1", "")).await;
        let room_id = hub.open_room(u, "v1").await.unwrap().room.id;
        hub.leave(u, &room_id).await.unwrap();

        let result = hub.send(u, OutgoingMessage::text(&room_id, "hello?")).await;
        assert!(matches!(result, Err(ChatError::NotJoined(_))));
        let user = Identity::user("u1", "");
        assert!(hub.history(&user, &room_id, 0, None).await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn rejects_empty_and_oversized_bodies() {
        let hub = hub().await;
        let (u, _rx_u) = connect_as(&hub, Identity::user("u1", "")).await;
        let room_id = hub.open_room(u, "v1").await.unwrap().room.id;

        assert!(matches!(
            hub.send(u, OutgoingMessage::text(&room_id, "   \n")).await,
            Err(ChatError::BadRequest(_))
        ));
        let huge = "x".repeat(hub.limits().max_message_len + 1);
        assert!(matches!(
            hub.send(u, OutgoingMessage::text(&room_id, huge)).await,
            Err(ChatError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn storage_failure_broadcasts_nothing() {
        let hub = hub().await;
        let (u, mut rx_u) = connect_as(&hub, Identity::user("u1", "")).await;
        let (v, mut rx_v) = connect_as(&hub, Identity::vendor("v1", "")).await;
        let room_id = hub.open_room(u, "v1").await.unwrap().room.id;
        hub.join(v, &room_id).await.unwrap();
        drain(&mut rx_u);
        drain(&mut rx_v);

        hub.store().close().await;
        let result = hub.send(u, OutgoingMessage::text(&room_id, "lost")).await;

        assert!(matches!(result, Err(ChatError::Storage(_))));
        assert!(drain(&mut rx_u).is_empty());
        assert!(drain(&mut rx_v).is_empty());
    }

    #[tokio::test]
    async fn one_senders_messages_keep_their_order() {
        let hub = hub().await;
        let user = Identity::user("u1", "");
        let (u, _rx_u) = connect_as(&hub, user.clone()).await;
        let (v, mut rx_v) = connect_as(&hub, Identity::vendor("v1", "")).await;
        let room_id = hub.open_room(u, "v1").await.unwrap().room.id;
        hub.join(v, &room_id).await.unwrap();

        for n in 0..20 {
            hub.send(u, OutgoingMessage::text(&room_id, format!("msg {}", n)))
                .await
                .unwrap();
        }

        let events = drain(&mut rx_v);
        let bodies: Vec<_> = received(&events).iter().map(|(m, _)| m.body.clone()).collect();
        let expected: Vec<_> = (0..20).map(|n| format!("msg {}", n)).collect();
        assert_eq!(bodies, expected);

        let mut history = hub.history(&user, &room_id, 0, Some(50)).await.unwrap().messages;
        history.sort_by_key(|m| m.timestamp);
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }
}
