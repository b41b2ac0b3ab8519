use super::{ChatHub, ConnectionId};
use crate::bus::Audience;
use crate::protocol::ServerEvent;
use tracing::debug;

impl ChatHub {
    /// Forward a typing start/stop signal to the other side of the room.
    ///
    /// Best effort: an unregistered or non-joined sender is dropped silently,
    /// nothing is persisted, and the sender never sees their own signal.
    pub async fn typing(&self, connection: ConnectionId, room_id: &str, active: bool) -> usize {
        let Ok(sender) = self.registered(connection).await else {
            debug!(connection = %connection, "Typing from unregistered connection dropped");
            return 0;
        };
        if !self.router.is_joined(room_id, connection).await {
            debug!(participant = %sender.id, room = %room_id, "Typing outside joined room dropped");
            return 0;
        }

        let event = if active {
            ServerEvent::Typing {
                room_id: room_id.to_string(),
                identity: sender.id.clone(),
            }
        } else {
            ServerEvent::StopTyping {
                room_id: room_id.to_string(),
                identity: sender.id.clone(),
            }
        };

        self.deliver(
            Audience::Room {
                room_id: room_id.to_string(),
                except: Some(sender.id),
            },
            event,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::entity::Identity;
    use crate::protocol::ServerEvent;

    #[tokio::test]
    async fn typing_reaches_only_the_peer() {
        let hub = hub().await;
        let (u, mut rx_u) = connect_as(&hub, Identity::user("u1", "")).await;
        let (laptop, mut rx_laptop) = connect_as(&hub, Identity::user("u1", "")).await;
        let (v, mut rx_v) = connect_as(&hub, Identity::vendor("v1", "")).await;
        let room_id = hub.open_room(u, "v1").await.unwrap().room.id;
        hub.join(laptop, &room_id).await.unwrap();
        hub.join(v, &room_id).await.unwrap();
        drain(&mut rx_u);
        drain(&mut rx_laptop);
        drain(&mut rx_v);

        assert_eq!(hub.typing(u, &room_id, true).await, 1);
        hub.typing(u, &room_id, false).await;

        assert_eq!(
            drain(&mut rx_v),
            vec![
                ServerEvent::Typing {
                    room_id: room_id.clone(),
                    identity: "u1".into()
                },
                ServerEvent::StopTyping {
                    room_id: room_id.clone(),
                    identity: "u1".into()
                },
            ]
        );
        assert!(drain(&mut rx_u).is_empty());
        assert!(drain(&mut rx_laptop).is_empty());
    }

    #[tokio::test]
    async fn typing_outside_the_room_is_dropped() {
        let hub = hub().await;
        let (u, _rx_u) = connect_as(&hub, Identity::user("u1", "")).await;
        let (v, mut rx_v) = connect_as(&hub, Identity::vendor("v1", "")).await;
        let room_id = hub.open_room(v, "u1").await.unwrap().room.id;
        drain(&mut rx_v);

        assert_eq!(hub.typing(u, &room_id, true).await, 0);
        let (anon, _rx_a) = hub.connect().await;
        assert_eq!(hub.typing(anon, &room_id, true).await, 0);
        assert!(drain(&mut rx_v).is_empty());
    }
}
