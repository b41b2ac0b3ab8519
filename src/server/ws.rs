use super::rest::bearer;
use super::ServerState;
use crate::bus::Audience;
use crate::error::ChatResult;
use crate::protocol::{AckData, AckError, ClientEvent, ClientFrame, ServerEvent};
use crate::realtime::{ConnectionId, OutgoingMessage};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// `GET /ws`. The token may come as `?token=` or as a bearer header; it is
/// checked here when present and again against the identity sent in `register`.
pub async fn upgrade(
    State(state): State<ServerState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params
        .token
        .filter(|t| !t.trim().is_empty())
        .or_else(|| bearer(&headers).map(str::to_string));

    if let Some(token) = token.as_deref() {
        if let Err(e) = state.auth.authenticate(Some(token), None) {
            warn!("Socket upgrade rejected: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(state, token, socket))
}

async fn handle_socket(state: ServerState, token: Option<String>, socket: WebSocket) {
    let (connection, mut outbound) = state.hub.connect().await;
    debug!(connection = %connection, "Socket opened");

    let (mut sink, mut stream) = socket.split();
    let heartbeat = state.heartbeat;

    // Sole writer for this socket: hub events and pings.
    let writer = tokio::spawn(async move {
        let mut ping = interval(heartbeat.interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;

        loop {
            tokio::select! {
                event = outbound.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to serialize {} frame: {}", event.name(), e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let frame = match timeout(heartbeat.timeout, stream.next()).await {
            Err(_) => {
                info!(connection = %connection, "Socket timed out");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(connection = %connection, "Socket error: {}", e);
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => handle_text(&state, connection, token.as_deref(), &text).await,
            Message::Close(_) => break,
            // Pings, pongs and binary frames only count as liveness.
            _ => {}
        }
    }

    state.hub.disconnect(connection).await;
    writer.abort();
    debug!(connection = %connection, "Socket closed");
}

async fn handle_text(state: &ServerState, connection: ConnectionId, token: Option<&str>, text: &str) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(connection = %connection, "Malformed frame: {}", e);
            reply(
                state,
                connection,
                ServerEvent::Error {
                    code: "bad_request".into(),
                    message: format!("malformed frame: {}", e),
                },
            )
            .await;
            return;
        }
    };

    let best_effort = frame.event.is_best_effort();
    let result = dispatch(state, connection, token, frame.event).await;

    let event = match (result, frame.ack) {
        (Ok(data), Some(ack)) => ServerEvent::Ack {
            ack,
            ok: true,
            data: Some(data),
            error: None,
        },
        (Ok(_), None) => return,
        (Err(e), _) if best_effort => {
            debug!(connection = %connection, "Dropped best-effort event: {}", e);
            return;
        }
        (Err(e), Some(ack)) => ServerEvent::Ack {
            ack,
            ok: false,
            data: None,
            error: Some(AckError::from(&e)),
        },
        (Err(e), None) => ServerEvent::Error {
            code: e.code().into(),
            message: e.client_message(),
        },
    };
    reply(state, connection, event).await;
}

async fn dispatch(
    state: &ServerState,
    connection: ConnectionId,
    token: Option<&str>,
    event: ClientEvent,
) -> ChatResult<AckData> {
    let hub = &state.hub;
    match event {
        ClientEvent::Register {
            identity,
            token: frame_token,
        } => {
            let credential = frame_token.as_deref().or(token);
            let identity = state.auth.authenticate(credential, Some(&identity))?;
            let identity = hub.register(connection, identity).await?;
            Ok(AckData::Registered { identity })
        }
        ClientEvent::OpenRoom { peer_id } => Ok(AckData::Room(hub.open_room(connection, &peer_id).await?)),
        ClientEvent::JoinRoom { room_id } => Ok(AckData::Room(hub.join(connection, &room_id).await?)),
        ClientEvent::LeaveRoom { room_id } => {
            hub.leave(connection, &room_id).await?;
            Ok(AckData::Done)
        }
        ClientEvent::SendMessage {
            room_id,
            body,
            kind,
            client_ref,
        } => {
            let message = hub
                .send(
                    connection,
                    OutgoingMessage {
                        room_id,
                        body,
                        kind,
                        client_ref,
                    },
                )
                .await?;
            Ok(AckData::Message(message))
        }
        ClientEvent::MarkSeen { room_id } => {
            hub.mark_seen(connection, &room_id).await?;
            Ok(AckData::Done)
        }
        ClientEvent::Typing { room_id } => {
            hub.typing(connection, &room_id, true).await;
            Ok(AckData::Done)
        }
        ClientEvent::StopTyping { room_id } => {
            hub.typing(connection, &room_id, false).await;
            Ok(AckData::Done)
        }
    }
}

async fn reply(state: &ServerState, connection: ConnectionId, event: ServerEvent) {
    state.hub.deliver(Audience::Connection(connection), event).await;
}
