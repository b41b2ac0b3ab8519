use crate::entity::Identity;
use crate::protocol::{AckData, ClientEvent, ClientFrame, ServerEvent};
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

/// Backoff between reconnect attempts: `initial_delay`, doubling, capped.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Socket (re)opened; register and re-join have been sent.
    Connected,
    Disconnected,
    Server(ServerEvent),
    /// A frame that could not be written because the socket was down.
    Undelivered(ClientFrame),
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// `ws://host:port/ws`, optionally with `?token=`.
    pub url: String,
    pub identity: Identity,
    pub token: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub request_timeout: Duration,
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<ServerEvent>>>>;

/// Persistent socket to the chat hub that survives drops.
///
/// Outgoing frames are queued to a background task which owns the socket and
/// reconnects according to the [`ReconnectPolicy`], re-registering and
/// re-joining the room last marked open.
pub struct ChatConnection {
    tx_frame: mpsc::UnboundedSender<ClientFrame>,
    pending: PendingAcks,
    ack_counter: Arc<AtomicU64>,
    open_room: Arc<Mutex<Option<String>>>,
    request_timeout: Duration,
    task: JoinHandle<()>,
}

impl ChatConnection {
    pub fn spawn(config: ConnectionConfig) -> (Self, ConnectionEvents) {
        let (tx_frame, rx_frame) = mpsc::unbounded_channel();
        let (tx_event, rx_event) = mpsc::unbounded_channel();
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let open_room = Arc::new(Mutex::new(None));

        let request_timeout = config.request_timeout;
        let task = tokio::spawn(run(
            config,
            rx_frame,
            tx_event,
            pending.clone(),
            open_room.clone(),
        ));

        let connection = Self {
            tx_frame,
            pending,
            ack_counter: Arc::new(AtomicU64::new(1)),
            open_room,
            request_timeout,
            task,
        };
        (connection, ConnectionEvents { rx: rx_event })
    }

    pub fn next_ack(&self) -> u64 {
        self.ack_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue a frame without waiting for anything.
    pub fn emit(&self, frame: ClientFrame) -> Result<()> {
        self.tx_frame
            .send(frame)
            .map_err(|_| anyhow::anyhow!("Connection task has stopped"))
    }

    /// Send an event and wait for its acknowledgement.
    pub async fn request(&self, event: ClientEvent) -> Result<AckData> {
        let ack = self.next_ack();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(ack, tx);

        if let Err(e) = self.emit(ClientFrame::with_ack(ack, event)) {
            self.pending.lock().await.remove(&ack);
            return Err(e);
        }

        let reply = match timeout(self.request_timeout, rx).await {
            Ok(reply) => reply.context("Connection dropped before the ack arrived")?,
            Err(_) => {
                self.pending.lock().await.remove(&ack);
                anyhow::bail!("Timed out waiting for ack {}", ack);
            }
        };

        match reply {
            ServerEvent::Ack {
                ok: true, data, ..
            } => Ok(data.unwrap_or(AckData::Done)),
            ServerEvent::Ack {
                error: Some(error), ..
            } => anyhow::bail!("{} ({})", error.message, error.code),
            other => anyhow::bail!("Unexpected reply to ack {}: {}", ack, other.name()),
        }
    }

    /// Room to re-join after a reconnect.
    pub async fn set_open_room(&self, room_id: Option<String>) {
        *self.open_room.lock().await = room_id;
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for ChatConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct ConnectionEvents {
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl ConnectionEvents {
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }
}

async fn run(
    config: ConnectionConfig,
    mut rx_frame: mpsc::UnboundedReceiver<ClientFrame>,
    tx_event: mpsc::UnboundedSender<ConnectionEvent>,
    pending: PendingAcks,
    open_room: Arc<Mutex<Option<String>>>,
) {
    let mut attempt: u32 = 0;

    loop {
        match connect_async(config.url.as_str()).await {
            Ok((socket, _)) => {
                attempt = 0;
                info!(url = %config.url, participant = %config.identity.id, "Chat socket connected");
                let (mut sink, mut stream) = socket.split();

                let mut handshake = vec![ClientFrame::new(ClientEvent::Register {
                    identity: config.identity.clone(),
                    token: config.token.clone(),
                })];
                if let Some(room_id) = open_room.lock().await.clone() {
                    handshake.push(ClientFrame::new(ClientEvent::JoinRoom { room_id }));
                }
                let mut healthy = true;
                for frame in handshake {
                    if send_frame(&mut sink, &frame).await.is_err() {
                        healthy = false;
                        break;
                    }
                }

                if healthy {
                    let _ = tx_event.send(ConnectionEvent::Connected);
                    loop {
                        tokio::select! {
                            frame = rx_frame.recv() => {
                                let Some(frame) = frame else {
                                    let _ = sink.close().await;
                                    return;
                                };
                                if send_frame(&mut sink, &frame).await.is_err() {
                                    let _ = tx_event.send(ConnectionEvent::Undelivered(frame));
                                    break;
                                }
                            }
                            incoming = stream.next() => match incoming {
                                Some(Ok(WsMessage::Text(text))) => {
                                    route(&text, &tx_event, &pending).await;
                                }
                                Some(Ok(WsMessage::Ping(payload))) => {
                                    let _ = sink.send(WsMessage::Pong(payload)).await;
                                }
                                Some(Ok(WsMessage::Close(_))) | None => break,
                                Some(Err(e)) => {
                                    debug!("Chat socket error: {}", e);
                                    break;
                                }
                                Some(Ok(_)) => {}
                            }
                        }
                    }
                }

                // Waiters for acks on the dead socket get a closed channel.
                pending.lock().await.clear();
                warn!(url = %config.url, "Chat socket disconnected");
                let _ = tx_event.send(ConnectionEvent::Disconnected);
            }
            Err(e) => {
                debug!(url = %config.url, attempt, "Chat socket connect failed: {}", e);
            }
        }

        let delay = config.reconnect.delay(attempt);
        attempt = attempt.saturating_add(1);
        let deadline = Instant::now() + delay;

        // Nothing can be written while down; hand frames back to the caller.
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                frame = rx_frame.recv() => match frame {
                    Some(frame) => {
                        let _ = tx_event.send(ConnectionEvent::Undelivered(frame));
                    }
                    None => return,
                },
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &ClientFrame) -> Result<()>
where
    S: futures::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(frame).context("Failed to serialize client frame")?;
    sink.send(WsMessage::Text(text))
        .await
        .context("Failed to write to chat socket")
}

async fn route(text: &str, tx_event: &mpsc::UnboundedSender<ConnectionEvent>, pending: &PendingAcks) {
    let event = match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            warn!("Unparseable frame from chat service: {}", e);
            return;
        }
    };

    if let ServerEvent::Ack { ack, .. } = &event {
        let waiter = pending.lock().await.remove(ack);
        if let Some(waiter) = waiter {
            let _ = waiter.send(event);
            return;
        }
    }
    let _ = tx_event.send(ConnectionEvent::Server(event));
}
