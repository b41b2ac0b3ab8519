//! HTTP surface of the chat service: the socket endpoint plus a few REST reads
//! the client uses for its sidebar and history.

pub mod rest;
pub mod ws;

use crate::auth::Authenticator;
use crate::realtime::ChatHub;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Socket liveness settings.
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    /// How often the server pings each socket.
    pub interval: Duration,
    /// A socket silent for this long is closed.
    pub timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(45),
        }
    }
}

#[derive(Clone)]
pub struct ServerState {
    pub hub: Arc<ChatHub>,
    pub auth: Arc<dyn Authenticator>,
    pub heartbeat: Heartbeat,
}

pub struct ChatServer {
    state: ServerState,
}

impl ChatServer {
    pub fn new(hub: Arc<ChatHub>, auth: Arc<dyn Authenticator>, heartbeat: Heartbeat) -> Self {
        Self {
            state: ServerState {
                hub,
                auth,
                heartbeat,
            },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(rest::health))
            .route(
                "/participants/:participant_id/rooms",
                get(rest::participant_rooms),
            )
            .route("/rooms", post(rest::create_room))
            .route("/rooms/:room_id/messages", get(rest::room_messages))
            .route("/ws", get(ws::upgrade))
            .with_state(self.state.clone())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }
}
