use super::ServerState;
use crate::chat::{MessagePage, Room, RoomSummary};
use crate::entity::Identity;
use crate::error::{ChatError, ChatResult};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

/// Bearer token from an `Authorization` header, if any.
pub(crate) fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn caller(state: &ServerState, headers: &HeaderMap) -> ChatResult<Identity> {
    state.auth.authenticate(bearer(headers), None)
}

pub async fn health(State(state): State<ServerState>) -> Json<Value> {
    let (connections, active_rooms) = state.hub.load().await;
    Json(json!({
        "status": "ok",
        "online": state.hub.presence().online_count().await,
        "connections": connections,
        "active_rooms": active_rooms,
    }))
}

pub async fn participant_rooms(
    State(state): State<ServerState>,
    Path(participant_id): Path<String>,
    headers: HeaderMap,
) -> ChatResult<Json<Vec<RoomSummary>>> {
    let caller = caller(&state, &headers)?;
    if caller.id != participant_id {
        return Err(ChatError::Forbidden(
            "conversations can only be listed by their participant".into(),
        ));
    }
    Ok(Json(state.hub.room_summaries(&participant_id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: u32,
    pub page_size: Option<u32>,
}

pub async fn room_messages(
    State(state): State<ServerState>,
    Path(room_id): Path<String>,
    Query(query): Query<PageQuery>,
    headers: HeaderMap,
) -> ChatResult<Json<MessagePage>> {
    let caller = caller(&state, &headers)?;
    let page = state
        .hub
        .history(&caller, &room_id, query.page, query.page_size)
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
pub struct CreateRoom {
    pub user_id: String,
    pub vendor_id: String,
}

pub async fn create_room(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(request): Json<CreateRoom>,
) -> ChatResult<Json<Room>> {
    let caller = caller(&state, &headers)?;
    let room = state
        .hub
        .find_or_create_room(&caller, &request.user_id, &request.vendor_id)
        .await?;
    Ok(Json(room))
}

#[cfg(test)]
mod tests {
    use crate::auth::TrustingAuthenticator;
    use crate::chat::{MessagePage, Room, RoomSummary};
    use crate::realtime::test_support::{connect_as, hub};
    use crate::realtime::OutgoingMessage;
    use crate::entity::Identity;
    use crate::server::{ChatServer, Heartbeat};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde::de::DeserializeOwned;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app() -> (Router, Arc<crate::realtime::ChatHub>) {
        let hub = Arc::new(hub().await);
        let server = ChatServer::new(hub.clone(), Arc::new(TrustingAuthenticator), Heartbeat::default());
        (server.router(), hub)
    }

    fn get(uri: &str, bearer: &str) -> Request<Body> {
        Request::get(uri)
            .header("Authorization", format!("Bearer {}", bearer))
            .body(Body::empty())
            .unwrap()
    }

    async fn json<T: DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let (app, _hub) = app().await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn create_room_then_list_and_read_history() {
        let (app, hub) = app().await;

        let request = Request::post("/rooms")
            .header("Authorization", "Bearer user:u1")
            .header("Content-Type", "application/json")
            .body(Body::from(r#"{"user_id":"u1","vendor_id":"v1"}"#))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let room: Room = json(response).await;

        let (u, _rx) = connect_as(&hub, Identity::user("u1", "")).await;
        hub.join(u, &room.id).await.unwrap();
        hub.send(u, OutgoingMessage::text(&room.id, "Any sea view rooms left?"))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(get("/participants/v1/rooms", "vendor:v1"))
            .await
            .unwrap();
        let summaries: Vec<RoomSummary> = json(response).await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].unread, 1);
        assert!(summaries[0].peer_online);

        let uri = format!("/rooms/{}/messages?page=0&page_size=10", room.id);
        let response = app.oneshot(get(&uri, "vendor:v1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page: MessagePage = json(response).await;
        assert_eq!(page.messages.len(), 1);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let (app, hub) = app().await;
        let room = hub
            .find_or_create_room(&Identity::user("u1", ""), "u1", "v1")
            .await
            .unwrap();

        let missing_auth = Request::get("/participants/u1/rooms")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(missing_auth).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(get("/participants/u1/rooms", "user:u2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let uri = format!("/rooms/{}/messages", room.id);
        let response = app.clone().oneshot(get(&uri, "vendor:v2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(get("/rooms/nope/messages", "user:u1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = json(response).await;
        assert_eq!(body["error"], "room_not_found");
    }
}
