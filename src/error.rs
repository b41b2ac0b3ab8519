use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Failures surfaced at the socket and HTTP boundary. Each one ends the single
/// operation that produced it and nothing else.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("connection is not registered")]
    NotRegistered,

    #[error("connection has not joined room {0}")]
    NotJoined(String),

    #[error("room not found")]
    RoomNotFound,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl ChatError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::Unauthorized | ChatError::NotRegistered => StatusCode::UNAUTHORIZED,
            ChatError::Forbidden(_) | ChatError::NotJoined(_) => StatusCode::FORBIDDEN,
            ChatError::RoomNotFound => StatusCode::NOT_FOUND,
            ChatError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Unauthorized => "unauthorized",
            ChatError::Forbidden(_) => "forbidden",
            ChatError::NotRegistered => "not_registered",
            ChatError::NotJoined(_) => "not_joined",
            ChatError::RoomNotFound => "room_not_found",
            ChatError::BadRequest(_) => "bad_request",
            ChatError::Storage(_) => "storage",
        }
    }

    /// Storage details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            ChatError::Storage(_) => "message could not be saved".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        if let ChatError::Storage(e) = &self {
            tracing::error!(error = %format!("{:#}", e), "storage failure while serving request");
        }
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.client_message(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_details_are_not_leaked() {
        let err = ChatError::Storage(anyhow::anyhow!("disk I/O error at /var/lib/chat.db"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.client_message().contains("/var/lib"));
        assert_eq!(
            ChatError::NotJoined("r1".into()).status_code(),
            StatusCode::FORBIDDEN
        );
    }
}
