// src/error.rs

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

/// Every rejected chat operation resolves to one of these.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("User is not a participant of this chat room")]
    NotParticipant,

    #[error("You are muted in this chat room")]
    Muted,

    #[error("Only admins can perform this action")]
    NotAdmin,

    #[error("Cannot leave the room without an admin. Promote another participant first")]
    LastAdmin,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    /// Stable code sent to clients on REST and STOMP error replies.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::NotParticipant => "NOT_PARTICIPANT",
            ChatError::Muted => "MUTED",
            ChatError::NotAdmin => "NOT_ADMIN",
            ChatError::LastAdmin => "LAST_ADMIN",
            ChatError::NotFound(_) => "NOT_FOUND",
            ChatError::InvalidState(_) => "INVALID_STATE",
            ChatError::InvalidRequest(_) => "INVALID_REQUEST",
            ChatError::Forbidden(_) => "FORBIDDEN",
            ChatError::TransportFailure(_) => "TRANSPORT_FAILURE",
            ChatError::AuthFailure(_) => "AUTH_FAILURE",
            ChatError::Storage(_) => "STORAGE",
            ChatError::Config(_) => "CONFIG",
        }
    }

    /// Message safe to hand to a client. Storage and config details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ChatError::Storage(_) => "Internal storage error".to_string(),
            ChatError::Config(_) => "Internal server error".to_string(),
            ChatError::AuthFailure(_) => "Authentication failed".to_string(),
            _ => self.to_string(),
        }
    }

    pub fn not_found(what: &str) -> Self {
        ChatError::NotFound(what.to_string())
    }
}

impl ResponseError for ChatError {
    fn status_code(&self) -> StatusCode {
        match self {
            ChatError::NotParticipant
            | ChatError::Muted
            | ChatError::NotAdmin
            | ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::LastAdmin | ChatError::InvalidState(_) => StatusCode::CONFLICT,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::AuthFailure(_) => StatusCode::UNAUTHORIZED,
            ChatError::TransportFailure(_) => StatusCode::BAD_GATEWAY,
            ChatError::Storage(_) | ChatError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "status": "error",
            "code": self.code(),
            "message": self.public_message(),
        }))
    }
}

impl From<mongodb::error::Error> for ChatError {
    fn from(e: mongodb::error::Error) -> Self {
        ChatError::Storage(e.to_string())
    }
}

impl From<mongodb::bson::ser::Error> for ChatError {
    fn from(e: mongodb::bson::ser::Error) -> Self {
        ChatError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::InvalidRequest(e.to_string())
    }
}
