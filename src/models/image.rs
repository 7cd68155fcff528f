use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{MessageId, RoomId, UserId};

/// Uploaded image blob plus metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ImageDocument {
    pub id: String,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    #[serde(skip)]
    pub data: Vec<u8>,
    pub uploaded_by: UserId,
    pub room_id: RoomId,
    pub message_id: Option<MessageId>,
    pub uploaded_at: DateTime<Utc>,
}
