use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageId, RoomId, UserId};

pub const MAX_CONTENT_LEN: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Text,
    Image,
    File,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub room_id: RoomId,
    /// None for SYSTEM messages.
    pub sender_id: Option<UserId>,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sent_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl ChatMessage {
    pub fn new(room_id: RoomId, sender_id: Option<UserId>, content: &str, message_type: MessageType) -> Self {
        ChatMessage {
            id: 0,
            room_id,
            sender_id,
            content: content.to_string(),
            message_type,
            sent_at: Utc::now(),
            edited_at: None,
            attachments: Vec::new(),
        }
    }

    pub fn system(room_id: RoomId, content: String) -> Self {
        ChatMessage::new(room_id, None, &content, MessageType::System)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Sent => 0,
            DeliveryStatus::Delivered => 1,
            DeliveryStatus::Read => 2,
        }
    }

    /// Statuses a row may currently hold for a forward move to `self`.
    pub fn predecessors(&self) -> Vec<DeliveryStatus> {
        [DeliveryStatus::Sent, DeliveryStatus::Delivered, DeliveryStatus::Read]
            .into_iter()
            .filter(|s| s.rank() < self.rank())
            .collect()
    }
}

/// Per (message, receiver) delivery state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStatus {
    #[serde(rename = "_id")]
    pub id: i64,
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub receiver_id: UserId,
    pub sender_id: Option<UserId>,
    pub status: DeliveryStatus,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predecessors_only_include_lower_ranks() {
        assert!(DeliveryStatus::Sent.predecessors().is_empty());
        assert_eq!(
            DeliveryStatus::Read.predecessors(),
            vec![DeliveryStatus::Sent, DeliveryStatus::Delivered]
        );
    }
}
