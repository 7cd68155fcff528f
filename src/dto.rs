// src/dto.rs
//
// Wire shapes. Each conversion is written out field by field.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{
    ChatMessage, ChatRoom, DeliveryStatus, MessageId, MessageStatus, MessageType, Participant,
    ParticipantId, RoomId, RoomRole, RoomType, User, UserId,
};

/// Envelope for every REST reply.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub status: &'static str,
    pub message: String,
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(message: &str, data: T) -> Self {
        ApiResponse {
            status: "success",
            message: message.to_string(),
            data: Some(data),
        }
    }
}

impl ApiResponse<()> {
    pub fn done(message: &str) -> Self {
        ApiResponse {
            status: "success",
            message: message.to_string(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDto {
    pub id: UserId,
    pub username: String,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    pub is_active: bool,
    pub is_locked: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserDto {
    fn from(user: &User) -> Self {
        UserDto {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            full_name: user.full_name.clone(),
            avatar_url: user.avatar_url.clone(),
            is_active: user.active,
            is_locked: user.locked,
            last_login: user.last_login,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDto {
    pub id: ParticipantId,
    pub user_id: UserId,
    pub chat_room_id: RoomId,
    pub role: RoomRole,
    pub muted: bool,
    pub blocked: bool,
    pub join_date: DateTime<Utc>,
    pub last_read_message_id: Option<MessageId>,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub username: Option<String>,
    pub display_name: Option<String>,
}

impl ParticipantDto {
    pub fn new(participant: &Participant, user: Option<&User>) -> Self {
        ParticipantDto {
            id: participant.id,
            user_id: participant.user_id,
            chat_room_id: participant.room_id,
            role: participant.role,
            muted: participant.muted,
            blocked: participant.blocked,
            join_date: participant.joined_at,
            last_read_message_id: participant.last_read_message_id,
            online: participant.online,
            last_seen: participant.last_seen,
            username: user.map(|u| u.username.clone()),
            display_name: user.map(|u| u.display_name().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageDto {
    pub id: MessageId,
    pub chat_room_id: RoomId,
    pub sender_id: Option<UserId>,
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub attachment_urls: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<MessageStatusDto>,
}

impl ChatMessageDto {
    pub fn new(message: &ChatMessage, sender: Option<&User>) -> Self {
        ChatMessageDto {
            id: message.id,
            chat_room_id: message.room_id,
            sender_id: message.sender_id,
            sender_name: sender.map(|u| u.username.clone()),
            content: message.content.clone(),
            message_type: message.message_type,
            timestamp: message.sent_at,
            edited_at: message.edited_at,
            attachment_urls: message.attachments.clone(),
            statuses: Vec::new(),
        }
    }

    pub fn with_statuses(mut self, statuses: &[MessageStatus]) -> Self {
        self.statuses = statuses.iter().map(MessageStatusDto::from).collect();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatusDto {
    pub user_received_id: UserId,
    pub user_sent_id: Option<UserId>,
    pub message_id: MessageId,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
}

impl From<&MessageStatus> for MessageStatusDto {
    fn from(s: &MessageStatus) -> Self {
        MessageStatusDto {
            user_received_id: s.receiver_id,
            user_sent_id: s.sender_id,
            message_id: s.message_id,
            status: s.status,
            timestamp: s.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoomDto {
    pub id: RoomId,
    pub name: String,
    #[serde(rename = "type")]
    pub room_type: RoomType,
    pub created_by: UserId,
    pub participants: Vec<ParticipantDto>,
    pub last_message_id: Option<MessageId>,
    pub last_message_content: Option<String>,
    pub last_message_sender_username: Option<String>,
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub last_message_type: Option<MessageType>,
    pub last_message_attachment_count: Option<usize>,
    pub created_at: DateTime<Utc>,
}

impl ChatRoomDto {
    pub fn new(
        room: &ChatRoom,
        participants: Vec<ParticipantDto>,
        last_message: Option<(&ChatMessage, Option<&User>)>,
    ) -> Self {
        ChatRoomDto {
            id: room.id,
            name: room.name.clone(),
            room_type: room.room_type,
            created_by: room.created_by,
            participants,
            last_message_id: room.last_message_id,
            last_message_content: last_message.map(|(m, _)| last_message_preview(m)),
            last_message_sender_username: last_message
                .and_then(|(_, sender)| sender.map(|u| u.username.clone())),
            last_message_timestamp: last_message.map(|(m, _)| m.sent_at),
            last_message_type: last_message.map(|(m, _)| m.message_type),
            last_message_attachment_count: last_message.map(|(m, _)| m.attachments.len()),
            created_at: room.created_at,
        }
    }
}

/// Sidebar preview of a room's latest message.
fn last_message_preview(message: &ChatMessage) -> String {
    match message.message_type {
        MessageType::Text => message.content.clone(),
        MessageType::Image => "[Image]".to_string(),
        MessageType::File => "[File]".to_string(),
        MessageType::System => format!("[System Message: {}]", message.content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_dto_uses_client_field_names() {
        let mut message = ChatMessage::new(4, Some(1), "hi", MessageType::Text);
        message.id = 9;
        let user = User::new("alice", None, Some("Alice A".into()), "x".into());
        let json = serde_json::to_value(ChatMessageDto::new(&message, Some(&user))).unwrap();
        assert_eq!(json["chatRoomId"], 4);
        assert_eq!(json["senderName"], "alice");
        assert_eq!(json["type"], "TEXT");
        assert!(json.get("statuses").is_none());
    }
}
