use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageId, RoomId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoomType {
    Personal,
    Group,
    Channel,
}

impl RoomType {
    /// Noun used in system messages ("added X to the group").
    pub fn noun(&self) -> &'static str {
        match self {
            RoomType::Personal => "chat",
            RoomType::Group => "group",
            RoomType::Channel => "channel",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRoom {
    #[serde(rename = "_id")]
    pub id: RoomId,
    pub name: String,
    #[serde(rename = "type")]
    pub room_type: RoomType,
    pub created_by: UserId,
    /// Unordered pair key, only set on PERSONAL rooms.
    pub personal_key: Option<String>,
    pub last_message_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatRoom {
    pub fn new(name: &str, room_type: RoomType, created_by: UserId) -> Self {
        let now = Utc::now();
        ChatRoom {
            id: 0,
            name: name.to_string(),
            room_type,
            created_by,
            personal_key: None,
            last_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn personal(name: &str, created_by: UserId, other: UserId) -> Self {
        let mut room = ChatRoom::new(name, RoomType::Personal, created_by);
        room.personal_key = Some(personal_key(created_by, other));
        room
    }

    pub fn is_personal(&self) -> bool {
        self.room_type == RoomType::Personal
    }
}

/// Same key for (a, b) and (b, a).
pub fn personal_key(a: UserId, b: UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}", lo, hi)
}
