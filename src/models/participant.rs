use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageId, ParticipantId, RoomId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoomRole {
    Admin,
    Member,
}

/// One row per (user, room) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    #[serde(rename = "_id")]
    pub id: ParticipantId,
    pub user_id: UserId,
    pub room_id: RoomId,
    pub role: RoomRole,
    pub muted: bool,
    pub blocked: bool,
    pub joined_at: DateTime<Utc>,
    pub last_read_message_id: Option<MessageId>,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn new(user_id: UserId, room_id: RoomId, role: RoomRole) -> Self {
        Participant {
            id: 0,
            user_id,
            room_id,
            role,
            muted: false,
            blocked: false,
            joined_at: Utc::now(),
            last_read_message_id: None,
            online: false,
            last_seen: None,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == RoomRole::Admin
    }
}
