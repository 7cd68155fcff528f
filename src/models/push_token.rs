use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;

/// Device token for the push provider. Deactivated, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FcmToken {
    #[serde(rename = "_id")]
    pub id: i64,
    pub user_id: UserId,
    pub token: String,
    pub device_type: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
