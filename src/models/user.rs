use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;

/// Identity anchor for rooms, participants and messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub username: String,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    pub password_hash: String,
    pub active: bool,
    pub locked: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: &str, email: Option<String>, full_name: Option<String>, password_hash: String) -> Self {
        let now = Utc::now();
        User {
            id: 0,
            username: username.to_string(),
            email,
            full_name,
            avatar_url: None,
            password_hash,
            active: true,
            locked: false,
            last_login: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Full name when set, username otherwise.
    pub fn display_name(&self) -> &str {
        match self.full_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.username,
        }
    }
}
