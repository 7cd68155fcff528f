// src/presence.rs
//
// Who is connected, and to which rooms they belong while connected.
// Transitions come only from transport connect/disconnect.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::RwLock;

use crate::error::ChatResult;
use crate::models::{RoomId, UserId};
use crate::repository::ParticipantRepository;

/// Presence state behind an interface so a shared store can replace the
/// in-process map without touching the router.
#[async_trait]
pub trait PresenceTracker: Send + Sync {
    /// Returns true when the user went from OFFLINE to ONLINE.
    async fn mark_online(&self, user_id: UserId) -> ChatResult<bool>;
    /// Returns the stamped last-seen time when the user went ONLINE to OFFLINE.
    async fn mark_offline(&self, user_id: UserId) -> Option<DateTime<Utc>>;
    async fn is_online(&self, user_id: UserId) -> bool;
    async fn is_online_in_room(&self, user_id: UserId, room_id: RoomId) -> bool;
    async fn rooms_for(&self, user_id: UserId) -> ChatResult<HashSet<RoomId>>;
    async fn last_seen(&self, user_id: UserId) -> Option<DateTime<Utc>>;
    /// Membership changed while the user may be connected.
    async fn track_room(&self, user_id: UserId, room_id: RoomId);
    async fn untrack_room(&self, user_id: UserId, room_id: RoomId);
    async fn forget_room(&self, room_id: RoomId);
}

#[derive(Debug, Default, Clone, PartialEq)]
struct PresenceEntry {
    online: bool,
    last_seen: Option<DateTime<Utc>>,
    rooms: HashSet<RoomId>,
}

pub struct InMemoryPresence {
    participants: Arc<dyn ParticipantRepository>,
    entries: RwLock<HashMap<UserId, PresenceEntry>>,
}

impl InMemoryPresence {
    pub fn new(participants: Arc<dyn ParticipantRepository>) -> Self {
        InMemoryPresence {
            participants,
            entries: RwLock::new(HashMap::new()),
        }
    }

    async fn load_rooms(&self, user_id: UserId) -> ChatResult<HashSet<RoomId>> {
        Ok(self
            .participants
            .list_by_user(user_id)
            .await?
            .into_iter()
            .map(|p| p.room_id)
            .collect())
    }
}

#[async_trait]
impl PresenceTracker for InMemoryPresence {
    async fn mark_online(&self, user_id: UserId) -> ChatResult<bool> {
        if self.is_online(user_id).await {
            return Ok(false);
        }
        let rooms = self.load_rooms(user_id).await?;

        let mut entries = self.entries.write().await;
        let entry = entries.entry(user_id).or_default();
        if entry.online {
            return Ok(false);
        }
        entry.online = true;
        entry.rooms = rooms;
        debug!("User {} online in {} rooms", user_id, entry.rooms.len());
        Ok(true)
    }

    async fn mark_offline(&self, user_id: UserId) -> Option<DateTime<Utc>> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&user_id)?;
        if !entry.online {
            return None;
        }
        let now = Utc::now();
        entry.online = false;
        entry.last_seen = Some(now);
        entry.rooms.clear();
        debug!("User {} offline", user_id);
        Some(now)
    }

    async fn is_online(&self, user_id: UserId) -> bool {
        self.entries
            .read()
            .await
            .get(&user_id)
            .map(|e| e.online)
            .unwrap_or(false)
    }

    async fn is_online_in_room(&self, user_id: UserId, room_id: RoomId) -> bool {
        self.entries
            .read()
            .await
            .get(&user_id)
            .map(|e| e.online && e.rooms.contains(&room_id))
            .unwrap_or(false)
    }

    async fn rooms_for(&self, user_id: UserId) -> ChatResult<HashSet<RoomId>> {
        if let Some(entry) = self.entries.read().await.get(&user_id) {
            if entry.online {
                return Ok(entry.rooms.clone());
            }
        }
        self.load_rooms(user_id).await
    }

    async fn last_seen(&self, user_id: UserId) -> Option<DateTime<Utc>> {
        self.entries.read().await.get(&user_id).and_then(|e| e.last_seen)
    }

    async fn track_room(&self, user_id: UserId, room_id: RoomId) {
        if let Some(entry) = self.entries.write().await.get_mut(&user_id) {
            if entry.online {
                entry.rooms.insert(room_id);
            }
        }
    }

    async fn untrack_room(&self, user_id: UserId, room_id: RoomId) {
        if let Some(entry) = self.entries.write().await.get_mut(&user_id) {
            entry.rooms.remove(&room_id);
        }
    }

    async fn forget_room(&self, room_id: RoomId) {
        for entry in self.entries.write().await.values_mut() {
            entry.rooms.remove(&room_id);
        }
    }
}
