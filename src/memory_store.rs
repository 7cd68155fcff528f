// src/memory_store.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::models::{
    ChatMessage, ChatRoom, DeliveryStatus, FcmToken, ImageDocument, MessageId, MessageStatus,
    Participant, ParticipantId, RoomId, RoomRole, User, UserId,
};
use crate::repository::{
    ImageStore, MessageRepository, MessageStatusRepository, ParticipantRepository,
    PushTokenRepository, RoomRepository, UserRepository,
};

/// Process-local backend, selected with STORE_BACKEND=memory and used by tests.
#[derive(Default)]
pub struct InMemoryStore {
    next_id: AtomicI64,
    users: RwLock<HashMap<UserId, User>>,
    rooms: RwLock<HashMap<RoomId, ChatRoom>>,
    participants: RwLock<HashMap<ParticipantId, Participant>>,
    messages: RwLock<HashMap<MessageId, ChatMessage>>,
    statuses: RwLock<HashMap<(MessageId, UserId), MessageStatus>>,
    images: RwLock<HashMap<String, ImageDocument>>,
    push_tokens: RwLock<HashMap<String, FcmToken>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Stalls every participant read and write until the guard drops.
    #[cfg(test)]
    pub async fn hold_participants(
        &self,
    ) -> tokio::sync::RwLockWriteGuard<'_, HashMap<ParticipantId, Participant>> {
        self.participants.write().await
    }
}

#[async_trait]
impl UserRepository for InMemoryStore {
    async fn insert(&self, mut user: User) -> ChatResult<User> {
        let mut users = self.users.write().await;
        if users.values().any(|u| u.username == user.username) {
            return Err(ChatError::InvalidRequest(format!(
                "Username '{}' is already taken",
                user.username
            )));
        }
        user.id = self.allocate_id();
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_by_id(&self, id: UserId) -> ChatResult<Option<User>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> ChatResult<Option<User>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn find_by_ids(&self, ids: &[UserId]) -> ChatResult<Vec<User>> {
        let users = self.users.read().await;
        Ok(ids.iter().filter_map(|id| users.get(id).cloned()).collect())
    }

    async fn search(&self, query: &str, limit: i64) -> ChatResult<Vec<User>> {
        let needle = query.to_lowercase();
        let users = self.users.read().await;
        let mut found: Vec<User> = users
            .values()
            .filter(|u| {
                u.username.to_lowercase().contains(&needle)
                    || u
                        .full_name
                        .as_deref()
                        .map(|n| n.to_lowercase().contains(&needle))
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        found.sort_by_key(|u| u.id);
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn update_profile(
        &self,
        id: UserId,
        full_name: Option<String>,
        avatar_url: Option<String>,
    ) -> ChatResult<()> {
        let mut users = self.users.write().await;
        let user = users.get_mut(&id).ok_or_else(|| ChatError::not_found("User"))?;
        if full_name.is_some() {
            user.full_name = full_name;
        }
        if avatar_url.is_some() {
            user.avatar_url = avatar_url;
        }
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn touch_login(&self, id: UserId, at: DateTime<Utc>) -> ChatResult<()> {
        if let Some(user) = self.users.write().await.get_mut(&id) {
            user.last_login = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl RoomRepository for InMemoryStore {
    async fn insert(&self, mut room: ChatRoom) -> ChatResult<ChatRoom> {
        let mut rooms = self.rooms.write().await;
        if let Some(key) = &room.personal_key {
            if rooms.values().any(|r| r.personal_key.as_ref() == Some(key)) {
                return Err(ChatError::InvalidState("Personal chat already exists".into()));
            }
        }
        room.id = self.allocate_id();
        rooms.insert(room.id, room.clone());
        Ok(room)
    }

    async fn find_by_id(&self, id: RoomId) -> ChatResult<Option<ChatRoom>> {
        Ok(self.rooms.read().await.get(&id).cloned())
    }

    async fn find_by_ids(&self, ids: &[RoomId]) -> ChatResult<Vec<ChatRoom>> {
        let rooms = self.rooms.read().await;
        Ok(ids.iter().filter_map(|id| rooms.get(id).cloned()).collect())
    }

    async fn find_personal(&self, personal_key: &str) -> ChatResult<Option<ChatRoom>> {
        Ok(self
            .rooms
            .read()
            .await
            .values()
            .find(|r| r.personal_key.as_deref() == Some(personal_key))
            .cloned())
    }

    async fn rename(&self, id: RoomId, name: &str) -> ChatResult<()> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(&id).ok_or_else(|| ChatError::not_found("Chat room"))?;
        room.name = name.to_string();
        room.updated_at = Utc::now();
        Ok(())
    }

    async fn update_last_message(&self, id: RoomId, message_id: Option<MessageId>) -> ChatResult<()> {
        if let Some(room) = self.rooms.write().await.get_mut(&id) {
            room.last_message_id = message_id;
        }
        Ok(())
    }

    async fn delete(&self, id: RoomId) -> ChatResult<()> {
        self.rooms.write().await.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl ParticipantRepository for InMemoryStore {
    async fn insert(&self, mut participant: Participant) -> ChatResult<Participant> {
        let mut participants = self.participants.write().await;
        if participants
            .values()
            .any(|p| p.user_id == participant.user_id && p.room_id == participant.room_id)
        {
            return Err(ChatError::InvalidState(
                "User is already a participant in this chat room".into(),
            ));
        }
        participant.id = self.allocate_id();
        participants.insert(participant.id, participant.clone());
        Ok(participant)
    }

    async fn find(&self, user_id: UserId, room_id: RoomId) -> ChatResult<Option<Participant>> {
        Ok(self
            .participants
            .read()
            .await
            .values()
            .find(|p| p.user_id == user_id && p.room_id == room_id)
            .cloned())
    }

    async fn find_by_id(&self, id: ParticipantId) -> ChatResult<Option<Participant>> {
        Ok(self.participants.read().await.get(&id).cloned())
    }

    async fn list_by_room(&self, room_id: RoomId) -> ChatResult<Vec<Participant>> {
        let mut found: Vec<Participant> = self
            .participants
            .read()
            .await
            .values()
            .filter(|p| p.room_id == room_id)
            .cloned()
            .collect();
        found.sort_by_key(|p| p.id);
        Ok(found)
    }

    async fn list_by_user(&self, user_id: UserId) -> ChatResult<Vec<Participant>> {
        let mut found: Vec<Participant> = self
            .participants
            .read()
            .await
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by_key(|p| p.id);
        Ok(found)
    }

    async fn count_admins(&self, room_id: RoomId) -> ChatResult<u64> {
        Ok(self
            .participants
            .read()
            .await
            .values()
            .filter(|p| p.room_id == room_id && p.is_admin())
            .count() as u64)
    }

    async fn set_role(&self, id: ParticipantId, role: RoomRole) -> ChatResult<()> {
        let mut participants = self.participants.write().await;
        let p = participants
            .get_mut(&id)
            .ok_or_else(|| ChatError::not_found("Participant"))?;
        p.role = role;
        Ok(())
    }

    async fn set_flags(&self, id: ParticipantId, muted: bool, blocked: bool) -> ChatResult<()> {
        let mut participants = self.participants.write().await;
        let p = participants
            .get_mut(&id)
            .ok_or_else(|| ChatError::not_found("Participant"))?;
        p.muted = muted;
        p.blocked = blocked;
        Ok(())
    }

    async fn set_last_read(&self, id: ParticipantId, message_id: MessageId) -> ChatResult<()> {
        let mut participants = self.participants.write().await;
        let p = participants
            .get_mut(&id)
            .ok_or_else(|| ChatError::not_found("Participant"))?;
        p.last_read_message_id = Some(message_id);
        Ok(())
    }

    async fn set_presence(
        &self,
        user_id: UserId,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    ) -> ChatResult<()> {
        for p in self
            .participants
            .write()
            .await
            .values_mut()
            .filter(|p| p.user_id == user_id)
        {
            p.online = online;
            if last_seen.is_some() {
                p.last_seen = last_seen;
            }
        }
        Ok(())
    }

    async fn delete(&self, id: ParticipantId) -> ChatResult<()> {
        self.participants.write().await.remove(&id);
        Ok(())
    }

    async fn delete_by_room(&self, room_id: RoomId) -> ChatResult<()> {
        self.participants
            .write()
            .await
            .retain(|_, p| p.room_id != room_id);
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for InMemoryStore {
    async fn insert(&self, mut message: ChatMessage) -> ChatResult<ChatMessage> {
        let mut messages = self.messages.write().await;
        message.id = self.allocate_id();
        messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn find_by_id(&self, id: MessageId) -> ChatResult<Option<ChatMessage>> {
        Ok(self.messages.read().await.get(&id).cloned())
    }

    async fn find_by_ids(&self, ids: &[MessageId]) -> ChatResult<Vec<ChatMessage>> {
        let messages = self.messages.read().await;
        Ok(ids.iter().filter_map(|id| messages.get(id).cloned()).collect())
    }

    async fn page(&self, room_id: RoomId, page: u64, size: u64) -> ChatResult<Vec<ChatMessage>> {
        let Some(offset) = page.checked_mul(size).and_then(|o| usize::try_from(o).ok()) else {
            return Ok(Vec::new());
        };
        let mut found: Vec<ChatMessage> = self
            .messages
            .read()
            .await
            .values()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.id);
        Ok(found
            .into_iter()
            .skip(offset)
            .take(size as usize)
            .collect())
    }

    async fn latest(&self, room_id: RoomId) -> ChatResult<Option<ChatMessage>> {
        Ok(self
            .messages
            .read()
            .await
            .values()
            .filter(|m| m.room_id == room_id)
            .max_by_key(|m| m.id)
            .cloned())
    }

    async fn update_content(&self, id: MessageId, content: &str, at: DateTime<Utc>) -> ChatResult<()> {
        let mut messages = self.messages.write().await;
        let m = messages
            .get_mut(&id)
            .ok_or_else(|| ChatError::not_found("Message"))?;
        m.content = content.to_string();
        m.edited_at = Some(at);
        Ok(())
    }

    async fn delete(&self, id: MessageId) -> ChatResult<()> {
        self.messages.write().await.remove(&id);
        Ok(())
    }

    async fn delete_by_room(&self, room_id: RoomId) -> ChatResult<()> {
        self.messages.write().await.retain(|_, m| m.room_id != room_id);
        Ok(())
    }
}

#[async_trait]
impl MessageStatusRepository for InMemoryStore {
    async fn find(&self, message_id: MessageId, receiver_id: UserId) -> ChatResult<Option<MessageStatus>> {
        Ok(self
            .statuses
            .read()
            .await
            .get(&(message_id, receiver_id))
            .cloned())
    }

    async fn insert_if_absent(&self, mut status: MessageStatus) -> ChatResult<Option<MessageStatus>> {
        let mut statuses = self.statuses.write().await;
        let key = (status.message_id, status.receiver_id);
        if statuses.contains_key(&key) {
            return Ok(None);
        }
        status.id = self.allocate_id();
        statuses.insert(key, status.clone());
        Ok(Some(status))
    }

    async fn advance(
        &self,
        message_id: MessageId,
        receiver_id: UserId,
        from: &[DeliveryStatus],
        to: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> ChatResult<Option<MessageStatus>> {
        let mut statuses = self.statuses.write().await;
        match statuses.get_mut(&(message_id, receiver_id)) {
            Some(row) if from.contains(&row.status) => {
                row.status = to;
                row.updated_at = at;
                Ok(Some(row.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_by_message(&self, message_id: MessageId) -> ChatResult<Vec<MessageStatus>> {
        let mut found: Vec<MessageStatus> = self
            .statuses
            .read()
            .await
            .values()
            .filter(|s| s.message_id == message_id)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.id);
        Ok(found)
    }

    async fn delete_by_message(&self, message_id: MessageId) -> ChatResult<()> {
        self.statuses
            .write()
            .await
            .retain(|(m, _), _| *m != message_id);
        Ok(())
    }

    async fn delete_by_room(&self, room_id: RoomId) -> ChatResult<()> {
        self.statuses.write().await.retain(|_, s| s.room_id != room_id);
        Ok(())
    }
}

#[async_trait]
impl ImageStore for InMemoryStore {
    async fn save(&self, mut image: ImageDocument) -> ChatResult<ImageDocument> {
        image.id = Uuid::new_v4().to_string();
        self.images
            .write()
            .await
            .insert(image.id.clone(), image.clone());
        Ok(image)
    }

    async fn find(&self, id: &str) -> ChatResult<Option<ImageDocument>> {
        Ok(self.images.read().await.get(id).cloned())
    }

    async fn link_message(&self, id: &str, message_id: MessageId) -> ChatResult<()> {
        let mut images = self.images.write().await;
        let image = images.get_mut(id).ok_or_else(|| ChatError::not_found("Image"))?;
        image.message_id = Some(message_id);
        Ok(())
    }
}

#[async_trait]
impl PushTokenRepository for InMemoryStore {
    async fn upsert(&self, user_id: UserId, token: &str, device_type: Option<String>) -> ChatResult<FcmToken> {
        let mut tokens = self.push_tokens.write().await;
        let now = Utc::now();
        if let Some(existing) = tokens.get_mut(token) {
            existing.user_id = user_id;
            existing.active = true;
            if device_type.is_some() {
                existing.device_type = device_type;
            }
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let fresh = FcmToken {
            id: self.allocate_id(),
            user_id,
            token: token.to_string(),
            device_type,
            active: true,
            created_at: now,
            updated_at: now,
        };
        tokens.insert(token.to_string(), fresh.clone());
        Ok(fresh)
    }

    async fn active_for_users(&self, user_ids: &[UserId]) -> ChatResult<Vec<FcmToken>> {
        let mut found: Vec<FcmToken> = self
            .push_tokens
            .read()
            .await
            .values()
            .filter(|t| t.active && user_ids.contains(&t.user_id))
            .cloned()
            .collect();
        found.sort_by_key(|t| t.id);
        Ok(found)
    }

    async fn deactivate(&self, token: &str) -> ChatResult<()> {
        if let Some(t) = self.push_tokens.write().await.get_mut(token) {
            t.active = false;
            t.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn deactivate_for_user(&self, user_id: UserId, token: Option<&str>) -> ChatResult<u64> {
        let mut count = 0;
        for t in self.push_tokens.write().await.values_mut() {
            let matches = t.user_id == user_id && token.map(|tok| tok == t.token).unwrap_or(true);
            if matches && t.active {
                t.active = false;
                t.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_web::test]
    async fn advance_only_moves_from_allowed_states() {
        let store = InMemoryStore::new();
        let row = MessageStatus {
            id: 0,
            message_id: 10,
            room_id: 1,
            receiver_id: 2,
            sender_id: Some(1),
            status: DeliveryStatus::Read,
            updated_at: Utc::now(),
        };
        store.insert_if_absent(row.clone()).await.unwrap();
        assert!(store.insert_if_absent(row).await.unwrap().is_none());

        let moved = store
            .advance(10, 2, &DeliveryStatus::Delivered.predecessors(), DeliveryStatus::Delivered, Utc::now())
            .await
            .unwrap();
        assert!(moved.is_none());
        let stored = MessageStatusRepository::find(&store, 10, 2).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Read);
    }

    #[actix_web::test]
    async fn reassigned_push_token_is_reactivated() {
        let store = InMemoryStore::new();
        store.upsert(1, "tok-a", Some("web".into())).await.unwrap();
        store.deactivate("tok-a").await.unwrap();
        let moved = store.upsert(2, "tok-a", None).await.unwrap();
        assert_eq!(moved.user_id, 2);
        assert!(moved.active);
        assert_eq!(moved.device_type.as_deref(), Some("web"));
        assert!(store.active_for_users(&[1]).await.unwrap().is_empty());
    }
}
