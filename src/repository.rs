// src/repository.rs
//
// Persistence seams. Entities refer to each other by id only; every
// "related X" lookup goes through one of these traits.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ChatResult;
use crate::models::{
    ChatMessage, ChatRoom, DeliveryStatus, FcmToken, ImageDocument, MessageId, MessageStatus,
    Participant, ParticipantId, RoomId, RoomRole, User, UserId,
};

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Assigns the id. Fails when the username is taken.
    async fn insert(&self, user: User) -> ChatResult<User>;
    async fn find_by_id(&self, id: UserId) -> ChatResult<Option<User>>;
    async fn find_by_username(&self, username: &str) -> ChatResult<Option<User>>;
    async fn find_by_ids(&self, ids: &[UserId]) -> ChatResult<Vec<User>>;
    async fn search(&self, query: &str, limit: i64) -> ChatResult<Vec<User>>;
    async fn update_profile(
        &self,
        id: UserId,
        full_name: Option<String>,
        avatar_url: Option<String>,
    ) -> ChatResult<()>;
    async fn touch_login(&self, id: UserId, at: DateTime<Utc>) -> ChatResult<()>;
}

#[async_trait]
pub trait RoomRepository: Send + Sync {
    async fn insert(&self, room: ChatRoom) -> ChatResult<ChatRoom>;
    async fn find_by_id(&self, id: RoomId) -> ChatResult<Option<ChatRoom>>;
    async fn find_by_ids(&self, ids: &[RoomId]) -> ChatResult<Vec<ChatRoom>>;
    async fn find_personal(&self, personal_key: &str) -> ChatResult<Option<ChatRoom>>;
    async fn rename(&self, id: RoomId, name: &str) -> ChatResult<()>;
    /// Single-field write. Never re-saves the whole room.
    async fn update_last_message(&self, id: RoomId, message_id: Option<MessageId>) -> ChatResult<()>;
    async fn delete(&self, id: RoomId) -> ChatResult<()>;
}

#[async_trait]
pub trait ParticipantRepository: Send + Sync {
    /// Fails when the (user, room) pair already exists.
    async fn insert(&self, participant: Participant) -> ChatResult<Participant>;
    async fn find(&self, user_id: UserId, room_id: RoomId) -> ChatResult<Option<Participant>>;
    async fn find_by_id(&self, id: ParticipantId) -> ChatResult<Option<Participant>>;
    async fn list_by_room(&self, room_id: RoomId) -> ChatResult<Vec<Participant>>;
    async fn list_by_user(&self, user_id: UserId) -> ChatResult<Vec<Participant>>;
    async fn count_admins(&self, room_id: RoomId) -> ChatResult<u64>;
    async fn set_role(&self, id: ParticipantId, role: RoomRole) -> ChatResult<()>;
    async fn set_flags(&self, id: ParticipantId, muted: bool, blocked: bool) -> ChatResult<()>;
    async fn set_last_read(&self, id: ParticipantId, message_id: MessageId) -> ChatResult<()>;
    /// Updates every membership row of the user.
    async fn set_presence(
        &self,
        user_id: UserId,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    ) -> ChatResult<()>;
    async fn delete(&self, id: ParticipantId) -> ChatResult<()>;
    async fn delete_by_room(&self, room_id: RoomId) -> ChatResult<()>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Ids increase with insertion order.
    async fn insert(&self, message: ChatMessage) -> ChatResult<ChatMessage>;
    async fn find_by_id(&self, id: MessageId) -> ChatResult<Option<ChatMessage>>;
    async fn find_by_ids(&self, ids: &[MessageId]) -> ChatResult<Vec<ChatMessage>>;
    /// Oldest first.
    async fn page(&self, room_id: RoomId, page: u64, size: u64) -> ChatResult<Vec<ChatMessage>>;
    async fn latest(&self, room_id: RoomId) -> ChatResult<Option<ChatMessage>>;
    async fn update_content(&self, id: MessageId, content: &str, at: DateTime<Utc>) -> ChatResult<()>;
    async fn delete(&self, id: MessageId) -> ChatResult<()>;
    async fn delete_by_room(&self, room_id: RoomId) -> ChatResult<()>;
}

#[async_trait]
pub trait MessageStatusRepository: Send + Sync {
    async fn find(&self, message_id: MessageId, receiver_id: UserId) -> ChatResult<Option<MessageStatus>>;
    /// Returns None when a row for the pair already exists.
    async fn insert_if_absent(&self, status: MessageStatus) -> ChatResult<Option<MessageStatus>>;
    /// Conditional move: only applies while the stored status is one of `from`.
    async fn advance(
        &self,
        message_id: MessageId,
        receiver_id: UserId,
        from: &[DeliveryStatus],
        to: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> ChatResult<Option<MessageStatus>>;
    async fn list_by_message(&self, message_id: MessageId) -> ChatResult<Vec<MessageStatus>>;
    async fn delete_by_message(&self, message_id: MessageId) -> ChatResult<()>;
    async fn delete_by_room(&self, room_id: RoomId) -> ChatResult<()>;
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Assigns the id.
    async fn save(&self, image: ImageDocument) -> ChatResult<ImageDocument>;
    async fn find(&self, id: &str) -> ChatResult<Option<ImageDocument>>;
    async fn link_message(&self, id: &str, message_id: MessageId) -> ChatResult<()>;
}

#[async_trait]
pub trait PushTokenRepository: Send + Sync {
    /// Registers or reassigns the token to `user_id` and marks it active.
    async fn upsert(&self, user_id: UserId, token: &str, device_type: Option<String>) -> ChatResult<FcmToken>;
    async fn active_for_users(&self, user_ids: &[UserId]) -> ChatResult<Vec<FcmToken>>;
    async fn deactivate(&self, token: &str) -> ChatResult<()>;
    async fn deactivate_for_user(&self, user_id: UserId, token: Option<&str>) -> ChatResult<u64>;
}

/// Every repository the chat core reads or writes.
#[derive(Clone)]
pub struct Store {
    pub users: Arc<dyn UserRepository>,
    pub rooms: Arc<dyn RoomRepository>,
    pub participants: Arc<dyn ParticipantRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub statuses: Arc<dyn MessageStatusRepository>,
    pub images: Arc<dyn ImageStore>,
    pub push_tokens: Arc<dyn PushTokenRepository>,
}

impl Store {
    /// One backend behind every seam.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: UserRepository
            + RoomRepository
            + ParticipantRepository
            + MessageRepository
            + MessageStatusRepository
            + ImageStore
            + PushTokenRepository
            + 'static,
    {
        Store {
            users: backend.clone(),
            rooms: backend.clone(),
            participants: backend.clone(),
            messages: backend.clone(),
            statuses: backend.clone(),
            images: backend.clone(),
            push_tokens: backend,
        }
    }
}
