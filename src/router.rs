// src/router.rs
//
// Decides what gets published where. Every user-visible realtime event
// leaves the process through FanoutRouter.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use serde::Serialize;
use serde_json::{json, Value};

use crate::dto::{ChatMessageDto, ChatRoomDto, ParticipantDto};
use crate::error::{ChatError, ChatResult};
use crate::models::{DeliveryStatus, MessageId, RoomId, UserId};
use crate::presence::PresenceTracker;

/// Broker seam. The actor broker implements it in production.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, destination: &str, payload: Value) -> ChatResult<()>;
    /// Delivers to every session of `username` subscribed to `/user{destination}`.
    async fn send_to_user(&self, username: &str, destination: &str, payload: Value) -> ChatResult<()>;
}

pub mod destinations {
    use crate::models::{RoomId, UserId};

    pub const ROOM_PREFIX: &str = "/topic/chat/";
    pub const MESSAGE_FEED: &str = "/topic/message-notifications";
    pub const CHAT_UPDATES: &str = "/topic/chat-updates";
    pub const USER_PREFIX: &str = "/user";
    pub const ERRORS_QUEUE: &str = "/queue/errors";
    pub const CHAT_UPDATES_QUEUE: &str = "/queue/chat-updates";

    pub fn room(room_id: RoomId) -> String {
        format!("{}{}", ROOM_PREFIX, room_id)
    }

    pub fn room_typing(room_id: RoomId) -> String {
        format!("{}{}/typing", ROOM_PREFIX, room_id)
    }

    pub fn room_status(room_id: RoomId) -> String {
        format!("{}{}/status", ROOM_PREFIX, room_id)
    }

    pub fn room_updates(room_id: RoomId) -> String {
        format!("{}{}/updates", ROOM_PREFIX, room_id)
    }

    pub fn room_events(room_id: RoomId) -> String {
        format!("{}{}/events", ROOM_PREFIX, room_id)
    }

    pub fn user_status(user_id: UserId) -> String {
        format!("/topic/user/{}/status", user_id)
    }

    /// Room id of any room-scoped topic, e.g. `/topic/chat/7/typing` -> 7.
    pub fn room_of(destination: &str) -> Option<RoomId> {
        let rest = destination.strip_prefix(ROOM_PREFIX)?;
        rest.split('/').next()?.parse().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomEvent {
    Joined,
    Left,
}

impl RoomEvent {
    fn kind(&self) -> &'static str {
        match self {
            RoomEvent::Joined => "user_joined",
            RoomEvent::Left => "user_left",
        }
    }
}

pub struct FanoutRouter {
    transport: Arc<dyn Transport>,
    presence: Arc<dyn PresenceTracker>,
}

fn to_payload<T: Serialize>(value: &T) -> ChatResult<Value> {
    serde_json::to_value(value).map_err(|e| ChatError::TransportFailure(e.to_string()))
}

impl FanoutRouter {
    pub fn new(transport: Arc<dyn Transport>, presence: Arc<dyn PresenceTracker>) -> Self {
        FanoutRouter { transport, presence }
    }

    /// Room topic once, then the global feed. Called exactly once per
    /// persisted message; a failure is reported, never retried.
    pub async fn publish_new_message(&self, message: &ChatMessageDto) -> ChatResult<()> {
        let payload = to_payload(message)?;
        let room_result = self
            .transport
            .publish(&destinations::room(message.chat_room_id), payload)
            .await;

        let feed = json!({
            "type": "MESSAGE_SENT",
            "chatRoomId": message.chat_room_id,
            "messageId": message.id,
            "senderId": message.sender_id,
            "content": message.content,
            "messageType": message.message_type,
            "timestamp": message.timestamp,
        });
        if let Err(e) = self.transport.publish(destinations::MESSAGE_FEED, feed).await {
            warn!("Message feed publish failed for message {}: {}", message.id, e);
        }

        room_result.map_err(|e| {
            error!(
                "Failed to broadcast message {} to room {}: {}",
                message.id, message.chat_room_id, e
            );
            e
        })
    }

    /// Fire-and-forget; nothing is stored.
    pub async fn publish_typing(&self, room_id: RoomId, user_id: UserId, username: &str, is_typing: bool) {
        let payload = json!({
            "type": "typing",
            "userId": user_id,
            "username": username,
            "isTyping": is_typing,
            "timestamp": Utc::now(),
        });
        if let Err(e) = self.transport.publish(&destinations::room_typing(room_id), payload).await {
            debug!("Typing indicator dropped for room {}: {}", room_id, e);
        }
    }

    /// One publish per room the user belongs to, plus the per-user topic.
    pub async fn publish_presence_change(
        &self,
        user_id: UserId,
        username: &str,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    ) -> ChatResult<()> {
        let rooms = self.presence.rooms_for(user_id).await?;
        let payload = json!({
            "type": "USER_STATUS_UPDATE",
            "userId": user_id,
            "username": username,
            "online": online,
            "lastSeen": last_seen.unwrap_or_else(Utc::now),
        });

        let mut rooms: Vec<RoomId> = rooms.into_iter().collect();
        rooms.sort_unstable();
        for room_id in rooms {
            if let Err(e) = self
                .transport
                .publish(&destinations::room_status(room_id), payload.clone())
                .await
            {
                warn!("Presence update for user {} not sent to room {}: {}", user_id, room_id, e);
            }
        }
        self.transport
            .publish(&destinations::user_status(user_id), payload)
            .await
    }

    /// Subscribers keep the last value they see per (message, user).
    pub async fn publish_status_change(
        &self,
        message_id: MessageId,
        user_id: UserId,
        status: DeliveryStatus,
        room_id: RoomId,
    ) -> ChatResult<()> {
        let payload = json!({
            "type": "MESSAGE_STATUS_UPDATE",
            "messageId": message_id,
            "userId": user_id,
            "status": status,
            "timestamp": Utc::now(),
        });
        self.transport
            .publish(&destinations::room_status(room_id), payload)
            .await
    }

    /// Room updates topic, plus the added user's private queue.
    pub async fn publish_participant_added(
        &self,
        room_id: RoomId,
        participant: &ParticipantDto,
        added_by: &str,
    ) -> ChatResult<()> {
        let now = Utc::now();
        let broadcast = json!({
            "type": "PARTICIPANT_ADDED",
            "chatRoomId": room_id,
            "participant": to_payload(participant)?,
            "addedBy": added_by,
            "timestamp": now,
        });
        let room_result = self
            .transport
            .publish(&destinations::room_updates(room_id), broadcast)
            .await;

        if let Some(username) = &participant.username {
            let personal = json!({
                "type": "ADDED_TO_CHAT_ROOM",
                "chatRoomId": room_id,
                "addedBy": added_by,
                "timestamp": now,
            });
            self.transport
                .send_to_user(username, destinations::CHAT_UPDATES_QUEUE, personal)
                .await?;
        }
        room_result
    }

    pub async fn publish_participant_changed(
        &self,
        room_id: RoomId,
        kind: &str,
        participant: &ParticipantDto,
        changed_by: &str,
    ) -> ChatResult<()> {
        let payload = json!({
            "type": kind,
            "chatRoomId": room_id,
            "participant": to_payload(participant)?,
            "changedBy": changed_by,
            "timestamp": Utc::now(),
        });
        self.transport
            .publish(&destinations::room_updates(room_id), payload)
            .await
    }

    /// Advisory join/leave notices.
    pub async fn publish_room_event(&self, room_id: RoomId, event: RoomEvent, user_id: UserId, username: &str) {
        let payload = json!({
            "type": event.kind(),
            "userId": user_id,
            "username": username,
            "timestamp": Utc::now(),
        });
        if let Err(e) = self.transport.publish(&destinations::room_events(room_id), payload).await {
            debug!("Room event {} for room {} dropped: {}", event.kind(), room_id, e);
        }
    }

    pub async fn publish_new_room(&self, room: &ChatRoomDto) -> ChatResult<()> {
        let payload = json!({
            "type": "NEW_CHAT_ROOM",
            "chatRoom": to_payload(room)?,
            "timestamp": Utc::now(),
        });
        self.transport.publish(destinations::CHAT_UPDATES, payload).await
    }

    pub async fn publish_room_updated(&self, room: &ChatRoomDto) -> ChatResult<()> {
        let payload = json!({
            "type": "ROOM_UPDATED",
            "chatRoom": to_payload(room)?,
            "timestamp": Utc::now(),
        });
        self.transport
            .publish(&destinations::room_updates(room.id), payload)
            .await
    }

    pub async fn publish_room_deleted(&self, room_id: RoomId, deleted_by: &str) -> ChatResult<()> {
        let payload = json!({
            "type": "ROOM_DELETED",
            "chatRoomId": room_id,
            "deletedBy": deleted_by,
            "timestamp": Utc::now(),
        });
        self.transport
            .publish(&destinations::room_updates(room_id), payload)
            .await
    }

    pub async fn publish_message_edited(&self, message: &ChatMessageDto) -> ChatResult<()> {
        let payload = json!({
            "type": "MESSAGE_UPDATED",
            "message": to_payload(message)?,
        });
        self.transport
            .publish(&destinations::room(message.chat_room_id), payload)
            .await
    }

    pub async fn publish_message_deleted(&self, room_id: RoomId, message_id: MessageId, deleted_by: UserId) -> ChatResult<()> {
        let payload = json!({
            "type": "MESSAGE_DELETED",
            "chatRoomId": room_id,
            "messageId": message_id,
            "deletedBy": deleted_by,
            "timestamp": Utc::now(),
        });
        self.transport.publish(&destinations::room(room_id), payload).await
    }

    /// Private error reply to one user. Never fails the caller.
    pub async fn send_error(&self, username: &str, err: &ChatError, destination: Option<&str>) {
        let payload = json!({
            "type": "ERROR",
            "code": err.code(),
            "message": err.public_message(),
            "destination": destination,
            "timestamp": Utc::now(),
        });
        if let Err(e) = self
            .transport
            .send_to_user(username, destinations::ERRORS_QUEUE, payload)
            .await
        {
            error!("Could not deliver error reply to {}: {}", username, e);
        }
    }
}
