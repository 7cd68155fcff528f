// src/chat_core.rs
//
// Explicit wiring of presence, membership, router and dispatcher over one
// store. The service operations live in messaging.rs, rooms.rs,
// participants.rs, statuses.rs and sessions.rs as further impl blocks.

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, warn};

use crate::dto::{ChatMessageDto, ChatRoomDto, ParticipantDto};
use crate::error::{ChatError, ChatResult};
use crate::membership::MembershipAuthority;
use crate::models::{ChatMessage, ChatRoom, MessageId, RoomId, User, UserId};
use crate::notifications::NotificationDispatcher;
use crate::presence::{InMemoryPresence, PresenceTracker};
use crate::push::PushCapability;
use crate::repository::Store;
use crate::router::{destinations, FanoutRouter, Transport};
use crate::sessions::SessionLedger;

pub struct ChatCore {
    pub store: Store,
    pub presence: Arc<dyn PresenceTracker>,
    pub membership: MembershipAuthority,
    pub router: FanoutRouter,
    pub notifier: NotificationDispatcher,
    pub(crate) sessions: SessionLedger,
    /// Prefix for generated image URLs.
    pub base_url: String,
}

impl ChatCore {
    /// Single-process assembly with in-memory presence.
    pub fn assemble(
        store: Store,
        transport: Arc<dyn Transport>,
        push: Arc<dyn PushCapability>,
        base_url: &str,
    ) -> Self {
        let presence: Arc<dyn PresenceTracker> =
            Arc::new(InMemoryPresence::new(store.participants.clone()));
        Self::with_presence(store, presence, transport, push, base_url)
    }

    pub fn with_presence(
        store: Store,
        presence: Arc<dyn PresenceTracker>,
        transport: Arc<dyn Transport>,
        push: Arc<dyn PushCapability>,
        base_url: &str,
    ) -> Self {
        ChatCore {
            membership: MembershipAuthority::new(store.participants.clone(), store.rooms.clone()),
            router: FanoutRouter::new(transport, presence.clone()),
            notifier: NotificationDispatcher::new(store.clone(), presence.clone(), push),
            sessions: SessionLedger::default(),
            presence,
            store,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn user(&self, id: UserId) -> ChatResult<User> {
        self.store
            .users
            .find_by_id(id)
            .await?
            .ok_or_else(|| ChatError::not_found("User"))
    }

    pub async fn user_by_username(&self, username: &str) -> ChatResult<User> {
        self.store
            .users
            .find_by_username(username)
            .await?
            .ok_or_else(|| ChatError::not_found("User"))
    }

    pub(crate) async fn message_dto(&self, message: &ChatMessage) -> ChatResult<ChatMessageDto> {
        let sender = match message.sender_id {
            Some(id) => self.store.users.find_by_id(id).await?,
            None => None,
        };
        Ok(ChatMessageDto::new(message, sender.as_ref()))
    }

    pub(crate) async fn participant_dtos(&self, room_id: RoomId) -> ChatResult<Vec<ParticipantDto>> {
        let participants = self.store.participants.list_by_room(room_id).await?;
        let ids: Vec<UserId> = participants.iter().map(|p| p.user_id).collect();
        let users: HashMap<UserId, User> = self
            .store
            .users
            .find_by_ids(&ids)
            .await?
            .into_iter()
            .map(|u| (u.id, u))
            .collect();
        Ok(participants
            .iter()
            .map(|p| ParticipantDto::new(p, users.get(&p.user_id)))
            .collect())
    }

    pub(crate) async fn room_dto(&self, room: &ChatRoom) -> ChatResult<ChatRoomDto> {
        let participants = self.participant_dtos(room.id).await?;
        let last = match room.last_message_id {
            Some(id) => self.store.messages.find_by_id(id).await?,
            None => None,
        };
        let last_sender = match last.as_ref().and_then(|m| m.sender_id) {
            Some(id) => self.store.users.find_by_id(id).await?,
            None => None,
        };
        Ok(ChatRoomDto::new(
            room,
            participants,
            last.as_ref().map(|m| (m, last_sender.as_ref())),
        ))
    }

    /// The message is already stored by now, so a failed pointer update is
    /// logged and the send still succeeds.
    async fn bump_last_message(&self, room_id: RoomId, message_id: MessageId) {
        if let Err(e) = self
            .store
            .rooms
            .update_last_message(room_id, Some(message_id))
            .await
        {
            error!("Last-message pointer for room {} not updated: {}", room_id, e);
        }
    }

    /// Persist, bump the room pointer, then broadcast and push side by side.
    pub(crate) async fn deliver_new_message(
        &self,
        message: ChatMessage,
        room: &ChatRoom,
        sender: &User,
    ) -> ChatResult<ChatMessageDto> {
        let message = self.store.messages.insert(message).await?;
        self.bump_last_message(room.id, message.id).await;

        let dto = ChatMessageDto::new(&message, Some(sender));
        let (published, _report) = futures::future::join(
            self.router.publish_new_message(&dto),
            self.notifier.notify(&message, room, Some(sender)),
        )
        .await;
        if let Err(e) = published {
            self.router
                .send_error(&sender.username, &e, Some(&destinations::room(room.id)))
                .await;
        }
        Ok(dto)
    }

    /// SYSTEM notice in a room. Broadcast only, never pushed.
    pub(crate) async fn post_system_message(&self, room_id: RoomId, text: String) -> ChatResult<ChatMessage> {
        let message = self
            .store
            .messages
            .insert(ChatMessage::system(room_id, text))
            .await?;
        self.bump_last_message(room_id, message.id).await;
        if let Err(e) = self
            .router
            .publish_new_message(&ChatMessageDto::new(&message, None))
            .await
        {
            warn!("System message {} not broadcast: {}", message.id, e);
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::memory_store::InMemoryStore;
    use crate::models::RoomType;
    use crate::repository::{RoomRepository, UserRepository};
    use crate::rooms::CreateRoom;
    use crate::test_support::{RecordingPush, RecordingTransport};

    /// Room rows whose last-message pointer can never be written.
    struct StuckPointer(Arc<InMemoryStore>);

    #[async_trait]
    impl RoomRepository for StuckPointer {
        async fn insert(&self, room: ChatRoom) -> ChatResult<ChatRoom> {
            RoomRepository::insert(self.0.as_ref(), room).await
        }
        async fn find_by_id(&self, id: RoomId) -> ChatResult<Option<ChatRoom>> {
            RoomRepository::find_by_id(self.0.as_ref(), id).await
        }
        async fn find_by_ids(&self, ids: &[RoomId]) -> ChatResult<Vec<ChatRoom>> {
            RoomRepository::find_by_ids(self.0.as_ref(), ids).await
        }
        async fn find_personal(&self, personal_key: &str) -> ChatResult<Option<ChatRoom>> {
            RoomRepository::find_personal(self.0.as_ref(), personal_key).await
        }
        async fn rename(&self, id: RoomId, name: &str) -> ChatResult<()> {
            RoomRepository::rename(self.0.as_ref(), id, name).await
        }
        async fn update_last_message(&self, _id: RoomId, _message_id: Option<MessageId>) -> ChatResult<()> {
            Err(ChatError::Storage("pointer write refused".into()))
        }
        async fn delete(&self, id: RoomId) -> ChatResult<()> {
            RoomRepository::delete(self.0.as_ref(), id).await
        }
    }

    #[actix_web::test]
    async fn failed_pointer_update_does_not_fail_a_stored_message() {
        let backend = Arc::new(InMemoryStore::new());
        let mut store = Store::from_backend(backend.clone());
        store.rooms = Arc::new(StuckPointer(backend.clone()));
        let transport = Arc::new(RecordingTransport::default());
        let core = ChatCore::assemble(
            store,
            transport.clone(),
            Arc::new(RecordingPush::default()),
            "http://chat.test",
        );
        let alice = UserRepository::insert(backend.as_ref(), User::new("alice", None, None, "hash".into()))
            .await
            .unwrap();
        let bob = UserRepository::insert(backend.as_ref(), User::new("bob", None, None, "hash".into()))
            .await
            .unwrap();

        // Group creation writes a SYSTEM notice; the user's send goes through
        // the regular delivery path.
        let room = core
            .create_room(
                &alice,
                CreateRoom {
                    room_type: RoomType::Group,
                    name: Some("Ops".into()),
                    participant_ids: vec![bob.id],
                    participant_role: None,
                },
            )
            .await
            .unwrap();
        let sent = core.send_text(&alice, room.id, "still delivered").await.unwrap();

        let history = core.history(&bob, room.id, 0, 20).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|m| m.id == sent.id));
        let broadcast = transport.published_to(&destinations::room(room.id));
        assert_eq!(broadcast.len(), 2);
        assert_eq!(core.get_room(&bob, room.id).await.unwrap().last_message_id, None);
    }
}
