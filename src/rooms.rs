// src/rooms.rs

use log::{info, warn};

use crate::chat_core::ChatCore;
use crate::dto::ChatRoomDto;
use crate::error::{ChatError, ChatResult};
use crate::models::{personal_key, ChatRoom, Participant, RoomId, RoomRole, RoomType, User, UserId};
use crate::router::RoomEvent;

#[derive(Debug, Clone)]
pub struct CreateRoom {
    pub room_type: RoomType,
    pub name: Option<String>,
    pub participant_ids: Vec<UserId>,
    /// CHANNEL only: role for the listed participants.
    pub participant_role: Option<RoomRole>,
}

impl ChatCore {
    pub async fn create_room(&self, creator: &User, request: CreateRoom) -> ChatResult<ChatRoomDto> {
        match request.room_type {
            RoomType::Personal => self.open_personal_room(creator, &request.participant_ids).await,
            RoomType::Group | RoomType::Channel => self.create_shared_room(creator, request).await,
        }
    }

    /// Returns the pair's existing room when there is one.
    async fn open_personal_room(&self, creator: &User, participant_ids: &[UserId]) -> ChatResult<ChatRoomDto> {
        let mut others: Vec<UserId> = participant_ids.to_vec();
        others.sort_unstable();
        others.dedup();
        let other_id = match others.as_slice() {
            [id] => *id,
            _ => {
                return Err(ChatError::InvalidRequest(
                    "PERSONAL chat rooms require exactly one other participant".into(),
                ))
            }
        };
        if other_id == creator.id {
            return Err(ChatError::InvalidRequest(
                "Cannot create a personal chat with yourself".into(),
            ));
        }
        let other = self.user(other_id).await?;

        let key = personal_key(creator.id, other.id);
        if let Some(existing) = self.store.rooms.find_personal(&key).await? {
            self.rejoin_personal(&existing, creator.id).await?;
            return self.room_dto(&existing).await;
        }

        let room = match self
            .store
            .rooms
            .insert(ChatRoom::personal(&other.username, creator.id, other.id))
            .await
        {
            Ok(room) => room,
            Err(ChatError::InvalidState(_)) => {
                // Lost a race with the other side opening the same pair.
                let existing = self
                    .store
                    .rooms
                    .find_personal(&key)
                    .await?
                    .ok_or_else(|| ChatError::not_found("Chat room"))?;
                self.rejoin_personal(&existing, creator.id).await?;
                return self.room_dto(&existing).await;
            }
            Err(e) => return Err(e),
        };

        for user_id in [creator.id, other.id] {
            self.store
                .participants
                .insert(Participant::new(user_id, room.id, RoomRole::Member))
                .await?;
            self.presence.track_room(user_id, room.id).await;
        }
        info!("Personal room {} opened between {} and {}", room.id, creator.id, other.id);

        let dto = self.room_dto(&room).await?;
        if let Err(e) = self.router.publish_new_room(&dto).await {
            warn!("New room {} not announced: {}", room.id, e);
        }
        Ok(dto)
    }

    /// A user who left a personal chat gets their membership back on reopen.
    async fn rejoin_personal(&self, room: &ChatRoom, user_id: UserId) -> ChatResult<()> {
        if self.store.participants.find(user_id, room.id).await?.is_none() {
            self.store
                .participants
                .insert(Participant::new(user_id, room.id, RoomRole::Member))
                .await?;
            self.presence.track_room(user_id, room.id).await;
        }
        Ok(())
    }

    async fn create_shared_room(&self, creator: &User, request: CreateRoom) -> ChatResult<ChatRoomDto> {
        let name = request
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                ChatError::InvalidRequest(format!(
                    "{} chat rooms require a name",
                    format!("{:?}", request.room_type).to_uppercase()
                ))
            })?
            .to_string();

        let mut member_ids: Vec<UserId> = request
            .participant_ids
            .iter()
            .copied()
            .filter(|id| *id != creator.id)
            .collect();
        member_ids.sort_unstable();
        member_ids.dedup();
        let members = self.store.users.find_by_ids(&member_ids).await?;
        if members.len() != member_ids.len() {
            return Err(ChatError::not_found("User"));
        }

        let member_role = match (request.room_type, request.participant_role) {
            (RoomType::Channel, Some(role)) => role,
            _ => RoomRole::Member,
        };

        let room = self
            .store
            .rooms
            .insert(ChatRoom::new(&name, request.room_type, creator.id))
            .await?;
        self.store
            .participants
            .insert(Participant::new(creator.id, room.id, RoomRole::Admin))
            .await?;
        self.presence.track_room(creator.id, room.id).await;
        for member in &members {
            self.store
                .participants
                .insert(Participant::new(member.id, room.id, member_role))
                .await?;
            self.presence.track_room(member.id, room.id).await;
        }

        self.post_system_message(
            room.id,
            format!("{} created {} \"{}\"", creator.username, room.room_type.noun(), name),
        )
        .await?;
        info!(
            "{:?} room {} created by {} with {} members",
            room.room_type,
            room.id,
            creator.id,
            members.len() + 1
        );

        let room = self.membership.room(room.id).await?;
        let dto = self.room_dto(&room).await?;
        if let Err(e) = self.router.publish_new_room(&dto).await {
            warn!("New room {} not announced: {}", room.id, e);
        }
        Ok(dto)
    }

    pub async fn get_room(&self, user: &User, room_id: RoomId) -> ChatResult<ChatRoomDto> {
        let room = self.membership.room(room_id).await?;
        if !self.membership.is_participant(user.id, room_id).await? {
            return Err(ChatError::NotParticipant);
        }
        self.room_dto(&room).await
    }

    /// Most recently active first.
    pub async fn list_rooms(&self, user: &User) -> ChatResult<Vec<ChatRoomDto>> {
        let room_ids: Vec<RoomId> = self
            .store
            .participants
            .list_by_user(user.id)
            .await?
            .into_iter()
            .map(|p| p.room_id)
            .collect();
        let mut rooms = self.store.rooms.find_by_ids(&room_ids).await?;
        rooms.sort_by(|a, b| {
            b.last_message_id
                .cmp(&a.last_message_id)
                .then(b.created_at.cmp(&a.created_at))
        });
        let mut dtos = Vec::with_capacity(rooms.len());
        for room in &rooms {
            dtos.push(self.room_dto(room).await?);
        }
        Ok(dtos)
    }

    /// Rename. GROUP/CHANNEL need an admin.
    pub async fn update_room(&self, user: &User, room_id: RoomId, name: &str) -> ChatResult<ChatRoomDto> {
        let room = self.membership.room(room_id).await?;
        if room.is_personal() {
            self.membership.participant(user.id, room_id).await?;
        } else {
            self.membership.assert_can_moderate(user.id, room_id).await?;
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::InvalidRequest("Room name cannot be empty".into()));
        }

        self.store.rooms.rename(room_id, name).await?;
        self.post_system_message(
            room_id,
            format!("{} updated the {} settings", user.username, room.room_type.noun()),
        )
        .await?;

        let room = self.membership.room(room_id).await?;
        let dto = self.room_dto(&room).await?;
        if let Err(e) = self.router.publish_room_updated(&dto).await {
            self.router.send_error(&user.username, &e, None).await;
        }
        Ok(dto)
    }

    /// PERSONAL: delete for both or drop only the caller.
    /// GROUP/CHANNEL: leave; the last participant out deletes the room.
    pub async fn delete_or_leave_room(&self, user: &User, room_id: RoomId, delete_for_all: bool) -> ChatResult<()> {
        let room = self.membership.room(room_id).await?;
        let _guard = self.membership.lock_room(room_id).await;
        let me = self.membership.participant(user.id, room_id).await?;
        let participants = self.store.participants.list_by_room(room_id).await?;

        if room.is_personal() {
            if delete_for_all || participants.len() == 1 {
                return self.purge_room(&room, user).await;
            }
            self.store.participants.delete(me.id).await?;
            self.presence.untrack_room(user.id, room_id).await;
            info!("User {} left personal room {}", user.id, room_id);
            return Ok(());
        }

        if delete_for_all {
            if !me.is_admin() {
                return Err(ChatError::NotAdmin);
            }
            return self.purge_room(&room, user).await;
        }

        if participants.len() == 1 {
            return self.purge_room(&room, user).await;
        }
        self.membership.assert_removal(&room, &me).await?;

        self.post_system_message(
            room_id,
            format!("{} has left the {}", user.username, room.room_type.noun()),
        )
        .await?;
        self.store.participants.delete(me.id).await?;
        self.presence.untrack_room(user.id, room_id).await;
        self.router
            .publish_room_event(room_id, RoomEvent::Left, user.id, &user.username)
            .await;
        info!("User {} left room {}", user.id, room_id);
        Ok(())
    }

    async fn purge_room(&self, room: &ChatRoom, by: &User) -> ChatResult<()> {
        self.store.statuses.delete_by_room(room.id).await?;
        self.store.messages.delete_by_room(room.id).await?;
        self.store.participants.delete_by_room(room.id).await?;
        self.store.rooms.delete(room.id).await?;
        self.presence.forget_room(room.id).await;
        self.membership.release_room(room.id).await;
        if let Err(e) = self.router.publish_room_deleted(room.id, &by.username).await {
            warn!("Deletion of room {} not announced: {}", room.id, e);
        }
        info!("Room {} deleted by {}", room.id, by.id);
        Ok(())
    }
}
