// src/participants.rs

use log::{info, warn};

use crate::chat_core::ChatCore;
use crate::dto::ParticipantDto;
use crate::error::{ChatError, ChatResult};
use crate::models::{MessageId, Participant, ParticipantId, RoomId, RoomRole, User, UserId};
use crate::router::RoomEvent;

impl ChatCore {
    pub async fn list_participants(&self, user: &User, room_id: RoomId) -> ChatResult<Vec<ParticipantDto>> {
        self.membership.room(room_id).await?;
        if !self.membership.is_participant(user.id, room_id).await? {
            return Err(ChatError::NotParticipant);
        }
        self.participant_dtos(room_id).await
    }

    /// Admin-only. New members always join as MEMBER.
    pub async fn add_participant(&self, actor: &User, room_id: RoomId, user_id: UserId) -> ChatResult<ParticipantDto> {
        let room = self.membership.room(room_id).await?;
        self.membership.assert_accepts_new_participants(&room)?;
        let _guard = self.membership.lock_room(room_id).await;
        self.membership.assert_can_moderate(actor.id, room_id).await?;

        let added = self.user(user_id).await?;
        if self.store.participants.find(added.id, room_id).await?.is_some() {
            return Err(ChatError::InvalidState(
                "User is already a participant in this chat room".into(),
            ));
        }
        let participant = self
            .store
            .participants
            .insert(Participant::new(added.id, room_id, RoomRole::Member))
            .await?;
        self.presence.track_room(added.id, room_id).await;

        self.post_system_message(
            room_id,
            format!("{} added {} to the {}", actor.username, added.username, room.room_type.noun()),
        )
        .await?;
        info!("User {} added to room {} by {}", added.id, room_id, actor.id);

        let dto = ParticipantDto::new(&participant, Some(&added));
        if let Err(e) = self
            .router
            .publish_participant_added(room_id, &dto, &actor.username)
            .await
        {
            warn!("Participant {} addition not announced: {}", participant.id, e);
        }
        self.router
            .publish_room_event(room_id, RoomEvent::Joined, added.id, &added.username)
            .await;
        Ok(dto)
    }

    /// Self-removal (leave) or admin removal of someone else.
    pub async fn remove_participant(&self, actor: &User, participant_id: ParticipantId) -> ChatResult<()> {
        let target = self.find_participant(participant_id).await?;
        let room = self.membership.room(target.room_id).await?;
        let _guard = self.membership.lock_room(room.id).await;

        let leaving = target.user_id == actor.id;
        if !leaving {
            if room.is_personal() {
                return Err(ChatError::InvalidState(
                    "Cannot remove participants from a personal chat".into(),
                ));
            }
            self.membership.assert_can_moderate(actor.id, room.id).await?;
        }
        // Re-read under the lock; the role may have changed since.
        let target = self.find_participant(participant_id).await?;
        self.membership.assert_removal(&room, &target).await?;

        let removed = self.store.users.find_by_id(target.user_id).await?;
        let removed_name = removed
            .as_ref()
            .map(|u| u.username.clone())
            .unwrap_or_else(|| format!("user {}", target.user_id));
        let notice = if leaving {
            format!("{} left the {}", actor.username, room.room_type.noun())
        } else {
            format!("{} removed {} from the {}", actor.username, removed_name, room.room_type.noun())
        };
        self.post_system_message(room.id, notice).await?;

        self.store.participants.delete(target.id).await?;
        self.presence.untrack_room(target.user_id, room.id).await;
        info!("Participant {} removed from room {} by {}", target.id, room.id, actor.id);

        let dto = ParticipantDto::new(&target, removed.as_ref());
        if let Err(e) = self
            .router
            .publish_participant_changed(room.id, "PARTICIPANT_REMOVED", &dto, &actor.username)
            .await
        {
            warn!("Participant {} removal not announced: {}", target.id, e);
        }
        self.router
            .publish_room_event(room.id, RoomEvent::Left, target.user_id, &removed_name)
            .await;
        Ok(())
    }

    pub async fn update_role(&self, actor: &User, participant_id: ParticipantId, role: RoomRole) -> ChatResult<ParticipantDto> {
        let target = self.find_participant(participant_id).await?;
        let room = self.membership.room(target.room_id).await?;
        let _guard = self.membership.lock_room(room.id).await;
        self.membership.assert_can_moderate(actor.id, room.id).await?;

        let mut target = self.find_participant(participant_id).await?;
        self.membership.assert_role_change(&room, &target, role).await?;
        let target_user = self.store.users.find_by_id(target.user_id).await?;
        if target.role == role {
            return Ok(ParticipantDto::new(&target, target_user.as_ref()));
        }

        self.store.participants.set_role(target.id, role).await?;
        target.role = role;
        let target_name = target_user
            .as_ref()
            .map(|u| u.username.as_str())
            .unwrap_or("a participant");
        let notice = match role {
            RoomRole::Admin => format!("{} promoted {} to admin", actor.username, target_name),
            RoomRole::Member => format!("{} demoted {} to member", actor.username, target_name),
        };
        self.post_system_message(room.id, notice).await?;
        info!("Participant {} in room {} is now {:?}", target.id, room.id, role);

        let dto = ParticipantDto::new(&target, target_user.as_ref());
        if let Err(e) = self
            .router
            .publish_participant_changed(room.id, "PARTICIPANT_ROLE_CHANGED", &dto, &actor.username)
            .await
        {
            warn!("Role change of participant {} not announced: {}", target.id, e);
        }
        Ok(dto)
    }

    /// Admin-only mute/block. Not available in PERSONAL rooms.
    pub async fn update_flags(
        &self,
        actor: &User,
        participant_id: ParticipantId,
        muted: bool,
        blocked: bool,
    ) -> ChatResult<ParticipantDto> {
        let mut target = self.find_participant(participant_id).await?;
        let room = self.membership.room(target.room_id).await?;
        if room.is_personal() {
            return Err(ChatError::InvalidState(
                "Cannot mute or block in a personal chat".into(),
            ));
        }
        self.membership.assert_can_moderate(actor.id, room.id).await?;

        self.store.participants.set_flags(target.id, muted, blocked).await?;
        target.muted = muted;
        target.blocked = blocked;
        let target_user = self.store.users.find_by_id(target.user_id).await?;

        let dto = ParticipantDto::new(&target, target_user.as_ref());
        if let Err(e) = self
            .router
            .publish_participant_changed(room.id, "PARTICIPANT_STATUS_CHANGED", &dto, &actor.username)
            .await
        {
            warn!("Flag change of participant {} not announced: {}", target.id, e);
        }
        Ok(dto)
    }

    /// Moves the caller's read pointer. Never moves backwards.
    pub async fn update_last_read(&self, user: &User, room_id: RoomId, message_id: MessageId) -> ChatResult<ParticipantDto> {
        let mut me = self.membership.participant(user.id, room_id).await?;
        let message = self.find_message(message_id).await?;
        if message.room_id != room_id {
            return Err(ChatError::InvalidRequest(
                "Message does not belong to this chat room".into(),
            ));
        }
        if me.last_read_message_id.map_or(true, |current| message_id > current) {
            self.store.participants.set_last_read(me.id, message_id).await?;
            me.last_read_message_id = Some(message_id);
        }
        Ok(ParticipantDto::new(&me, Some(user)))
    }

    pub(crate) async fn find_participant(&self, participant_id: ParticipantId) -> ChatResult<Participant> {
        self.store
            .participants
            .find_by_id(participant_id)
            .await?
            .ok_or_else(|| ChatError::not_found("Participant"))
    }
}
