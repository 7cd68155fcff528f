// src/membership.rs

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{ChatError, ChatResult};
use crate::models::{ChatRoom, Participant, RoomId, RoomRole, UserId};
use crate::repository::{ParticipantRepository, RoomRepository};

/// Read-only permission checks over participant rows. Every write path asks
/// here first; nothing in this type mutates state.
pub struct MembershipAuthority {
    participants: Arc<dyn ParticipantRepository>,
    rooms: Arc<dyn RoomRepository>,
    room_locks: Mutex<HashMap<RoomId, Arc<Mutex<()>>>>,
}

impl MembershipAuthority {
    pub fn new(participants: Arc<dyn ParticipantRepository>, rooms: Arc<dyn RoomRepository>) -> Self {
        MembershipAuthority {
            participants,
            rooms,
            room_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn room(&self, room_id: RoomId) -> ChatResult<ChatRoom> {
        self.rooms
            .find_by_id(room_id)
            .await?
            .ok_or_else(|| ChatError::not_found("Chat room"))
    }

    pub async fn is_participant(&self, user_id: UserId, room_id: RoomId) -> ChatResult<bool> {
        Ok(self.participants.find(user_id, room_id).await?.is_some())
    }

    pub async fn is_admin(&self, user_id: UserId, room_id: RoomId) -> ChatResult<bool> {
        Ok(self
            .participants
            .find(user_id, room_id)
            .await?
            .map(|p| p.is_admin())
            .unwrap_or(false))
    }

    pub async fn participant(&self, user_id: UserId, room_id: RoomId) -> ChatResult<Participant> {
        self.participants
            .find(user_id, room_id)
            .await?
            .ok_or(ChatError::NotParticipant)
    }

    pub async fn assert_can_post(&self, user_id: UserId, room_id: RoomId) -> ChatResult<Participant> {
        let participant = self.participant(user_id, room_id).await?;
        if participant.muted {
            return Err(ChatError::Muted);
        }
        Ok(participant)
    }

    /// Role changes, system broadcasts and forced removal.
    pub async fn assert_can_moderate(&self, user_id: UserId, room_id: RoomId) -> ChatResult<Participant> {
        match self.participants.find(user_id, room_id).await? {
            Some(p) if p.is_admin() => Ok(p),
            _ => Err(ChatError::NotAdmin),
        }
    }

    pub fn assert_accepts_new_participants(&self, room: &ChatRoom) -> ChatResult<()> {
        if room.is_personal() {
            return Err(ChatError::InvalidState(
                "Cannot add participants to a personal chat".into(),
            ));
        }
        Ok(())
    }

    pub async fn assert_role_change(
        &self,
        room: &ChatRoom,
        target: &Participant,
        new_role: RoomRole,
    ) -> ChatResult<()> {
        if room.is_personal() {
            return Err(ChatError::InvalidState(
                "Cannot change roles in a personal chat".into(),
            ));
        }
        if target.is_admin() && new_role == RoomRole::Member {
            self.assert_not_last_admin(room.id).await?;
        }
        Ok(())
    }

    /// Removing `target` must leave a GROUP/CHANNEL with an admin.
    pub async fn assert_removal(&self, room: &ChatRoom, target: &Participant) -> ChatResult<()> {
        if !room.is_personal() && target.is_admin() {
            self.assert_not_last_admin(room.id).await?;
        }
        Ok(())
    }

    async fn assert_not_last_admin(&self, room_id: RoomId) -> ChatResult<()> {
        if self.participants.count_admins(room_id).await? <= 1 {
            return Err(ChatError::LastAdmin);
        }
        Ok(())
    }

    /// Serializes check-then-act sequences on one room's admin set.
    pub async fn lock_room(&self, room_id: RoomId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.room_locks.lock().await;
            // Entries nobody holds or waits on are only referenced by the map.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(room_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drops the lock entry of a deleted room.
    pub async fn release_room(&self, room_id: RoomId) {
        self.room_locks.lock().await.remove(&room_id);
    }

    #[cfg(test)]
    pub(crate) async fn lock_count(&self) -> usize {
        self.room_locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryStore;
    use crate::models::RoomType;

    async fn group_with(store: &Arc<InMemoryStore>, members: &[(UserId, RoomRole)]) -> ChatRoom {
        let room = RoomRepository::insert(store.as_ref(), ChatRoom::new("ops", RoomType::Group, members[0].0))
            .await
            .unwrap();
        for (user, role) in members {
            ParticipantRepository::insert(store.as_ref(), Participant::new(*user, room.id, *role))
                .await
                .unwrap();
        }
        room
    }

    #[actix_web::test]
    async fn muted_member_cannot_post() {
        let store = Arc::new(InMemoryStore::new());
        let room = group_with(&store, &[(1, RoomRole::Admin), (2, RoomRole::Member)]).await;
        let member = ParticipantRepository::find(store.as_ref(), 2, room.id).await.unwrap().unwrap();
        store.set_flags(member.id, true, false).await.unwrap();

        let authority = MembershipAuthority::new(store.clone(), store.clone());
        assert!(matches!(authority.assert_can_post(2, room.id).await, Err(ChatError::Muted)));
        assert!(matches!(authority.assert_can_post(3, room.id).await, Err(ChatError::NotParticipant)));
        assert!(authority.assert_can_post(1, room.id).await.is_ok());
    }

    #[actix_web::test]
    async fn sole_admin_cannot_be_demoted_or_removed() {
        let store = Arc::new(InMemoryStore::new());
        let room = group_with(&store, &[(1, RoomRole::Admin), (2, RoomRole::Member)]).await;
        let authority = MembershipAuthority::new(store.clone(), store.clone());
        let admin = authority.participant(1, room.id).await.unwrap();

        assert!(matches!(
            authority.assert_role_change(&room, &admin, RoomRole::Member).await,
            Err(ChatError::LastAdmin)
        ));
        assert!(matches!(authority.assert_removal(&room, &admin).await, Err(ChatError::LastAdmin)));
        assert!(matches!(authority.assert_can_moderate(2, room.id).await, Err(ChatError::NotAdmin)));
    }

    #[actix_web::test]
    async fn personal_rooms_reject_adds_and_role_changes() {
        let store = Arc::new(InMemoryStore::new());
        let room = RoomRepository::insert(store.as_ref(), ChatRoom::personal("bob", 1, 2))
            .await
            .unwrap();
        let p = ParticipantRepository::insert(store.as_ref(), Participant::new(1, room.id, RoomRole::Member))
            .await
            .unwrap();
        let authority = MembershipAuthority::new(store.clone(), store.clone());
        assert!(authority.assert_accepts_new_participants(&room).is_err());
        assert!(matches!(
            authority.assert_role_change(&room, &p, RoomRole::Admin).await,
            Err(ChatError::InvalidState(_))
        ));
    }
}
