// src/sessions.rs
//
// Transport lifecycle hooks. The broker counts sessions per user and calls
// in here only on the first connect and the last disconnect. Those calls run
// as detached tasks, so they may land in either order; each user's net
// balance decides the presence state, one event at a time.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Mutex;

use crate::chat_core::ChatCore;
use crate::error::{ChatError, ChatResult};
use crate::models::{RoomId, User, UserId};
use crate::router::{destinations, RoomEvent};

/// Net connect minus disconnect events per user.
#[derive(Default)]
pub struct SessionLedger {
    balances: Mutex<HashMap<UserId, Arc<Mutex<i64>>>>,
}

impl SessionLedger {
    async fn balance(&self, user_id: UserId) -> Arc<Mutex<i64>> {
        self.balances.lock().await.entry(user_id).or_default().clone()
    }
}

impl ChatCore {
    pub async fn user_connected(&self, user: &User) -> ChatResult<()> {
        self.apply_session_event(user, 1).await
    }

    pub async fn user_disconnected(&self, user: &User) -> ChatResult<()> {
        self.apply_session_event(user, -1).await
    }

    async fn apply_session_event(&self, user: &User, delta: i64) -> ChatResult<()> {
        let balance = self.sessions.balance(user.id).await;
        let mut balance = balance.lock().await;
        *balance += delta;
        if *balance > 0 {
            self.go_online(user).await
        } else {
            self.go_offline(user).await
        }
    }

    async fn go_online(&self, user: &User) -> ChatResult<()> {
        if !self.presence.mark_online(user.id).await? {
            return Ok(());
        }
        self.store.participants.set_presence(user.id, true, None).await?;
        info!("User {} is online", user.username);
        if let Err(e) = self
            .router
            .publish_presence_change(user.id, &user.username, true, None)
            .await
        {
            warn!("Online status of {} not broadcast: {}", user.username, e);
        }
        Ok(())
    }

    async fn go_offline(&self, user: &User) -> ChatResult<()> {
        let Some(last_seen) = self.presence.mark_offline(user.id).await else {
            return Ok(());
        };
        self.store
            .participants
            .set_presence(user.id, false, Some(last_seen))
            .await?;
        info!("User {} is offline", user.username);
        if let Err(e) = self
            .router
            .publish_presence_change(user.id, &user.username, false, Some(last_seen))
            .await
        {
            warn!("Offline status of {} not broadcast: {}", user.username, e);
        }
        Ok(())
    }

    pub async fn typing(&self, user: &User, room_id: RoomId, is_typing: bool) -> ChatResult<()> {
        if !self.membership.is_participant(user.id, room_id).await? {
            return Err(ChatError::NotParticipant);
        }
        self.router
            .publish_typing(room_id, user.id, &user.username, is_typing)
            .await;
        Ok(())
    }

    /// Advisory join/leave notice. Membership is unchanged.
    pub async fn announce_presence_in_room(&self, user: &User, room_id: RoomId, event: RoomEvent) -> ChatResult<()> {
        if !self.membership.is_participant(user.id, room_id).await? {
            return Err(ChatError::NotParticipant);
        }
        self.router
            .publish_room_event(room_id, event, user.id, &user.username)
            .await;
        Ok(())
    }

    /// Room-scoped topics are for participants only. Everything else is open.
    pub async fn authorize_subscription(&self, user: &User, destination: &str) -> ChatResult<()> {
        match destinations::room_of(destination) {
            Some(room_id) if !self.membership.is_participant(user.id, room_id).await? => {
                Err(ChatError::NotParticipant)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::ChatRoomDto;
    use crate::models::RoomType;
    use crate::presence::PresenceTracker;
    use crate::rooms::CreateRoom;
    use crate::test_support::TestChat;

    async fn personal(chat: &TestChat, a: &User, b: &User) -> ChatRoomDto {
        chat.core
            .create_room(
                a,
                CreateRoom {
                    room_type: RoomType::Personal,
                    name: None,
                    participant_ids: vec![b.id],
                    participant_role: None,
                },
            )
            .await
            .unwrap()
    }

    #[actix_web::test]
    async fn connect_and_disconnect_announce_once() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let bob = chat.user("bob").await;
        let room = chat
            .core
            .create_room(
                &alice,
                CreateRoom {
                    room_type: RoomType::Personal,
                    name: None,
                    participant_ids: vec![bob.id],
                    participant_role: None,
                },
            )
            .await
            .unwrap();

        chat.core.user_connected(&bob).await.unwrap();
        chat.core.user_connected(&bob).await.unwrap();
        let online = chat.transport.published_to(&destinations::user_status(bob.id));
        assert_eq!(online.len(), 1);
        assert_eq!(online[0]["online"], true);
        assert!(chat.core.membership.participant(bob.id, room.id).await.unwrap().online);

        chat.core.user_disconnected(&bob).await.unwrap();
        chat.core.user_disconnected(&bob).await.unwrap();
        let all = chat.transport.published_to(&destinations::user_status(bob.id));
        assert_eq!(all.len(), 2);
        assert_eq!(all[1]["online"], false);
        let row = chat.core.membership.participant(bob.id, room.id).await.unwrap();
        assert!(!row.online);
        assert!(row.last_seen.is_some());
        assert_eq!(chat.transport.published_to(&destinations::room_status(room.id)).len(), 2);
    }

    #[actix_web::test]
    async fn disconnect_seen_before_connect_leaves_user_offline() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let bob = chat.user("bob").await;
        personal(&chat, &alice, &bob).await;

        chat.core.user_disconnected(&bob).await.unwrap();
        chat.core.user_connected(&bob).await.unwrap();
        assert!(!chat.core.presence.is_online(bob.id).await);
        assert!(chat.transport.published_to(&destinations::user_status(bob.id)).is_empty());

        chat.core.user_connected(&bob).await.unwrap();
        assert!(chat.core.presence.is_online(bob.id).await);
    }

    #[actix_web::test]
    async fn disconnect_during_a_slow_connect_is_not_lost() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let bob = chat.user("bob").await;
        let room = personal(&chat, &alice, &bob).await;

        let held = chat.store.hold_participants().await;
        let (core, user) = (chat.core.clone(), bob.clone());
        let connecting = actix_web::rt::spawn(async move { core.user_connected(&user).await });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        let (core, user) = (chat.core.clone(), bob.clone());
        let disconnecting = actix_web::rt::spawn(async move { core.user_disconnected(&user).await });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        drop(held);
        connecting.await.unwrap().unwrap();
        disconnecting.await.unwrap().unwrap();

        assert!(!chat.core.presence.is_online(bob.id).await);
        assert!(!chat.core.presence.is_online_in_room(bob.id, room.id).await);
        let row = chat.core.membership.participant(bob.id, room.id).await.unwrap();
        assert!(!row.online);
        let announced = chat.transport.published_to(&destinations::user_status(bob.id));
        assert_eq!(announced.last().unwrap()["online"], false);
    }

    #[actix_web::test]
    async fn room_topics_need_membership() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let bob = chat.user("bob").await;
        let eve = chat.user("eve").await;
        let room = chat
            .core
            .create_room(
                &alice,
                CreateRoom {
                    room_type: RoomType::Personal,
                    name: None,
                    participant_ids: vec![bob.id],
                    participant_role: None,
                },
            )
            .await
            .unwrap();

        let typing = destinations::room_typing(room.id);
        assert!(chat.core.authorize_subscription(&bob, &typing).await.is_ok());
        assert!(matches!(
            chat.core.authorize_subscription(&eve, &typing).await,
            Err(ChatError::NotParticipant)
        ));
        assert!(chat.core.authorize_subscription(&eve, destinations::CHAT_UPDATES).await.is_ok());
        assert!(matches!(
            chat.core.typing(&eve, room.id, true).await,
            Err(ChatError::NotParticipant)
        ));
        chat.core.typing(&bob, room.id, true).await.unwrap();
        assert_eq!(chat.transport.published_to(&typing)[0]["isTyping"], true);
    }
}
