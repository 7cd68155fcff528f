// src/statuses.rs

use chrono::Utc;
use log::{debug, warn};

use crate::chat_core::ChatCore;
use crate::dto::MessageStatusDto;
use crate::error::{ChatError, ChatResult};
use crate::models::{DeliveryStatus, MessageId, MessageStatus, User};

impl ChatCore {
    /// Creates or advances the (message, receiver) row. Status only moves
    /// forward; repeating the current status re-broadcasts without writing.
    pub async fn record_status(
        &self,
        receiver: &User,
        message_id: MessageId,
        status: DeliveryStatus,
    ) -> ChatResult<MessageStatusDto> {
        let message = self.find_message(message_id).await?;
        let me = self.membership.participant(receiver.id, message.room_id).await?;
        if message.sender_id == Some(receiver.id) {
            return Err(ChatError::InvalidRequest(
                "Cannot acknowledge your own message".into(),
            ));
        }

        let now = Utc::now();
        let fresh = MessageStatus {
            id: 0,
            message_id,
            room_id: message.room_id,
            receiver_id: receiver.id,
            sender_id: message.sender_id,
            status,
            updated_at: now,
        };
        let stored = match self.store.statuses.insert_if_absent(fresh).await? {
            Some(created) => created,
            None => self.advance_status(receiver, message_id, status, now).await?,
        };

        if status == DeliveryStatus::Read
            && me.last_read_message_id.map_or(true, |current| message_id > current)
        {
            self.store.participants.set_last_read(me.id, message_id).await?;
        }

        if let Err(e) = self
            .router
            .publish_status_change(message_id, receiver.id, stored.status, message.room_id)
            .await
        {
            warn!("Status change for message {} not broadcast: {}", message_id, e);
        }
        Ok(MessageStatusDto::from(&stored))
    }

    async fn advance_status(
        &self,
        receiver: &User,
        message_id: MessageId,
        status: DeliveryStatus,
        at: chrono::DateTime<Utc>,
    ) -> ChatResult<MessageStatus> {
        if let Some(moved) = self
            .store
            .statuses
            .advance(message_id, receiver.id, &status.predecessors(), status, at)
            .await?
        {
            return Ok(moved);
        }

        // Nothing moved: either already there, or already past it.
        let current = self
            .store
            .statuses
            .find(message_id, receiver.id)
            .await?
            .ok_or_else(|| ChatError::not_found("Message status"))?;
        if current.status == status {
            debug!("Status {:?} for message {} already recorded", status, message_id);
            return Ok(current);
        }
        Err(ChatError::InvalidState(format!(
            "Cannot move message status from {:?} to {:?}",
            current.status, status
        )))
    }

    pub async fn list_statuses(&self, user: &User, message_id: MessageId) -> ChatResult<Vec<MessageStatusDto>> {
        let message = self.find_message(message_id).await?;
        if !self.membership.is_participant(user.id, message.room_id).await? {
            return Err(ChatError::NotParticipant);
        }
        Ok(self
            .store
            .statuses
            .list_by_message(message_id)
            .await?
            .iter()
            .map(MessageStatusDto::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RoomId, RoomType};
    use crate::rooms::CreateRoom;
    use crate::router::destinations;
    use crate::test_support::TestChat;

    async fn pair(chat: &TestChat, a: &User, b: &User) -> RoomId {
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
            .id
    }

    #[actix_web::test]
    async fn status_moves_forward_and_never_back() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let bob = chat.user("bob").await;
        let room_id = pair(&chat, &alice, &bob).await;
        let sent = chat.core.send_text(&alice, room_id, "hi").await.unwrap();

        let delivered = chat.core.record_status(&bob, sent.id, DeliveryStatus::Delivered).await.unwrap();
        assert_eq!(delivered.status, DeliveryStatus::Delivered);
        let read = chat.core.record_status(&bob, sent.id, DeliveryStatus::Read).await.unwrap();
        assert_eq!(read.status, DeliveryStatus::Read);

        // Repeating is harmless; going back is refused.
        chat.core.record_status(&bob, sent.id, DeliveryStatus::Read).await.unwrap();
        assert!(matches!(
            chat.core.record_status(&bob, sent.id, DeliveryStatus::Delivered).await,
            Err(ChatError::InvalidState(_))
        ));

        let stored = chat.core.list_statuses(&alice, sent.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, DeliveryStatus::Read);
        assert_eq!(stored[0].user_sent_id, Some(alice.id));

        let broadcasts = chat.transport.published_to(&destinations::room_status(room_id));
        let statuses: Vec<&str> = broadcasts.iter().filter_map(|b| b["status"].as_str()).collect();
        assert_eq!(statuses, vec!["DELIVERED", "READ", "READ"]);
    }

    #[actix_web::test]
    async fn read_moves_the_read_pointer() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let bob = chat.user("bob").await;
        let room_id = pair(&chat, &alice, &bob).await;
        let sent = chat.core.send_text(&alice, room_id, "hi").await.unwrap();

        chat.core.record_status(&bob, sent.id, DeliveryStatus::Read).await.unwrap();
        let me = chat.core.membership.participant(bob.id, room_id).await.unwrap();
        assert_eq!(me.last_read_message_id, Some(sent.id));
    }

    #[actix_web::test]
    async fn senders_and_outsiders_cannot_ack() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let bob = chat.user("bob").await;
        let eve = chat.user("eve").await;
        let room_id = pair(&chat, &alice, &bob).await;
        let sent = chat.core.send_text(&alice, room_id, "hi").await.unwrap();

        assert!(matches!(
            chat.core.record_status(&alice, sent.id, DeliveryStatus::Read).await,
            Err(ChatError::InvalidRequest(_))
        ));
        assert!(matches!(
            chat.core.record_status(&eve, sent.id, DeliveryStatus::Read).await,
            Err(ChatError::NotParticipant)
        ));
    }
}
