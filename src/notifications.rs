// src/notifications.rs
//
// Push fan-out for new messages. Best effort: nothing in here can fail a send.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::chat_core::ChatCore;
use crate::error::{ChatError, ChatResult};
use crate::models::{ChatMessage, ChatRoom, DeliveryStatus, FcmToken, MessageType, User, UserId};
use crate::presence::PresenceTracker;
use crate::push::{PushCapability, PushNotification, PushOutcome};
use crate::repository::Store;

const BODY_PREVIEW_CHARS: usize = 100;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub recipients: Vec<UserId>,
    pub tokens: usize,
    pub delivered: usize,
    pub invalidated: usize,
}

pub struct NotificationDispatcher {
    store: Store,
    presence: Arc<dyn PresenceTracker>,
    push: Arc<dyn PushCapability>,
}

impl NotificationDispatcher {
    pub fn new(store: Store, presence: Arc<dyn PresenceTracker>, push: Arc<dyn PushCapability>) -> Self {
        NotificationDispatcher { store, presence, push }
    }

    /// Participants minus the sender, minus anyone watching the room live,
    /// minus anyone who already read this message.
    pub async fn recipients_for(&self, message: &ChatMessage) -> ChatResult<Vec<UserId>> {
        let participants = self.store.participants.list_by_room(message.room_id).await?;
        let mut recipients = Vec::new();
        for p in participants {
            if Some(p.user_id) == message.sender_id {
                continue;
            }
            if self.presence.is_online_in_room(p.user_id, message.room_id).await {
                debug!(
                    "Skipping push for user {}: online in room {}",
                    p.user_id, message.room_id
                );
                continue;
            }
            let already_read = self
                .store
                .statuses
                .find(message.id, p.user_id)
                .await?
                .map(|s| s.status == DeliveryStatus::Read)
                .unwrap_or(false);
            if already_read {
                continue;
            }
            recipients.push(p.user_id);
        }
        Ok(recipients)
    }

    /// Runs after the message is committed. Errors are logged and swallowed.
    pub async fn notify(&self, message: &ChatMessage, room: &ChatRoom, sender: Option<&User>) -> DispatchReport {
        match self.dispatch(message, room, sender).await {
            Ok(report) => report,
            Err(e) => {
                error!("Push dispatch for message {} failed: {}", message.id, e);
                DispatchReport::default()
            }
        }
    }

    async fn dispatch(&self, message: &ChatMessage, room: &ChatRoom, sender: Option<&User>) -> ChatResult<DispatchReport> {
        let recipients = self.recipients_for(message).await?;
        let mut report = DispatchReport {
            recipients: recipients.clone(),
            ..Default::default()
        };
        if recipients.is_empty() {
            return Ok(report);
        }

        let tokens: Vec<String> = self
            .store
            .push_tokens
            .active_for_users(&recipients)
            .await?
            .into_iter()
            .map(|t| t.token)
            .collect();
        report.tokens = tokens.len();
        if tokens.is_empty() {
            debug!("No active push tokens for message {}", message.id);
            return Ok(report);
        }

        let notification = build_notification(message, room, sender);
        let outcomes = match self.push.send_batch(&tokens, &notification).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!("Push provider '{}' unavailable: {}", self.push.name(), e);
                return Ok(report);
            }
        };

        for (token, outcome) in tokens.iter().zip(outcomes) {
            match outcome {
                PushOutcome::Delivered => report.delivered += 1,
                PushOutcome::InvalidToken => {
                    info!("Deactivating invalid push token {}", token_prefix(token));
                    if let Err(e) = self.store.push_tokens.deactivate(token).await {
                        warn!("Could not deactivate token {}: {}", token_prefix(token), e);
                    } else {
                        report.invalidated += 1;
                    }
                }
                PushOutcome::Failed(reason) => {
                    warn!("Push to {} failed: {}", token_prefix(token), reason);
                }
                PushOutcome::Skipped => {}
            }
        }
        info!(
            "Push for message {}: {}/{} delivered, {} invalidated",
            message.id, report.delivered, report.tokens, report.invalidated
        );
        Ok(report)
    }
}

pub fn build_notification(message: &ChatMessage, room: &ChatRoom, sender: Option<&User>) -> PushNotification {
    let sender_name = sender.map(|u| u.display_name().to_string()).unwrap_or_else(|| "System".to_string());
    let body = match message.message_type {
        MessageType::Image => "Sent a photo".to_string(),
        MessageType::File => "Sent a file".to_string(),
        _ => preview(&message.content),
    };

    let mut data = HashMap::new();
    data.insert("type".to_string(), "NEW_MESSAGE".to_string());
    data.insert("chatRoomId".to_string(), message.room_id.to_string());
    data.insert("messageId".to_string(), message.id.to_string());
    if let Some(sender_id) = message.sender_id {
        data.insert("senderId".to_string(), sender_id.to_string());
    }
    data.insert("messageType".to_string(), format!("{:?}", message.message_type).to_uppercase());
    data.insert("timestamp".to_string(), message.sent_at.to_rfc3339());

    let image = if message.message_type == MessageType::Image {
        message.attachments.first().cloned()
    } else {
        None
    };

    PushNotification {
        title: format!("{} • {}", sender_name, room.name),
        body,
        image,
        click_action: format!("/chat/{}", room.id),
        data,
    }
}

fn preview(content: &str) -> String {
    if content.chars().count() > BODY_PREVIEW_CHARS {
        let cut: String = content.chars().take(BODY_PREVIEW_CHARS).collect();
        format!("{}...", cut)
    } else {
        content.to_string()
    }
}

fn token_prefix(token: &str) -> String {
    token.chars().take(20).collect()
}

impl ChatCore {
    pub async fn register_push_token(&self, user: &User, token: &str, device_type: Option<String>) -> ChatResult<FcmToken> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ChatError::InvalidRequest("Push token cannot be empty".into()));
        }
        let saved = self.store.push_tokens.upsert(user.id, token, device_type).await?;
        info!("Push token {}... registered for user {}", token_prefix(token), user.id);
        Ok(saved)
    }

    /// Deactivates one of the caller's tokens, or all of them when `token` is None.
    pub async fn unregister_push_tokens(&self, user: &User, token: Option<&str>) -> ChatResult<u64> {
        let count = self.store.push_tokens.deactivate_for_user(user.id, token).await?;
        info!("Deactivated {} push token(s) for user {}", count, user.id);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RoomType;
    use crate::repository::PushTokenRepository;
    use crate::rooms::CreateRoom;
    use crate::test_support::TestChat;

    async fn personal(chat: &TestChat, a: &User, b: &User) -> ChatRoom {
        let dto = chat
            .core
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
            .unwrap();
        chat.core.membership.room(dto.id).await.unwrap()
    }

    #[test]
    fn long_text_is_truncated_and_images_use_placeholder() {
        let room = ChatRoom::new("Team", RoomType::Group, 1);
        let sender = User::new("alice", None, Some("Alice".into()), "x".into());

        let long = ChatMessage::new(1, Some(1), &"a".repeat(150), MessageType::Text);
        let n = build_notification(&long, &room, Some(&sender));
        assert_eq!(n.title, "Alice • Team");
        assert_eq!(n.body.chars().count(), 103);
        assert!(n.image.is_none());

        let mut photo = ChatMessage::new(1, Some(1), "Photo", MessageType::Image);
        photo.attachments = vec!["https://cdn.test/a.png".into()];
        let n = build_notification(&photo, &room, Some(&sender));
        assert_eq!(n.body, "Sent a photo");
        assert_eq!(n.image.as_deref(), Some("https://cdn.test/a.png"));
        assert_eq!(n.data["messageType"], "IMAGE");
    }

    #[actix_web::test]
    async fn push_skips_recipients_watching_the_room() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let bob = chat.user("bob").await;
        let room = personal(&chat, &alice, &bob).await;
        chat.core.register_push_token(&bob, "bob-phone", Some("android".into())).await.unwrap();
        chat.core.register_push_token(&alice, "alice-phone", None).await.unwrap();

        chat.core.send_text(&alice, room.id, "you there?").await.unwrap();
        assert_eq!(chat.push.tokens_sent(), vec!["bob-phone"]);

        chat.core.user_connected(&bob).await.unwrap();
        chat.core.send_text(&alice, room.id, "saw you come online").await.unwrap();
        assert_eq!(chat.push.batches().len(), 1);

        chat.core.user_disconnected(&bob).await.unwrap();
        chat.core.send_text(&alice, room.id, "and gone again").await.unwrap();
        assert_eq!(chat.push.batches().len(), 2);
    }

    #[actix_web::test]
    async fn invalid_tokens_are_deactivated() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let bob = chat.user("bob").await;
        let room = personal(&chat, &alice, &bob).await;
        chat.core.register_push_token(&bob, "stale-token", None).await.unwrap();
        chat.push.mark_invalid("stale-token");

        let message = ChatMessage::new(room.id, Some(alice.id), "hi", MessageType::Text);
        let report = chat.core.notifier.notify(&message, &room, Some(&alice)).await;
        assert_eq!(report.recipients, vec![bob.id]);
        assert_eq!(report.invalidated, 1);
        assert!(chat.store.active_for_users(&[bob.id]).await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn readers_are_not_pushed() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let bob = chat.user("bob").await;
        let room = personal(&chat, &alice, &bob).await;
        let sent = chat.core.send_text(&alice, room.id, "hi").await.unwrap();
        chat.core.record_status(&bob, sent.id, DeliveryStatus::Read).await.unwrap();

        let message = chat.core.find_message(sent.id).await.unwrap();
        assert!(chat.core.notifier.recipients_for(&message).await.unwrap().is_empty());
    }
}
