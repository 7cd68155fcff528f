// src/messaging.rs

use std::sync::LazyLock;

use chrono::Utc;
use log::{info, warn};
use regex::Regex;

use crate::chat_core::ChatCore;
use crate::dto::ChatMessageDto;
use crate::error::{ChatError, ChatResult};
use crate::images::{decode_upload, ImageUpload};
use crate::models::{ChatMessage, MessageId, MessageType, RoomId, User, MAX_CONTENT_LEN};

pub const IMAGE_PLACEHOLDER: &str = "Photo";
pub const DEFAULT_PAGE_SIZE: u64 = 20;
const MAX_PAGE_SIZE: u64 = 100;

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(https?://[\w\-._~:/?#\[\]@!$&'()*+,;=%]+)\b")
        .expect("Invalid URL pattern")
});

static IMAGE_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\.(jpg|jpeg|png|gif|bmp|webp|svg)(\?.*)?$").expect("Invalid image URL pattern")
});

/// Type, content and attachments derived from raw text.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedContent {
    pub message_type: MessageType,
    pub content: String,
    pub attachments: Vec<String>,
}

pub fn is_image_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    IMAGE_URL_PATTERN.is_match(&lower)
        || lower.contains("/images/")
        || (lower.contains("image") && lower.contains("cdn"))
}

/// Text made only of image URLs becomes an IMAGE with a placeholder body.
/// Anything else stays TEXT and carries every URL as an attachment.
pub fn classify_content(content: &str) -> ClassifiedContent {
    let mut urls: Vec<String> = Vec::new();
    for m in URL_PATTERN.find_iter(content) {
        let url = m.as_str().to_string();
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
    let image_urls: Vec<String> = urls.iter().filter(|u| is_image_url(u)).cloned().collect();

    if !image_urls.is_empty() && content.trim() == image_urls.join(" ") {
        return ClassifiedContent {
            message_type: MessageType::Image,
            content: IMAGE_PLACEHOLDER.to_string(),
            attachments: image_urls,
        };
    }
    ClassifiedContent {
        message_type: MessageType::Text,
        content: content.to_string(),
        attachments: urls,
    }
}

fn validate_content(content: &str) -> ChatResult<&str> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ChatError::InvalidRequest("Message content cannot be empty".into()));
    }
    if trimmed.chars().count() > MAX_CONTENT_LEN {
        return Err(ChatError::InvalidRequest(format!(
            "Message content exceeds {} characters",
            MAX_CONTENT_LEN
        )));
    }
    Ok(trimmed)
}

impl ChatCore {
    pub async fn send_text(&self, sender: &User, room_id: RoomId, content: &str) -> ChatResult<ChatMessageDto> {
        let content = validate_content(content)?;
        let room = self.membership.room(room_id).await?;
        self.membership.assert_can_post(sender.id, room_id).await?;

        let classified = classify_content(content);
        let mut message = ChatMessage::new(room_id, Some(sender.id), &classified.content, classified.message_type);
        message.attachments = classified.attachments;
        self.deliver_new_message(message, &room, sender).await
    }

    /// Blob first, then the message, then the blob is linked to the message id.
    pub async fn send_image_upload(
        &self,
        sender: &User,
        room_id: RoomId,
        upload: &ImageUpload,
    ) -> ChatResult<ChatMessageDto> {
        let room = self.membership.room(room_id).await?;
        self.membership.assert_can_post(sender.id, room_id).await?;
        let decoded = decode_upload(upload)?;

        let image = self.store_image(decoded, sender.id, room_id).await?;
        let mut message = ChatMessage::new(room_id, Some(sender.id), IMAGE_PLACEHOLDER, MessageType::Image);
        message.attachments = vec![self.image_url(&image.id)];

        let dto = self.deliver_new_message(message, &room, sender).await?;
        if let Err(e) = self.store.images.link_message(&image.id, dto.id).await {
            warn!("Image {} not linked to message {}: {}", image.id, dto.id, e);
        }
        info!("Image message {} stored in room {} ({} bytes)", dto.id, room_id, image.size);
        Ok(dto)
    }

    pub async fn send_image_url(&self, sender: &User, room_id: RoomId, url: &str) -> ChatResult<ChatMessageDto> {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ChatError::InvalidRequest("Image URL must be http(s)".into()));
        }
        let room = self.membership.room(room_id).await?;
        self.membership.assert_can_post(sender.id, room_id).await?;

        let mut message = ChatMessage::new(room_id, Some(sender.id), IMAGE_PLACEHOLDER, MessageType::Image);
        message.attachments = vec![url.to_string()];
        self.deliver_new_message(message, &room, sender).await
    }

    /// TEXT only, original sender only.
    pub async fn edit_message(&self, user: &User, message_id: MessageId, content: &str) -> ChatResult<ChatMessageDto> {
        let content = validate_content(content)?;
        let mut message = self.find_message(message_id).await?;
        if message.sender_id != Some(user.id) {
            return Err(ChatError::Forbidden("Only the sender can edit this message".into()));
        }
        if message.message_type != MessageType::Text {
            return Err(ChatError::InvalidState("Only text messages can be edited".into()));
        }
        self.membership.assert_can_post(user.id, message.room_id).await?;

        let now = Utc::now();
        self.store.messages.update_content(message_id, content, now).await?;
        message.content = content.to_string();
        message.edited_at = Some(now);

        let dto = ChatMessageDto::new(&message, Some(user));
        if let Err(e) = self.router.publish_message_edited(&dto).await {
            self.router.send_error(&user.username, &e, None).await;
        }
        Ok(dto)
    }

    /// Sender or a room admin. Repoints the room's last message if needed.
    pub async fn delete_message(&self, user: &User, message_id: MessageId) -> ChatResult<()> {
        let message = self.find_message(message_id).await?;
        let room = self.membership.room(message.room_id).await?;
        if message.sender_id != Some(user.id) && !self.membership.is_admin(user.id, room.id).await? {
            return Err(ChatError::Forbidden(
                "Only the sender or a room admin can delete this message".into(),
            ));
        }

        self.store.statuses.delete_by_message(message_id).await?;
        self.store.messages.delete(message_id).await?;
        if room.last_message_id == Some(message_id) {
            let previous = self.store.messages.latest(room.id).await?.map(|m| m.id);
            self.store.rooms.update_last_message(room.id, previous).await?;
        }

        if let Err(e) = self
            .router
            .publish_message_deleted(room.id, message_id, user.id)
            .await
        {
            self.router.send_error(&user.username, &e, None).await;
        }
        Ok(())
    }

    /// Admin-only SYSTEM notice.
    pub async fn broadcast_system(&self, admin: &User, room_id: RoomId, content: &str) -> ChatResult<ChatMessageDto> {
        let content = validate_content(content)?;
        self.membership.room(room_id).await?;
        self.membership.assert_can_moderate(admin.id, room_id).await?;
        let message = self.post_system_message(room_id, content.to_string()).await?;
        Ok(ChatMessageDto::new(&message, None))
    }

    pub async fn history(&self, user: &User, room_id: RoomId, page: u64, size: u64) -> ChatResult<Vec<ChatMessageDto>> {
        self.membership.room(room_id).await?;
        if !self.membership.is_participant(user.id, room_id).await? {
            return Err(ChatError::NotParticipant);
        }
        let size = size.clamp(1, MAX_PAGE_SIZE);
        let messages = self.store.messages.page(room_id, page, size).await?;
        let mut dtos = Vec::with_capacity(messages.len());
        for m in &messages {
            dtos.push(self.message_dto(m).await?);
        }
        Ok(dtos)
    }

    pub async fn get_message(&self, user: &User, message_id: MessageId) -> ChatResult<ChatMessageDto> {
        let message = self.find_message(message_id).await?;
        if !self.membership.is_participant(user.id, message.room_id).await? {
            return Err(ChatError::NotParticipant);
        }
        let statuses = self.store.statuses.list_by_message(message_id).await?;
        Ok(self.message_dto(&message).await?.with_statuses(&statuses))
    }

    pub(crate) async fn find_message(&self, message_id: MessageId) -> ChatResult<ChatMessage> {
        self.store
            .messages
            .find_by_id(message_id)
            .await?
            .ok_or_else(|| ChatError::not_found("Message"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RoomRole, RoomType};
    use crate::rooms::CreateRoom;
    use crate::router::destinations;
    use crate::test_support::TestChat;

    async fn group(chat: &TestChat, admin: &User, members: &[&User]) -> RoomId {
        chat.core
            .create_room(
                admin,
                CreateRoom {
                    room_type: RoomType::Group,
                    name: Some("Ops".into()),
                    participant_ids: members.iter().map(|u| u.id).collect(),
                    participant_role: None,
                },
            )
            .await
            .unwrap()
            .id
    }

    #[test]
    fn text_with_extra_words_keeps_text_type() {
        let c = classify_content("check this https://x.com/a.jpg");
        assert_eq!(c.message_type, MessageType::Text);
        assert_eq!(c.content, "check this https://x.com/a.jpg");
        assert_eq!(c.attachments, vec!["https://x.com/a.jpg"]);
    }

    #[test]
    fn image_only_content_becomes_photo() {
        let c = classify_content("https://x.com/a.jpg");
        assert_eq!(c.message_type, MessageType::Image);
        assert_eq!(c.content, "Photo");
        assert_eq!(c.attachments, vec!["https://x.com/a.jpg"]);
    }

    #[test]
    fn image_heuristics() {
        assert!(is_image_url("https://x.com/pic.PNG?w=200"));
        assert!(is_image_url("https://x.com/images/42"));
        assert!(is_image_url("https://cdn.x.com/image/42"));
        assert!(!is_image_url("https://x.com/docs/readme"));
    }

    #[test]
    fn plain_links_are_attachments_on_text() {
        let c = classify_content("see https://example.com/page and https://example.com/page");
        assert_eq!(c.message_type, MessageType::Text);
        assert_eq!(c.attachments, vec!["https://example.com/page"]);
    }

    #[actix_web::test]
    async fn send_classifies_and_broadcasts_once() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let bob = chat.user("bob").await;
        let room_id = group(&chat, &alice, &[&bob]).await;
        chat.transport.clear();

        let photo = chat.core.send_text(&alice, room_id, "https://x.com/a.jpg").await.unwrap();
        assert_eq!(photo.message_type, MessageType::Image);
        assert_eq!(photo.content, "Photo");
        let text = chat
            .core
            .send_text(&alice, room_id, "check this https://x.com/a.jpg")
            .await
            .unwrap();
        assert_eq!(text.message_type, MessageType::Text);
        assert_eq!(text.attachment_urls, vec!["https://x.com/a.jpg"]);

        let room_feed = chat.transport.published_to(&destinations::room(room_id));
        assert_eq!(room_feed.len(), 2);
        assert_eq!(room_feed[0]["id"], photo.id);
        assert_eq!(room_feed[1]["id"], text.id);
        let room = chat.core.get_room(&bob, room_id).await.unwrap();
        assert_eq!(room.last_message_id, Some(text.id));
    }

    #[actix_web::test]
    async fn muted_sender_is_rejected_without_side_effects() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let bob = chat.user("bob").await;
        let room_id = group(&chat, &alice, &[&bob]).await;
        let b = chat.core.membership.participant(bob.id, room_id).await.unwrap();
        chat.core.update_flags(&alice, b.id, true, false).await.unwrap();
        let before = chat.core.history(&alice, room_id, 0, 50).await.unwrap().len();
        chat.transport.clear();

        assert!(matches!(
            chat.core.send_text(&bob, room_id, "hello").await,
            Err(ChatError::Muted)
        ));
        assert_eq!(chat.core.history(&alice, room_id, 0, 50).await.unwrap().len(), before);
        assert!(chat.transport.published().is_empty());
        assert!(chat.push.batches().is_empty());
    }

    #[actix_web::test]
    async fn outsiders_and_empty_content_are_rejected() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let mallory = chat.user("mallory").await;
        let room_id = group(&chat, &alice, &[]).await;

        assert!(matches!(
            chat.core.send_text(&mallory, room_id, "hi").await,
            Err(ChatError::NotParticipant)
        ));
        assert!(matches!(
            chat.core.send_text(&alice, room_id, "   ").await,
            Err(ChatError::InvalidRequest(_))
        ));
        let too_long = "a".repeat(MAX_CONTENT_LEN + 1);
        assert!(matches!(
            chat.core.send_text(&alice, room_id, &too_long).await,
            Err(ChatError::InvalidRequest(_))
        ));
    }

    #[actix_web::test]
    async fn pages_past_the_end_are_empty() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let room_id = group(&chat, &alice, &[]).await;
        chat.core.send_text(&alice, room_id, "hello").await.unwrap();

        assert_eq!(chat.core.history(&alice, room_id, 0, 20).await.unwrap().len(), 2);
        assert!(chat.core.history(&alice, room_id, 5, 20).await.unwrap().is_empty());
        assert!(chat.core.history(&alice, room_id, u64::MAX, 20).await.unwrap().is_empty());
        assert!(chat.core.history(&alice, room_id, u64::MAX, u64::MAX).await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn edit_is_sender_only_and_delete_repoints_last_message() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let bob = chat.user("bob").await;
        let room_id = group(&chat, &alice, &[&bob]).await;
        let first = chat.core.send_text(&bob, room_id, "first").await.unwrap();
        let second = chat.core.send_text(&bob, room_id, "second").await.unwrap();

        assert!(matches!(
            chat.core.edit_message(&alice, second.id, "nope").await,
            Err(ChatError::Forbidden(_))
        ));
        let edited = chat.core.edit_message(&bob, second.id, "second!").await.unwrap();
        assert!(edited.edited_at.is_some());

        // Alice is the room admin, so she may delete Bob's message.
        chat.core.delete_message(&alice, second.id).await.unwrap();
        let room = chat.core.get_room(&bob, room_id).await.unwrap();
        assert_eq!(room.last_message_id, Some(first.id));
        let deleted = chat.transport.published_to(&destinations::room(room_id));
        assert_eq!(deleted.last().unwrap()["type"], "MESSAGE_DELETED");
        assert_eq!(
            chat.core.membership.participant(alice.id, room_id).await.unwrap().role,
            RoomRole::Admin
        );
    }

    #[actix_web::test]
    async fn uploaded_image_is_served_from_its_url() {
        use base64::Engine;

        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let room_id = group(&chat, &alice, &[]).await;
        let upload = ImageUpload {
            data: base64::engine::general_purpose::STANDARD.encode([0x89u8, b'P', b'N', b'G']),
            filename: Some("dot.png".into()),
            content_type: Some("image/png".into()),
        };

        let dto = chat.core.send_image_upload(&alice, room_id, &upload).await.unwrap();
        assert_eq!(dto.message_type, MessageType::Image);
        let url = &dto.attachment_urls[0];
        let id = url.strip_prefix("http://chat.test/api/v1/images/").unwrap();
        let image = chat.core.fetch_image(id).await.unwrap();
        assert_eq!(image.data, vec![0x89u8, b'P', b'N', b'G']);
        assert_eq!(image.message_id, Some(dto.id));
    }
}
