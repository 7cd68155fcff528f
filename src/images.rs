// src/images.rs

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;

use crate::chat_core::ChatCore;
use crate::error::{ChatError, ChatResult};
use crate::models::{ImageDocument, RoomId, UserId};

pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
const ALLOWED_TYPES: [&str; 5] = ["image/jpeg", "image/jpg", "image/png", "image/gif", "image/webp"];

/// Image as sent by a client: base64 payload, optionally a `data:` URL.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub data: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, PartialEq)]
pub struct DecodedImage {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub content_type: String,
}

pub fn decode_upload(upload: &ImageUpload) -> ChatResult<DecodedImage> {
    let raw = upload.data.trim();
    if raw.is_empty() {
        return Err(ChatError::InvalidRequest("Image data is empty".into()));
    }
    let encoded = match raw.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => raw,
    };
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| ChatError::InvalidRequest(format!("Image data is not valid base64: {}", e)))?;

    if bytes.is_empty() {
        return Err(ChatError::InvalidRequest("Image data is empty".into()));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ChatError::InvalidRequest(format!(
            "Image exceeds maximum size of {} bytes",
            MAX_IMAGE_BYTES
        )));
    }

    let content_type = upload
        .content_type
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or("image/jpeg")
        .to_lowercase();
    if !ALLOWED_TYPES.contains(&content_type.as_str()) {
        return Err(ChatError::InvalidRequest(format!(
            "Unsupported image type '{}'",
            content_type
        )));
    }

    let filename = upload
        .filename
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .unwrap_or("image.jpg")
        .to_string();

    Ok(DecodedImage {
        bytes,
        filename,
        content_type,
    })
}

impl ChatCore {
    pub fn image_url(&self, image_id: &str) -> String {
        format!("{}/api/v1/images/{}", self.base_url, image_id)
    }

    /// First half of the two-phase write; the message link comes later.
    pub(crate) async fn store_image(
        &self,
        image: DecodedImage,
        uploaded_by: UserId,
        room_id: RoomId,
    ) -> ChatResult<ImageDocument> {
        let document = ImageDocument {
            id: String::new(),
            filename: image.filename,
            content_type: image.content_type,
            size: image.bytes.len() as i64,
            data: image.bytes,
            uploaded_by,
            room_id,
            message_id: None,
            uploaded_at: Utc::now(),
        };
        self.store.images.save(document).await
    }

    pub async fn fetch_image(&self, image_id: &str) -> ChatResult<ImageDocument> {
        self.store
            .images
            .find(image_id)
            .await?
            .ok_or_else(|| ChatError::not_found("Image"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(data: &str, content_type: Option<&str>) -> ImageUpload {
        ImageUpload {
            data: data.to_string(),
            filename: None,
            content_type: content_type.map(str::to_string),
        }
    }

    #[test]
    fn data_url_prefix_is_stripped_and_defaults_apply() {
        let encoded = STANDARD.encode(b"\x89PNG fake");
        let decoded = decode_upload(&upload(&format!("data:image/png;base64,{}", encoded), None)).unwrap();
        assert_eq!(decoded.bytes, b"\x89PNG fake");
        assert_eq!(decoded.filename, "image.jpg");
        assert_eq!(decoded.content_type, "image/jpeg");
    }

    #[test]
    fn rejects_unknown_types_and_bad_base64() {
        let encoded = STANDARD.encode(b"abc");
        assert!(matches!(
            decode_upload(&upload(&encoded, Some("application/pdf"))),
            Err(ChatError::InvalidRequest(_))
        ));
        assert!(decode_upload(&upload("***", Some("image/png"))).is_err());
    }
}
