mod image;
mod message;
mod participant;
mod push_token;
mod room;
mod user;

pub use image::ImageDocument;
pub use message::{ChatMessage, DeliveryStatus, MessageStatus, MessageType, MAX_CONTENT_LEN};
pub use participant::{Participant, RoomRole};
pub use push_token::FcmToken;
pub use room::{personal_key, ChatRoom, RoomType};
pub use user::User;

pub type UserId = i64;
pub type RoomId = i64;
pub type MessageId = i64;
pub type ParticipantId = i64;
