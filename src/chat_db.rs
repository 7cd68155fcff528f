// src/chat_db.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use log::info;
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{doc, to_bson, Binary, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, Cursor, Database, IndexModel};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::models::{
    ChatMessage, ChatRoom, DeliveryStatus, FcmToken, ImageDocument, MessageId, MessageStatus,
    Participant, ParticipantId, RoomId, RoomRole, User, UserId,
};
use crate::repository::{
    ImageStore, MessageRepository, MessageStatusRepository, ParticipantRepository,
    PushTokenRepository, RoomRepository, UserRepository,
};

const USERS: &str = "users";
const ROOMS: &str = "chat_rooms";
const PARTICIPANTS: &str = "participants";
const MESSAGES: &str = "messages";
const STATUSES: &str = "message_statuses";
const IMAGES: &str = "images";
const FCM_TOKENS: &str = "fcm_tokens";
const COUNTERS: &str = "counters";

pub struct MongoDB {
    pub client: Client,
    pub db: Database,
}

/// Blob as stored; bytes go in as BSON binary.
#[derive(Serialize, Deserialize)]
struct ImageRecord {
    #[serde(rename = "_id")]
    id: String,
    filename: String,
    content_type: String,
    size: i64,
    data: Binary,
    uploaded_by: UserId,
    room_id: RoomId,
    message_id: Option<MessageId>,
    uploaded_at: DateTime<Utc>,
}

impl From<ImageRecord> for ImageDocument {
    fn from(r: ImageRecord) -> Self {
        ImageDocument {
            id: r.id,
            filename: r.filename,
            content_type: r.content_type,
            size: r.size,
            data: r.data.bytes,
            uploaded_by: r.uploaded_by,
            room_id: r.room_id,
            message_id: r.message_id,
            uploaded_at: r.uploaded_at,
        }
    }
}

impl MongoDB {
    pub async fn init(uri: &str, db_name: &str) -> ChatResult<Self> {
        let client_options = ClientOptions::parse(uri).await?;
        let client = Client::with_options(client_options)?;
        let db = client.database(db_name);
        let mongo = MongoDB { client, db };
        mongo.ensure_indexes().await?;
        info!("Connected to MongoDB database '{}'", db_name);
        Ok(mongo)
    }

    async fn ensure_indexes(&self) -> ChatResult<()> {
        let unique = |keys: Document| {
            IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().unique(true).build())
                .build()
        };
        self.db
            .collection::<Document>(USERS)
            .create_index(unique(doc! { "username": 1 }))
            .await?;
        self.db
            .collection::<Document>(PARTICIPANTS)
            .create_index(unique(doc! { "user_id": 1, "room_id": 1 }))
            .await?;
        self.db
            .collection::<Document>(STATUSES)
            .create_index(unique(doc! { "message_id": 1, "receiver_id": 1 }))
            .await?;
        self.db
            .collection::<Document>(FCM_TOKENS)
            .create_index(unique(doc! { "token": 1 }))
            .await?;
        self.db
            .collection::<Document>(ROOMS)
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "personal_key": 1 })
                    .options(
                        IndexOptions::builder()
                            .unique(true)
                            .partial_filter_expression(doc! { "personal_key": { "$type": "string" } })
                            .build(),
                    )
                    .build(),
            )
            .await?;
        self.db
            .collection::<Document>(MESSAGES)
            .create_index(IndexModel::builder().keys(doc! { "room_id": 1, "_id": 1 }).build())
            .await?;
        Ok(())
    }

    fn users(&self) -> Collection<User> {
        self.db.collection(USERS)
    }

    fn rooms(&self) -> Collection<ChatRoom> {
        self.db.collection(ROOMS)
    }

    fn participants(&self) -> Collection<Participant> {
        self.db.collection(PARTICIPANTS)
    }

    fn messages(&self) -> Collection<ChatMessage> {
        self.db.collection(MESSAGES)
    }

    fn statuses(&self) -> Collection<MessageStatus> {
        self.db.collection(STATUSES)
    }

    fn images(&self) -> Collection<ImageRecord> {
        self.db.collection(IMAGES)
    }

    fn fcm_tokens(&self) -> Collection<FcmToken> {
        self.db.collection(FCM_TOKENS)
    }

    /// Monotonic i64 ids per collection.
    async fn next_id(&self, sequence: &str) -> ChatResult<i64> {
        let counter = self
            .db
            .collection::<Document>(COUNTERS)
            .find_one_and_update(doc! { "_id": sequence }, doc! { "$inc": { "seq": 1i64 } })
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await?;
        counter
            .and_then(|d| d.get_i64("seq").ok())
            .ok_or_else(|| ChatError::Storage(format!("counter '{}' not returned", sequence)))
    }
}

async fn collect_all<T>(mut cursor: Cursor<T>) -> ChatResult<Vec<T>>
where
    T: DeserializeOwned + Unpin + Send + Sync,
{
    let mut items = Vec::new();
    while let Some(item) = cursor.next().await {
        items.push(item?);
    }
    Ok(items)
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    match e.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == 11000,
        _ => false,
    }
}

#[async_trait]
impl UserRepository for MongoDB {
    async fn insert(&self, mut user: User) -> ChatResult<User> {
        user.id = self.next_id(USERS).await?;
        match self.users().insert_one(&user).await {
            Ok(_) => Ok(user),
            Err(e) if is_duplicate_key(&e) => Err(ChatError::InvalidRequest(format!(
                "Username '{}' is already taken",
                user.username
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_id(&self, id: UserId) -> ChatResult<Option<User>> {
        Ok(self.users().find_one(doc! { "_id": id }).await?)
    }

    async fn find_by_username(&self, username: &str) -> ChatResult<Option<User>> {
        Ok(self.users().find_one(doc! { "username": username }).await?)
    }

    async fn find_by_ids(&self, ids: &[UserId]) -> ChatResult<Vec<User>> {
        let cursor = self.users().find(doc! { "_id": { "$in": ids.to_vec() } }).await?;
        collect_all(cursor).await
    }

    async fn search(&self, query: &str, limit: i64) -> ChatResult<Vec<User>> {
        let pattern = regex::escape(query);
        let filter = doc! {
            "$or": [
                { "username": { "$regex": &pattern, "$options": "i" } },
                { "full_name": { "$regex": &pattern, "$options": "i" } },
            ]
        };
        let cursor = self
            .users()
            .find(filter)
            .sort(doc! { "_id": 1 })
            .limit(limit)
            .await?;
        collect_all(cursor).await
    }

    async fn update_profile(
        &self,
        id: UserId,
        full_name: Option<String>,
        avatar_url: Option<String>,
    ) -> ChatResult<()> {
        let mut set = doc! { "updated_at": to_bson(&Utc::now())? };
        if let Some(name) = full_name {
            set.insert("full_name", name);
        }
        if let Some(url) = avatar_url {
            set.insert("avatar_url", url);
        }
        let result = self.users().update_one(doc! { "_id": id }, doc! { "$set": set }).await?;
        if result.matched_count == 0 {
            return Err(ChatError::not_found("User"));
        }
        Ok(())
    }

    async fn touch_login(&self, id: UserId, at: DateTime<Utc>) -> ChatResult<()> {
        self.users()
            .update_one(doc! { "_id": id }, doc! { "$set": { "last_login": to_bson(&at)? } })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RoomRepository for MongoDB {
    async fn insert(&self, mut room: ChatRoom) -> ChatResult<ChatRoom> {
        room.id = self.next_id(ROOMS).await?;
        match self.rooms().insert_one(&room).await {
            Ok(_) => Ok(room),
            Err(e) if is_duplicate_key(&e) => {
                Err(ChatError::InvalidState("Personal chat already exists".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_id(&self, id: RoomId) -> ChatResult<Option<ChatRoom>> {
        Ok(self.rooms().find_one(doc! { "_id": id }).await?)
    }

    async fn find_by_ids(&self, ids: &[RoomId]) -> ChatResult<Vec<ChatRoom>> {
        let cursor = self.rooms().find(doc! { "_id": { "$in": ids.to_vec() } }).await?;
        collect_all(cursor).await
    }

    async fn find_personal(&self, personal_key: &str) -> ChatResult<Option<ChatRoom>> {
        Ok(self
            .rooms()
            .find_one(doc! { "personal_key": personal_key, "type": "PERSONAL" })
            .await?)
    }

    async fn rename(&self, id: RoomId, name: &str) -> ChatResult<()> {
        let result = self
            .rooms()
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "name": name, "updated_at": to_bson(&Utc::now())? } },
            )
            .await?;
        if result.matched_count == 0 {
            return Err(ChatError::not_found("Chat room"));
        }
        Ok(())
    }

    async fn update_last_message(&self, id: RoomId, message_id: Option<MessageId>) -> ChatResult<()> {
        self.rooms()
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "last_message_id": to_bson(&message_id)? } },
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, id: RoomId) -> ChatResult<()> {
        self.rooms().delete_one(doc! { "_id": id }).await?;
        Ok(())
    }
}

#[async_trait]
impl ParticipantRepository for MongoDB {
    async fn insert(&self, mut participant: Participant) -> ChatResult<Participant> {
        participant.id = self.next_id(PARTICIPANTS).await?;
        match self.participants().insert_one(&participant).await {
            Ok(_) => Ok(participant),
            Err(e) if is_duplicate_key(&e) => Err(ChatError::InvalidState(
                "User is already a participant in this chat room".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn find(&self, user_id: UserId, room_id: RoomId) -> ChatResult<Option<Participant>> {
        Ok(self
            .participants()
            .find_one(doc! { "user_id": user_id, "room_id": room_id })
            .await?)
    }

    async fn find_by_id(&self, id: ParticipantId) -> ChatResult<Option<Participant>> {
        Ok(self.participants().find_one(doc! { "_id": id }).await?)
    }

    async fn list_by_room(&self, room_id: RoomId) -> ChatResult<Vec<Participant>> {
        let cursor = self
            .participants()
            .find(doc! { "room_id": room_id })
            .sort(doc! { "_id": 1 })
            .await?;
        collect_all(cursor).await
    }

    async fn list_by_user(&self, user_id: UserId) -> ChatResult<Vec<Participant>> {
        let cursor = self
            .participants()
            .find(doc! { "user_id": user_id })
            .sort(doc! { "_id": 1 })
            .await?;
        collect_all(cursor).await
    }

    async fn count_admins(&self, room_id: RoomId) -> ChatResult<u64> {
        Ok(self
            .participants()
            .count_documents(doc! { "room_id": room_id, "role": "ADMIN" })
            .await?)
    }

    async fn set_role(&self, id: ParticipantId, role: RoomRole) -> ChatResult<()> {
        self.participants()
            .update_one(doc! { "_id": id }, doc! { "$set": { "role": to_bson(&role)? } })
            .await?;
        Ok(())
    }

    async fn set_flags(&self, id: ParticipantId, muted: bool, blocked: bool) -> ChatResult<()> {
        self.participants()
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "muted": muted, "blocked": blocked } },
            )
            .await?;
        Ok(())
    }

    async fn set_last_read(&self, id: ParticipantId, message_id: MessageId) -> ChatResult<()> {
        self.participants()
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "last_read_message_id": message_id } },
            )
            .await?;
        Ok(())
    }

    async fn set_presence(
        &self,
        user_id: UserId,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    ) -> ChatResult<()> {
        let mut set = doc! { "online": online };
        if let Some(at) = last_seen {
            set.insert("last_seen", to_bson(&at)?);
        }
        self.participants()
            .update_many(doc! { "user_id": user_id }, doc! { "$set": set })
            .await?;
        Ok(())
    }

    async fn delete(&self, id: ParticipantId) -> ChatResult<()> {
        self.participants().delete_one(doc! { "_id": id }).await?;
        Ok(())
    }

    async fn delete_by_room(&self, room_id: RoomId) -> ChatResult<()> {
        self.participants().delete_many(doc! { "room_id": room_id }).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for MongoDB {
    async fn insert(&self, mut message: ChatMessage) -> ChatResult<ChatMessage> {
        message.id = self.next_id(MESSAGES).await?;
        self.messages().insert_one(&message).await?;
        Ok(message)
    }

    async fn find_by_id(&self, id: MessageId) -> ChatResult<Option<ChatMessage>> {
        Ok(self.messages().find_one(doc! { "_id": id }).await?)
    }

    async fn find_by_ids(&self, ids: &[MessageId]) -> ChatResult<Vec<ChatMessage>> {
        let cursor = self.messages().find(doc! { "_id": { "$in": ids.to_vec() } }).await?;
        collect_all(cursor).await
    }

    async fn page(&self, room_id: RoomId, page: u64, size: u64) -> ChatResult<Vec<ChatMessage>> {
        // Past any room's last page.
        let Some(offset) = page.checked_mul(size) else {
            return Ok(Vec::new());
        };
        let cursor = self
            .messages()
            .find(doc! { "room_id": room_id })
            .sort(doc! { "_id": 1 })
            .skip(offset)
            .limit(size as i64)
            .await?;
        collect_all(cursor).await
    }

    async fn latest(&self, room_id: RoomId) -> ChatResult<Option<ChatMessage>> {
        Ok(self
            .messages()
            .find_one(doc! { "room_id": room_id })
            .sort(doc! { "_id": -1 })
            .await?)
    }

    async fn update_content(&self, id: MessageId, content: &str, at: DateTime<Utc>) -> ChatResult<()> {
        let result = self
            .messages()
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "content": content, "edited_at": to_bson(&at)? } },
            )
            .await?;
        if result.matched_count == 0 {
            return Err(ChatError::not_found("Message"));
        }
        Ok(())
    }

    async fn delete(&self, id: MessageId) -> ChatResult<()> {
        self.messages().delete_one(doc! { "_id": id }).await?;
        Ok(())
    }

    async fn delete_by_room(&self, room_id: RoomId) -> ChatResult<()> {
        self.messages().delete_many(doc! { "room_id": room_id }).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStatusRepository for MongoDB {
    async fn find(&self, message_id: MessageId, receiver_id: UserId) -> ChatResult<Option<MessageStatus>> {
        Ok(self
            .statuses()
            .find_one(doc! { "message_id": message_id, "receiver_id": receiver_id })
            .await?)
    }

    async fn insert_if_absent(&self, mut status: MessageStatus) -> ChatResult<Option<MessageStatus>> {
        status.id = self.next_id(STATUSES).await?;
        match self.statuses().insert_one(&status).await {
            Ok(_) => Ok(Some(status)),
            Err(e) if is_duplicate_key(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn advance(
        &self,
        message_id: MessageId,
        receiver_id: UserId,
        from: &[DeliveryStatus],
        to: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> ChatResult<Option<MessageStatus>> {
        let filter = doc! {
            "message_id": message_id,
            "receiver_id": receiver_id,
            "status": { "$in": to_bson(&from)? },
        };
        let update = doc! { "$set": { "status": to_bson(&to)?, "updated_at": to_bson(&at)? } };
        Ok(self
            .statuses()
            .find_one_and_update(filter, update)
            .return_document(ReturnDocument::After)
            .await?)
    }

    async fn list_by_message(&self, message_id: MessageId) -> ChatResult<Vec<MessageStatus>> {
        let cursor = self
            .statuses()
            .find(doc! { "message_id": message_id })
            .sort(doc! { "_id": 1 })
            .await?;
        collect_all(cursor).await
    }

    async fn delete_by_message(&self, message_id: MessageId) -> ChatResult<()> {
        self.statuses().delete_many(doc! { "message_id": message_id }).await?;
        Ok(())
    }

    async fn delete_by_room(&self, room_id: RoomId) -> ChatResult<()> {
        self.statuses().delete_many(doc! { "room_id": room_id }).await?;
        Ok(())
    }
}

#[async_trait]
impl ImageStore for MongoDB {
    async fn save(&self, mut image: ImageDocument) -> ChatResult<ImageDocument> {
        image.id = Uuid::new_v4().to_string();
        let record = ImageRecord {
            id: image.id.clone(),
            filename: image.filename.clone(),
            content_type: image.content_type.clone(),
            size: image.size,
            data: Binary {
                subtype: BinarySubtype::Generic,
                bytes: image.data.clone(),
            },
            uploaded_by: image.uploaded_by,
            room_id: image.room_id,
            message_id: image.message_id,
            uploaded_at: image.uploaded_at,
        };
        self.images().insert_one(&record).await?;
        Ok(image)
    }

    async fn find(&self, id: &str) -> ChatResult<Option<ImageDocument>> {
        Ok(self
            .images()
            .find_one(doc! { "_id": id })
            .await?
            .map(ImageDocument::from))
    }

    async fn link_message(&self, id: &str, message_id: MessageId) -> ChatResult<()> {
        let result = self
            .images()
            .update_one(doc! { "_id": id }, doc! { "$set": { "message_id": message_id } })
            .await?;
        if result.matched_count == 0 {
            return Err(ChatError::not_found("Image"));
        }
        Ok(())
    }
}

#[async_trait]
impl PushTokenRepository for MongoDB {
    async fn upsert(&self, user_id: UserId, token: &str, device_type: Option<String>) -> ChatResult<FcmToken> {
        let now = to_bson(&Utc::now())?;
        let mut set = doc! { "user_id": user_id, "active": true, "updated_at": now.clone() };
        if let Some(device) = device_type {
            set.insert("device_type", device);
        }
        let existing = self.fcm_tokens().find_one(doc! { "token": token }).await?;
        let id = match &existing {
            Some(t) => t.id,
            None => self.next_id(FCM_TOKENS).await?,
        };
        let stored = self
            .fcm_tokens()
            .find_one_and_update(
                doc! { "token": token },
                doc! {
                    "$set": set,
                    "$setOnInsert": { "_id": id, "created_at": now },
                },
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await?;
        stored.ok_or_else(|| ChatError::Storage("push token upsert returned nothing".into()))
    }

    async fn active_for_users(&self, user_ids: &[UserId]) -> ChatResult<Vec<FcmToken>> {
        let cursor = self
            .fcm_tokens()
            .find(doc! { "user_id": { "$in": user_ids.to_vec() }, "active": true })
            .await?;
        collect_all(cursor).await
    }

    async fn deactivate(&self, token: &str) -> ChatResult<()> {
        self.fcm_tokens()
            .update_one(
                doc! { "token": token },
                doc! { "$set": { "active": false, "updated_at": to_bson(&Utc::now())? } },
            )
            .await?;
        Ok(())
    }

    async fn deactivate_for_user(&self, user_id: UserId, token: Option<&str>) -> ChatResult<u64> {
        let mut filter = doc! { "user_id": user_id, "active": true };
        if let Some(t) = token {
            filter.insert("token", t);
        }
        let result = self
            .fcm_tokens()
            .update_many(
                filter,
                doc! { "$set": { "active": false, "updated_at": to_bson(&Utc::now())? } },
            )
            .await?;
        Ok(result.modified_count)
    }
}
