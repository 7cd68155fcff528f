// File: chat.rs
//
// REST endpoints for rooms, messages, delivery statuses and stored images.

use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;

use crate::app_state::AppState;
use crate::auth::current_user;
use crate::dto::ApiResponse;
use crate::error::ChatError;
use crate::images::ImageUpload;
use crate::messaging::DEFAULT_PAGE_SIZE;
use crate::models::{DeliveryStatus, MessageId, RoomId, RoomRole, RoomType, UserId};
use crate::rooms::CreateRoom;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    #[serde(rename = "type")]
    pub room_type: RoomType,
    pub name: Option<String>,
    #[serde(default)]
    pub participant_ids: Vec<UserId>,
    pub participant_role: Option<RoomRole>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoomRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRoomQuery {
    #[serde(default)]
    pub delete_for_all: bool,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u64>,
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ContentRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMessageRequest {
    pub image_data: Option<String>,
    pub image_url: Option<String>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    pub message_id: MessageId,
    pub status: DeliveryStatus,
}

/// GET /api/rooms
pub async fn list_rooms(req: HttpRequest, data: web::Data<AppState>) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let rooms = data.core.list_rooms(&me).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Chat rooms retrieved", rooms)))
}

/// POST /api/rooms
/// PERSONAL returns the existing room for the pair when there is one.
pub async fn create_room(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<CreateRoomRequest>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let payload = payload.into_inner();
    let room = data
        .core
        .create_room(
            &me,
            CreateRoom {
                room_type: payload.room_type,
                name: payload.name,
                participant_ids: payload.participant_ids,
                participant_role: payload.participant_role,
            },
        )
        .await?;
    Ok(HttpResponse::Created().json(ApiResponse::ok("Chat room ready", room)))
}

/// GET /api/rooms/{id}
pub async fn get_room(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<RoomId>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let room = data.core.get_room(&me, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Chat room retrieved", room)))
}

/// PUT /api/rooms/{id}
pub async fn update_room(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<RoomId>,
    payload: web::Json<UpdateRoomRequest>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let room = data.core.update_room(&me, path.into_inner(), &payload.name).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Chat room updated", room)))
}

/// DELETE /api/rooms/{id}?deleteForAll=
pub async fn delete_room(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<RoomId>,
    query: web::Query<DeleteRoomQuery>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    data.core
        .delete_or_leave_room(&me, path.into_inner(), query.delete_for_all)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::done("Chat room left or deleted")))
}

/// GET /api/messages/room/{roomId}?page=&size=
pub async fn get_messages(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<RoomId>,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let messages = data
        .core
        .history(
            &me,
            path.into_inner(),
            query.page.unwrap_or(0),
            query.size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Messages retrieved", messages)))
}

/// POST /api/messages/room/{roomId}
pub async fn create_message(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<RoomId>,
    payload: web::Json<ContentRequest>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let message = data.core.send_text(&me, path.into_inner(), &payload.content).await?;
    Ok(HttpResponse::Created().json(ApiResponse::ok("Message sent", message)))
}

/// POST /api/messages/room/{roomId}/image
/// Either a base64 upload or an external URL.
pub async fn create_image_message(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<RoomId>,
    payload: web::Json<ImageMessageRequest>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let room_id = path.into_inner();
    let payload = payload.into_inner();
    let message = match (payload.image_data, payload.image_url) {
        (Some(image_data), _) => {
            let upload = ImageUpload {
                data: image_data,
                filename: payload.filename,
                content_type: payload.content_type,
            };
            data.core.send_image_upload(&me, room_id, &upload).await?
        }
        (None, Some(url)) => data.core.send_image_url(&me, room_id, &url).await?,
        (None, None) => {
            return Err(ChatError::InvalidRequest(
                "Either imageData or imageUrl is required".into(),
            ))
        }
    };
    Ok(HttpResponse::Created().json(ApiResponse::ok("Image sent", message)))
}

/// POST /api/messages/room/{roomId}/system
pub async fn create_system_message(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<RoomId>,
    payload: web::Json<ContentRequest>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let message = data
        .core
        .broadcast_system(&me, path.into_inner(), &payload.content)
        .await?;
    Ok(HttpResponse::Created().json(ApiResponse::ok("System message sent", message)))
}

/// GET /api/messages/{id}
pub async fn get_message(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<MessageId>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let message = data.core.get_message(&me, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Message retrieved", message)))
}

/// PUT /api/messages/{id}
pub async fn update_message(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<MessageId>,
    payload: web::Json<ContentRequest>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let message = data
        .core
        .edit_message(&me, path.into_inner(), &payload.content)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Message updated", message)))
}

/// DELETE /api/messages/{id}
pub async fn delete_message(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<MessageId>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    data.core.delete_message(&me, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::done("Message deleted")))
}

/// POST /api/messagestatus
pub async fn record_status(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<StatusRequest>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let status = data
        .core
        .record_status(&me, payload.message_id, payload.status)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Message status updated", status)))
}

/// GET /api/messagestatus/message/{messageId}
pub async fn get_statuses(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<MessageId>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let statuses = data.core.list_statuses(&me, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Message statuses retrieved", statuses)))
}

/// GET /api/v1/images/{id}
/// Public, so `<img>` tags can load it without a token.
pub async fn get_image(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ChatError> {
    let image = data.core.fetch_image(&path.into_inner()).await?;
    Ok(HttpResponse::Ok()
        .content_type(image.content_type.as_str())
        .insert_header((
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{}\"", image.filename.replace('"', "")),
        ))
        .insert_header((header::CACHE_CONTROL, "public, max-age=31536000"))
        .body(image.data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix::Actor;
    use actix_web::{http::StatusCode, test, App};
    use serde_json::{json, Value};

    use crate::auth::create_access_token;
    use crate::chat_server::ChatServer;
    use crate::config::Config;
    use crate::test_support::TestChat;
    use crate::Authentication;

    fn bearer(username: &str, config: &Config) -> (header::HeaderName, String) {
        let token = create_access_token(username, config).unwrap();
        (header::AUTHORIZATION, format!("Bearer {}", token))
    }

    #[actix_web::test]
    async fn personal_chat_round_trip_over_rest() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let bob = chat.user("bob").await;
        let config = Config::for_tests();
        let state = AppState {
            chat_server: ChatServer::new().start(),
            core: chat.core.clone(),
            config: config.clone(),
        };
        let app = test::init_service(
            App::new()
                .wrap(Authentication::new(&config.jwt_secret))
                .app_data(web::Data::new(state))
                .route("/api/rooms", web::post().to(create_room))
                .route("/api/messages/room/{room_id}", web::get().to(get_messages))
                .route("/api/messages/room/{room_id}", web::post().to(create_message)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/rooms")
            .insert_header(bearer("alice", &config))
            .set_json(json!({ "type": "PERSONAL", "participantIds": [bob.id] }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "success");
        let room_id = body["data"]["id"].as_i64().unwrap();

        let req = test::TestRequest::post()
            .uri(&format!("/api/messages/room/{}", room_id))
            .insert_header(bearer("alice", &config))
            .set_json(json!({ "content": "hi bob" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let req = test::TestRequest::get()
            .uri(&format!("/api/messages/room/{}", room_id))
            .insert_header(bearer("bob", &config))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        let messages = body["data"].as_array().unwrap();
        assert!(messages
            .iter()
            .any(|m| m["content"] == "hi bob" && m["senderId"] == alice.id));
    }

    #[actix_web::test]
    async fn outsiders_get_a_structured_error() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let bob = chat.user("bob").await;
        chat.user("mallory").await;
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
        let config = Config::for_tests();
        let state = AppState {
            chat_server: ChatServer::new().start(),
            core: chat.core.clone(),
            config: config.clone(),
        };
        let app = test::init_service(
            App::new()
                .wrap(Authentication::new(&config.jwt_secret))
                .app_data(web::Data::new(state))
                .route("/api/messages/room/{room_id}", web::post().to(create_message)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri(&format!("/api/messages/room/{}", room.id))
            .insert_header(bearer("mallory", &config))
            .set_json(json!({ "content": "let me in" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["code"], "NOT_PARTICIPANT");
    }

    #[actix_web::test]
    async fn locked_account_is_turned_away_despite_a_valid_token() {
        let chat = TestChat::new();
        let mut locked = crate::models::User::new("dave", None, None, "hash".into());
        locked.locked = true;
        crate::repository::UserRepository::insert(chat.store.as_ref(), locked)
            .await
            .unwrap();
        let config = Config::for_tests();
        let state = AppState {
            chat_server: ChatServer::new().start(),
            core: chat.core.clone(),
            config: config.clone(),
        };
        let app = test::init_service(
            App::new()
                .wrap(Authentication::new(&config.jwt_secret))
                .app_data(web::Data::new(state))
                .route("/api/rooms", web::get().to(list_rooms)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/api/rooms")
            .insert_header(bearer("dave", &config))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["code"], "AUTH_FAILURE");
    }
}
