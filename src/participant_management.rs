use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;

use crate::app_state::AppState;
use crate::auth::current_user;
use crate::dto::ApiResponse;
use crate::error::ChatError;
use crate::models::{MessageId, ParticipantId, RoomId, RoomRole, UserId};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddParticipantRequest {
    pub user_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    pub role: RoomRole,
}

#[derive(Debug, Deserialize)]
pub struct FlagsRequest {
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub blocked: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub message_id: MessageId,
}

/// GET /api/participants/room/{roomId}
pub async fn list_participants(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<RoomId>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let participants = data.core.list_participants(&me, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Participants retrieved", participants)))
}

/// POST /api/participants/room/{roomId}/add
pub async fn add_participant(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<RoomId>,
    payload: web::Json<AddParticipantRequest>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let participant = data
        .core
        .add_participant(&me, path.into_inner(), payload.user_id)
        .await?;
    Ok(HttpResponse::Created().json(ApiResponse::ok("Participant added", participant)))
}

/// DELETE /api/participants/{participantId}
/// Removing yourself is leaving.
pub async fn remove_participant(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<ParticipantId>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    data.core.remove_participant(&me, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::done("Participant removed")))
}

/// PUT /api/participants/{participantId}/role
pub async fn update_role(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<ParticipantId>,
    payload: web::Json<RoleRequest>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let participant = data
        .core
        .update_role(&me, path.into_inner(), payload.role)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Participant role updated", participant)))
}

/// PUT /api/participants/{participantId}/status
pub async fn update_flags(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<ParticipantId>,
    payload: web::Json<FlagsRequest>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let participant = data
        .core
        .update_flags(&me, path.into_inner(), payload.muted, payload.blocked)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Participant status updated", participant)))
}

/// PUT /api/participants/room/{roomId}/read
pub async fn mark_read(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<RoomId>,
    payload: web::Json<ReadRequest>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let participant = data
        .core
        .update_last_read(&me, path.into_inner(), payload.message_id)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Last read message updated", participant)))
}
