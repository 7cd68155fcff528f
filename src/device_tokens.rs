use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::auth::current_user;
use crate::dto::ApiResponse;
use crate::error::ChatError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTokenRequest {
    pub token: String,
    pub device_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UnregisterTokenRequest {
    pub token: String,
}

/// POST /api/fcm-tokens/register
pub async fn register_token(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<RegisterTokenRequest>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let payload = payload.into_inner();
    let token = data
        .core
        .register_push_token(&me, &payload.token, payload.device_type)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(
        "FCM token registered",
        json!({ "deviceType": token.device_type, "active": token.active }),
    )))
}

/// DELETE /api/fcm-tokens/unregister
pub async fn unregister_token(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<UnregisterTokenRequest>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    data.core
        .unregister_push_tokens(&me, Some(payload.token.trim()))
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::done("FCM token unregistered")))
}

/// DELETE /api/fcm-tokens/unregister-all
pub async fn unregister_all_tokens(req: HttpRequest, data: web::Data<AppState>) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let count = data.core.unregister_push_tokens(&me, None).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(
        "All FCM tokens unregistered",
        json!({ "deactivated": count }),
    )))
}
