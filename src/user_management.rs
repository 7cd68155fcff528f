use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;

use crate::app_state::AppState;
use crate::auth::current_user;
use crate::dto::{ApiResponse, UserDto};
use crate::error::ChatError;
use crate::models::UserId;

const SEARCH_LIMIT: i64 = 20;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UsernameQuery {
    pub username: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileRequest {
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// GET /api/users?q=
/// Search by username or display name. The caller is left out.
pub async fn search_users(
    req: HttpRequest,
    data: web::Data<AppState>,
    query: web::Query<SearchQuery>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let q = query.q.as_deref().unwrap_or("").trim();
    let users: Vec<UserDto> = data
        .core
        .store
        .users
        .search(q, SEARCH_LIMIT + 1)
        .await?
        .iter()
        .filter(|u| u.id != me.id)
        .take(SEARCH_LIMIT as usize)
        .map(UserDto::from)
        .collect();
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Users retrieved", users)))
}

/// GET /api/users/me
pub async fn get_me(req: HttpRequest, data: web::Data<AppState>) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Current user", UserDto::from(&me))))
}

/// PUT /api/users/me
pub async fn update_me(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<UpdateProfileRequest>,
) -> Result<HttpResponse, ChatError> {
    let me = current_user(&req, &data).await?;
    let payload = payload.into_inner();
    data.core
        .store
        .users
        .update_profile(me.id, payload.full_name, payload.avatar_url)
        .await?;
    let updated = data.core.user(me.id).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Profile updated", UserDto::from(&updated))))
}

/// GET /api/users/{id}
pub async fn get_user_by_id(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<UserId>,
) -> Result<HttpResponse, ChatError> {
    current_user(&req, &data).await?;
    let user = data.core.user(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("User retrieved", UserDto::from(&user))))
}

/// GET /api/users/username?username=
pub async fn find_user_by_username(
    req: HttpRequest,
    data: web::Data<AppState>,
    query: web::Query<UsernameQuery>,
) -> Result<HttpResponse, ChatError> {
    current_user(&req, &data).await?;
    let user = data.core.user_by_username(query.username.trim()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("User retrieved", UserDto::from(&user))))
}
