use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::chat_core::ChatCore;
use crate::config::Config;
use crate::dto::{ApiResponse, UserDto};
use crate::error::{ChatError, ChatResult};
use crate::models::User;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Username.
    pub sub: String,
    pub token_type: TokenType,
    pub iat: usize,
    pub exp: usize,
}

/// Authenticated caller, attached to the request by the middleware.
#[derive(Debug, Clone)]
pub struct Principal {
    pub username: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterInfo {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
    pub full_name: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginInfo {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshInfo {
    pub refresh_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub user: UserDto,
}

fn create_token(username: &str, token_type: TokenType, secret: &str, ttl_secs: i64) -> ChatResult<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: username.to_string(),
        token_type,
        iat: now.timestamp() as usize,
        exp: (now + Duration::seconds(ttl_secs)).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_ref()))
        .map_err(|e| ChatError::AuthFailure(format!("token encoding failed: {}", e)))
}

pub fn create_access_token(username: &str, config: &Config) -> ChatResult<String> {
    create_token(username, TokenType::Access, &config.jwt_secret, config.jwt_expiration_secs)
}

pub fn create_refresh_token(username: &str, config: &Config) -> ChatResult<String> {
    create_token(
        username,
        TokenType::Refresh,
        &config.jwt_secret,
        config.jwt_refresh_expiration_secs,
    )
}

pub fn validate_token(token: &str, secret: &str, expected: TokenType) -> ChatResult<Claims> {
    let claims = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )
    .map_err(|e| ChatError::AuthFailure(format!("token decode error: {}", e)))?
    .claims;
    if claims.token_type != expected {
        return Err(ChatError::AuthFailure(format!(
            "expected a {:?} token",
            expected
        )));
    }
    Ok(claims)
}

/// Access tokens only; refresh tokens never authorize API or STOMP use.
pub fn validate_access_token(token: &str, secret: &str) -> ChatResult<Claims> {
    validate_token(token, secret, TokenType::Access)
}

/// Accepts `Bearer <token>` or a bare token.
pub fn bearer_token(header_value: &str) -> &str {
    header_value
        .strip_prefix("Bearer ")
        .unwrap_or(header_value)
        .trim()
}

/// The caller attached by the middleware, loaded from the store.
pub async fn current_user(req: &HttpRequest, data: &AppState) -> ChatResult<User> {
    let username = req
        .extensions()
        .get::<Principal>()
        .map(|p| p.username.clone())
        .ok_or_else(|| ChatError::AuthFailure("missing credentials".into()))?;
    active_account(&data.core, &username).await
}

/// The account behind a token subject. Disabled and locked accounts are
/// refused even while their tokens are still valid.
pub async fn active_account(core: &ChatCore, username: &str) -> ChatResult<User> {
    let user = core
        .user_by_username(username)
        .await
        .map_err(|_| ChatError::AuthFailure("unknown user".into()))?;
    if !user.active || user.locked {
        return Err(ChatError::AuthFailure("account disabled".into()));
    }
    Ok(user)
}

fn issue_tokens(user: &User, config: &Config) -> ChatResult<TokenPair> {
    Ok(TokenPair {
        access_token: create_access_token(&user.username, config)?,
        refresh_token: create_refresh_token(&user.username, config)?,
        token_type: "Bearer",
        expires_in: config.jwt_expiration_secs,
        user: UserDto::from(user),
    })
}

/// POST /api/auth/register
pub async fn register(
    data: web::Data<AppState>,
    info: web::Json<RegisterInfo>,
) -> Result<HttpResponse, ChatError> {
    let info = info.into_inner();
    let username = info.username.trim();
    if username.len() < 3 || username.len() > 50 {
        return Err(ChatError::InvalidRequest(
            "Username must be between 3 and 50 characters".into(),
        ));
    }
    if info.password.len() < 6 {
        return Err(ChatError::InvalidRequest(
            "Password must be at least 6 characters".into(),
        ));
    }

    let password_hash = hash(&info.password, DEFAULT_COST)
        .map_err(|e| ChatError::AuthFailure(format!("password hashing failed: {}", e)))?;
    let user = data
        .core
        .store
        .users
        .insert(User::new(username, info.email, info.full_name, password_hash))
        .await?;
    info!("Registered user {} ({})", user.username, user.id);

    let tokens = issue_tokens(&user, &data.config)?;
    Ok(HttpResponse::Created().json(ApiResponse::ok("User registered successfully", tokens)))
}

/// POST /api/auth/login
pub async fn login(
    data: web::Data<AppState>,
    info: web::Json<LoginInfo>,
) -> Result<HttpResponse, ChatError> {
    let invalid = || ChatError::AuthFailure("invalid credentials".into());
    let user = data
        .core
        .store
        .users
        .find_by_username(info.username.trim())
        .await?
        .ok_or_else(invalid)?;
    if !verify(&info.password, &user.password_hash).unwrap_or(false) {
        warn!("Failed login for {}", user.username);
        return Err(invalid());
    }
    if !user.active || user.locked {
        return Err(ChatError::Forbidden("Account is disabled or locked".into()));
    }

    data.core.store.users.touch_login(user.id, Utc::now()).await?;
    let tokens = issue_tokens(&user, &data.config)?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Login successful", tokens)))
}

/// POST /api/auth/refresh-token
pub async fn refresh_token(
    data: web::Data<AppState>,
    info: web::Json<RefreshInfo>,
) -> Result<HttpResponse, ChatError> {
    let claims = validate_token(&info.refresh_token, &data.config.jwt_secret, TokenType::Refresh)?;
    let user = active_account(&data.core, &claims.sub).await?;
    let tokens = issue_tokens(&user, &data.config)?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Token refreshed", tokens)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::UserRepository;
    use crate::test_support::TestChat;

    #[test]
    fn access_and_refresh_tokens_are_not_interchangeable() {
        let config = Config::for_tests();
        let access = create_access_token("alice", &config).unwrap();
        let refresh = create_refresh_token("alice", &config).unwrap();

        assert_eq!(validate_access_token(&access, &config.jwt_secret).unwrap().sub, "alice");
        assert!(matches!(
            validate_access_token(&refresh, &config.jwt_secret),
            Err(ChatError::AuthFailure(_))
        ));
        assert!(validate_token(&refresh, &config.jwt_secret, TokenType::Refresh).is_ok());
        assert!(validate_access_token(&access, "other-secret").is_err());
    }

    #[actix_web::test]
    async fn locked_and_disabled_accounts_are_refused() {
        let chat = TestChat::new();
        chat.user("alice").await;
        let mut locked = User::new("bob", None, None, "hash".into());
        locked.locked = true;
        UserRepository::insert(chat.store.as_ref(), locked).await.unwrap();
        let mut disabled = User::new("carol", None, None, "hash".into());
        disabled.active = false;
        UserRepository::insert(chat.store.as_ref(), disabled).await.unwrap();

        assert_eq!(active_account(&chat.core, "alice").await.unwrap().username, "alice");
        for name in ["bob", "carol", "nobody"] {
            assert!(matches!(
                active_account(&chat.core, name).await,
                Err(ChatError::AuthFailure(_))
            ));
        }
    }

    #[test]
    fn bearer_prefix_is_optional() {
        assert_eq!(bearer_token("Bearer abc"), "abc");
        assert_eq!(bearer_token("abc"), "abc");
    }
}
