// src/main.rs

mod app_state;
mod auth;
mod chat;
mod chat_core;
mod chat_db;
mod chat_server;
mod config;
mod device_tokens;
mod dto;
mod error;
mod images;
mod membership;
mod memory_store;
mod messaging;
mod models;
mod notifications;
mod participant_management;
mod participants;
mod presence;
mod push;
mod repository;
mod rooms;
mod router;
mod sessions;
mod statuses;
mod stomp;
mod user_management;
mod web_socket_server;
#[cfg(test)]
mod test_support;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use actix::Actor;
use actix_cors::Cors;
use actix_web::{
    body::{BoxBody, MessageBody},
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    http,
    middleware::Logger,
    web, App, Error, HttpMessage, HttpServer, ResponseError,
};
use env_logger::Env;
use futures::future::{ok, Ready};
use log::{info, warn};

use crate::app_state::AppState;
use crate::auth::{bearer_token, login, refresh_token, register, validate_access_token, Principal};
use crate::chat_core::ChatCore;
use crate::chat_db::MongoDB;
use crate::chat_server::{BrokerTransport, ChatServer};
use crate::config::{Config, StoreBackend};
use crate::error::ChatError;
use crate::memory_store::InMemoryStore;
use crate::push::{DisabledPush, FcmPushClient, PushCapability};
use crate::repository::Store;
use crate::web_socket_server::ws_index;

/// Paths reachable without an access token. The WebSocket authenticates
/// inside the STOMP CONNECT frame instead.
const PUBLIC_PREFIXES: [&str; 3] = ["/api/auth/", "/api/v1/images/", "/ws"];

#[derive(Debug, Clone)]
pub struct Authentication {
    secret: String,
}

impl Authentication {
    pub fn new(secret: &str) -> Self {
        Authentication { secret: secret.to_string() }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Authentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Transform = AuthMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthMiddleware {
            service,
            secret: self.secret.clone(),
        })
    }
}

pub struct AuthMiddleware<S> {
    service: S,
    secret: String,
}

fn is_public(req: &ServiceRequest) -> bool {
    req.method() == http::Method::OPTIONS
        || PUBLIC_PREFIXES.iter().any(|p| req.path().starts_with(p))
}

impl<S, B> Service<ServiceRequest> for AuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        if !is_public(&req) {
            let claims = req
                .headers()
                .get(http::header::AUTHORIZATION)
                .and_then(|h| h.to_str().ok())
                .filter(|h| h.starts_with("Bearer "))
                .ok_or_else(|| ChatError::AuthFailure("missing bearer token".into()))
                .and_then(|h| validate_access_token(bearer_token(h), &self.secret));

            match claims {
                Ok(claims) => {
                    req.extensions_mut().insert(Principal { username: claims.sub });
                }
                Err(e) => {
                    warn!("Rejected {} {}: {}", req.method(), req.path(), e);
                    let (req_parts, _payload) = req.into_parts();
                    let srv_resp = ServiceResponse::new(req_parts, e.error_response());
                    return Box::pin(async move { Ok(srv_resp) });
                }
            }
        }

        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            Ok(res.map_into_boxed_body())
        })
    }
}

async fn build_store(config: &Config) -> Result<Store, ChatError> {
    match config.store_backend {
        StoreBackend::Mongo => {
            let mongodb = Arc::new(MongoDB::init(&config.mongo_uri, &config.database_name).await?);
            Ok(Store::from_backend(mongodb))
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; data is lost on restart");
            Ok(Store::from_backend(Arc::new(InMemoryStore::new())))
        }
    }
}

fn build_push(config: &Config) -> Result<Arc<dyn PushCapability>, ChatError> {
    match (config.push_enabled, config.fcm_server_key.as_deref()) {
        (true, Some(key)) => Ok(Arc::new(FcmPushClient::new(&config.fcm_endpoint, key)?)),
        (true, None) => {
            warn!("PUSH_ENABLED is set but FCM_SERVER_KEY is missing; push disabled");
            Ok(Arc::new(DisabledPush))
        }
        (false, _) => Ok(Arc::new(DisabledPush)),
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = Config::from_env().map_err(|e| std::io::Error::other(e.to_string()))?;
    let store = build_store(&config)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let push = build_push(&config).map_err(|e| std::io::Error::other(e.to_string()))?;

    let chat_server = ChatServer::new().start();
    let core = Arc::new(ChatCore::assemble(
        store,
        Arc::new(BrokerTransport(chat_server.clone())),
        push,
        &config.base_url,
    ));

    let bind_addr = config.bind_addr.clone();
    info!("Server running at http://{}", bind_addr);
    info!("Allowed CORS Origin: {}", config.frontend_origin);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&config.frontend_origin)
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
            .allowed_headers(vec![
                http::header::CONTENT_TYPE,
                http::header::ACCEPT,
                http::header::AUTHORIZATION,
            ])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(Authentication::new(&config.jwt_secret))
            .wrap(cors)
            .wrap(Logger::default())
            .app_data(web::Data::new(AppState {
                chat_server: chat_server.clone(),
                core: core.clone(),
                config: config.clone(),
            }))
            .app_data(web::JsonConfig::default().limit(16 * 1024 * 1024))
            .service(
                web::scope("/api")
                    .service(
                        web::scope("/auth")
                            .route("/register", web::post().to(register))
                            .route("/login", web::post().to(login))
                            .route("/refresh-token", web::post().to(refresh_token)),
                    )
                    // USERS
                    .service(
                        web::scope("/users")
                            .route("", web::get().to(user_management::search_users))
                            .route("/me", web::get().to(user_management::get_me))
                            .route("/me", web::put().to(user_management::update_me))
                            .route("/username", web::get().to(user_management::find_user_by_username))
                            .route("/{id}", web::get().to(user_management::get_user_by_id)),
                    )
                    // ROOMS
                    .service(
                        web::scope("/rooms")
                            .route("", web::get().to(chat::list_rooms))
                            .route("", web::post().to(chat::create_room))
                            .route("/{id}", web::get().to(chat::get_room))
                            .route("/{id}", web::put().to(chat::update_room))
                            .route("/{id}", web::delete().to(chat::delete_room)),
                    )
                    // PARTICIPANTS
                    .service(
                        web::scope("/participants")
                            .route("/room/{room_id}", web::get().to(participant_management::list_participants))
                            .route("/room/{room_id}/add", web::post().to(participant_management::add_participant))
                            .route("/room/{room_id}/read", web::put().to(participant_management::mark_read))
                            .route("/{participant_id}", web::delete().to(participant_management::remove_participant))
                            .route("/{participant_id}/role", web::put().to(participant_management::update_role))
                            .route("/{participant_id}/status", web::put().to(participant_management::update_flags)),
                    )
                    // MESSAGES
                    .service(
                        web::scope("/messages")
                            .route("/room/{room_id}", web::get().to(chat::get_messages))
                            .route("/room/{room_id}", web::post().to(chat::create_message))
                            .route("/room/{room_id}/image", web::post().to(chat::create_image_message))
                            .route("/room/{room_id}/system", web::post().to(chat::create_system_message))
                            .route("/{id}", web::get().to(chat::get_message))
                            .route("/{id}", web::put().to(chat::update_message))
                            .route("/{id}", web::delete().to(chat::delete_message)),
                    )
                    .service(
                        web::scope("/messagestatus")
                            .route("", web::post().to(chat::record_status))
                            .route("/message/{message_id}", web::get().to(chat::get_statuses)),
                    )
                    .service(
                        web::scope("/fcm-tokens")
                            .route("/register", web::post().to(device_tokens::register_token))
                            .route("/unregister", web::delete().to(device_tokens::unregister_token))
                            .route("/unregister-all", web::delete().to(device_tokens::unregister_all_tokens)),
                    )
                    .route("/v1/images/{id}", web::get().to(chat::get_image)),
            )
            // WEBSOCKET route for real-time
            .service(web::resource("/ws").route(web::get().to(ws_index)))
    })
    .bind(bind_addr)?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, HttpResponse};

    use crate::auth::create_access_token;

    async fn whoami(req: actix_web::HttpRequest) -> HttpResponse {
        let name = req
            .extensions()
            .get::<Principal>()
            .map(|p| p.username.clone())
            .unwrap_or_default();
        HttpResponse::Ok().body(name)
    }

    #[actix_web::test]
    async fn protected_routes_need_an_access_token() {
        let config = Config::for_tests();
        let app = test::init_service(
            App::new()
                .wrap(Authentication::new(&config.jwt_secret))
                .route("/api/users/me", web::get().to(whoami))
                .route("/api/auth/login", web::get().to(whoami)),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/api/users/me").to_request()).await;
        assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);

        let resp = test::call_service(&app, test::TestRequest::get().uri("/api/auth/login").to_request()).await;
        assert_eq!(resp.status(), http::StatusCode::OK);

        let token = create_access_token("alice", &config).unwrap();
        let req = test::TestRequest::get()
            .uri("/api/users/me")
            .insert_header((http::header::AUTHORIZATION, format!("Bearer {}", token)))
            .to_request();
        let body = test::call_and_read_body(&app, req).await;
        assert_eq!(body, "alice");
    }

    #[actix_web::test]
    async fn refresh_tokens_are_refused_by_the_middleware() {
        let config = Config::for_tests();
        let app = test::init_service(
            App::new()
                .wrap(Authentication::new(&config.jwt_secret))
                .route("/api/rooms", web::get().to(whoami)),
        )
        .await;
        let refresh = crate::auth::create_refresh_token("alice", &config).unwrap();
        let req = test::TestRequest::get()
            .uri("/api/rooms")
            .insert_header((http::header::AUTHORIZATION, format!("Bearer {}", refresh)))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);
    }
}
