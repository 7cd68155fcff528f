// src/web_socket_server.rs
//
// One actor per WebSocket. Speaks STOMP to the client and forwards
// /app destinations to the chat core.

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_http::ws::Item;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use log::{debug, error, info, warn};
use serde::Deserialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::auth::{active_account, bearer_token, validate_access_token};
use crate::chat_core::ChatCore;
use crate::chat_server::{self, ChatServer, Deliver, SessionId};
use crate::error::{ChatError, ChatResult};
use crate::images::ImageUpload;
use crate::models::{DeliveryStatus, MessageId, RoomId, User};
use crate::router::RoomEvent;
use crate::stomp::{parse_frames, Command, Frame};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
/// Largest inbound frame, and largest reassembled fragmented message: a
/// maximum-size image after base64 plus its JSON and STOMP envelope.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Deserialize)]
struct SendMessagePayload {
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendImagePayload {
    image_data: Option<String>,
    image_url: Option<String>,
    filename: Option<String>,
    content_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingPayload {
    #[serde(default = "default_typing")]
    is_typing: bool,
}

fn default_typing() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    message_id: MessageId,
    status: DeliveryStatus,
}

/// Parsed `/app/...` destination.
#[derive(Debug, Clone, PartialEq)]
pub enum AppDestination {
    SendMessage(RoomId),
    SendImage(RoomId),
    Typing(RoomId),
    Join(RoomId),
    Leave(RoomId),
    Status,
}

impl AppDestination {
    pub fn parse(destination: &str) -> ChatResult<Self> {
        let unknown = || ChatError::InvalidRequest(format!("Unknown destination '{}'", destination));
        let action = destination.strip_prefix("/app/").ok_or_else(unknown)?;
        if action == "chat.status" {
            return Ok(AppDestination::Status);
        }
        let (name, room) = action.split_once('/').ok_or_else(unknown)?;
        let room_id: RoomId = room.parse().map_err(|_| unknown())?;
        match name {
            "chat.sendMessage" => Ok(AppDestination::SendMessage(room_id)),
            "chat.sendImage" => Ok(AppDestination::SendImage(room_id)),
            "chat.typing" => Ok(AppDestination::Typing(room_id)),
            "chat.join" => Ok(AppDestination::Join(room_id)),
            "chat.leave" => Ok(AppDestination::Leave(room_id)),
            _ => Err(unknown()),
        }
    }
}

fn payload<'a, T: Deserialize<'a>>(body: &'a str) -> ChatResult<T> {
    serde_json::from_str(body).map_err(|e| ChatError::InvalidRequest(format!("Malformed payload: {}", e)))
}

/// Runs one SEND frame against the core.
pub async fn dispatch_app(core: &ChatCore, user: &User, destination: &str, body: &str) -> ChatResult<()> {
    match AppDestination::parse(destination)? {
        AppDestination::SendMessage(room_id) => {
            let p: SendMessagePayload = payload(body)?;
            core.send_text(user, room_id, &p.content).await?;
        }
        AppDestination::SendImage(room_id) => {
            let p: SendImagePayload = payload(body)?;
            match (p.image_data, p.image_url) {
                (Some(data), _) => {
                    let upload = ImageUpload {
                        data,
                        filename: p.filename,
                        content_type: p.content_type,
                    };
                    core.send_image_upload(user, room_id, &upload).await?;
                }
                (None, Some(url)) => {
                    core.send_image_url(user, room_id, &url).await?;
                }
                (None, None) => {
                    return Err(ChatError::InvalidRequest(
                        "Either imageData or imageUrl is required".into(),
                    ))
                }
            }
        }
        AppDestination::Typing(room_id) => {
            let p: TypingPayload = if body.trim().is_empty() {
                TypingPayload { is_typing: true }
            } else {
                payload(body)?
            };
            core.typing(user, room_id, p.is_typing).await?;
        }
        AppDestination::Join(room_id) => {
            core.announce_presence_in_room(user, room_id, RoomEvent::Joined).await?;
        }
        AppDestination::Leave(room_id) => {
            core.announce_presence_in_room(user, room_id, RoomEvent::Left).await?;
        }
        AppDestination::Status => {
            let p: StatusPayload = payload(body)?;
            core.record_status(user, p.message_id, p.status).await?;
        }
    }
    Ok(())
}

/// Validates an access token and loads its user.
async fn authenticate(core: Arc<ChatCore>, secret: String, token: String) -> ChatResult<User> {
    let claims = validate_access_token(bearer_token(&token), &secret)?;
    active_account(&core, &claims.sub).await
}

fn token_of(frame: &Frame) -> Option<String> {
    frame
        .get("Authorization")
        .or_else(|| frame.get("authorization"))
        .or_else(|| frame.get("token"))
        .map(str::to_string)
}

/// Reassembles a text message split over continuation frames.
#[derive(Debug, Default)]
struct FragmentBuffer {
    text: Option<Vec<u8>>,
}

impl FragmentBuffer {
    /// Yields the whole text once its last fragment has arrived.
    /// Fragmented binary messages are dropped.
    fn push(&mut self, item: Item) -> ChatResult<Option<String>> {
        let (bytes, last) = match item {
            Item::FirstText(bytes) => {
                self.text = Some(Vec::with_capacity(bytes.len()));
                (bytes, false)
            }
            Item::FirstBinary(_) => {
                self.text = None;
                return Ok(None);
            }
            Item::Continue(bytes) => (bytes, false),
            Item::Last(bytes) => (bytes, true),
        };
        let Some(buffer) = self.text.as_mut() else {
            return Ok(None);
        };
        if buffer.len() + bytes.len() > MAX_FRAME_SIZE {
            self.text = None;
            return Err(ChatError::InvalidRequest(format!(
                "Message exceeds {} bytes",
                MAX_FRAME_SIZE
            )));
        }
        buffer.extend_from_slice(&bytes);
        if !last {
            return Ok(None);
        }
        let whole = self.text.take().unwrap_or_default();
        String::from_utf8(whole)
            .map(Some)
            .map_err(|_| ChatError::InvalidRequest("Message is not valid UTF-8".into()))
    }
}

pub struct WebSocketConnection {
    pub id: SessionId,
    pub hb: Instant,
    pub server: Addr<ChatServer>,
    pub core: Arc<ChatCore>,
    pub jwt_secret: String,
    pub user: Option<User>,
    fragments: FragmentBuffer,
}

impl WebSocketConnection {
    pub fn new(server: Addr<ChatServer>, core: Arc<ChatCore>, jwt_secret: String) -> Self {
        WebSocketConnection {
            id: Uuid::new_v4(),
            hb: Instant::now(),
            server,
            core,
            jwt_secret,
            user: None,
            fragments: FragmentBuffer::default(),
        }
    }

    pub fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                info!("WebSocket session {} heartbeat failed, disconnecting", act.id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn send_frame(ctx: &mut ws::WebsocketContext<Self>, frame: Frame) {
        ctx.text(frame.serialize());
    }

    fn send_error_frame(ctx: &mut ws::WebsocketContext<Self>, err: &ChatError) {
        let frame = Frame::new(Command::Error)
            .header("message", &err.public_message())
            .header("code", err.code())
            .with_body("text/plain", err.public_message());
        Self::send_frame(ctx, frame);
    }

    fn receipt(ctx: &mut ws::WebsocketContext<Self>, frame: &Frame) {
        if let Some(receipt) = frame.get("receipt") {
            Self::send_frame(ctx, Frame::new(Command::Receipt).header("receipt-id", receipt));
        }
    }

    fn on_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match parse_frames(text) {
            Ok(frames) => {
                for frame in frames {
                    self.handle_frame(frame, ctx);
                }
            }
            Err(e) => {
                warn!("Bad STOMP input on session {}: {}", self.id, e);
                Self::send_error_frame(ctx, &e);
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame, ctx: &mut ws::WebsocketContext<Self>) {
        match frame.command {
            Command::Connect | Command::Stomp => self.on_connect(frame, ctx),
            Command::Subscribe => self.on_subscribe(frame, ctx),
            Command::Unsubscribe => {
                if let Some(id) = frame.get("id") {
                    self.server.do_send(chat_server::Unsubscribe {
                        session_id: self.id,
                        subscription_id: id.to_string(),
                    });
                }
                Self::receipt(ctx, &frame);
            }
            Command::Send => self.on_send(frame, ctx),
            Command::Disconnect => {
                Self::receipt(ctx, &frame);
                ctx.stop();
            }
            Command::Ack | Command::Nack => {}
            other => {
                debug!("Ignoring client frame {:?} on session {}", other, self.id);
            }
        }
    }

    fn on_connect(&mut self, frame: Frame, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(token) = token_of(&frame) else {
            Self::send_error_frame(ctx, &ChatError::AuthFailure("missing token".into()));
            ctx.stop();
            return;
        };
        authenticate(self.core.clone(), self.jwt_secret.clone(), token)
            .into_actor(self)
            .then(|res, act, ctx| match res {
                Ok(user) => {
                    Self::send_frame(
                        ctx,
                        Frame::new(Command::Connected)
                            .header("version", "1.2")
                            .header("heart-beat", "0,0")
                            .header("user-name", &user.username),
                    );
                    act.register(user, ctx);
                    fut::ready(())
                }
                Err(e) => {
                    warn!("STOMP CONNECT rejected on session {}: {}", act.id, e);
                    Self::send_error_frame(ctx, &e);
                    ctx.stop();
                    fut::ready(())
                }
            })
            .wait(ctx);
    }

    /// Tells the broker about the session; the first one flips presence online.
    fn register(&mut self, user: User, ctx: &mut ws::WebsocketContext<Self>) {
        if self.user.is_some() {
            return;
        }
        self.user = Some(user.clone());
        let core = self.core.clone();
        self.server
            .send(chat_server::Connect {
                session_id: self.id,
                username: user.username.clone(),
                addr: ctx.address().recipient(),
            })
            .into_actor(self)
            .then(move |res, act, ctx| {
                match res {
                    Ok(true) => {
                        actix::spawn(async move {
                            if let Err(e) = core.user_connected(&user).await {
                                error!("Presence update for {} failed: {}", user.username, e);
                            }
                        });
                    }
                    Ok(false) => {}
                    Err(e) => {
                        error!("Failed to register session {} with broker: {}", act.id, e);
                        ctx.stop();
                    }
                }
                fut::ready(())
            })
            .wait(ctx);
    }

    fn on_subscribe(&mut self, frame: Frame, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(user) = self.user.clone() else {
            Self::send_error_frame(ctx, &ChatError::AuthFailure("not connected".into()));
            return;
        };
        let (id, destination) = match (frame.require("id"), frame.require("destination")) {
            (Ok(id), Ok(dest)) => (id.to_string(), dest.to_string()),
            (Err(e), _) | (_, Err(e)) => {
                Self::send_error_frame(ctx, &e);
                return;
            }
        };
        let core = self.core.clone();
        async move {
            let result = core.authorize_subscription(&user, &destination).await;
            (result, core, user, id, destination)
        }
        .into_actor(self)
        .then(move |(result, core, user, id, destination), act, ctx| {
            match result {
                Ok(()) => {
                    act.server.do_send(chat_server::Subscribe {
                        session_id: act.id,
                        subscription_id: id,
                        destination,
                    });
                    Self::receipt(ctx, &frame);
                }
                Err(e) => {
                    warn!("{} refused subscription to {}: {}", user.username, destination, e);
                    actix::spawn(async move {
                        core.router.send_error(&user.username, &e, Some(&destination)).await;
                    });
                }
            }
            fut::ready(())
        })
        .wait(ctx);
    }

    fn on_send(&mut self, frame: Frame, ctx: &mut ws::WebsocketContext<Self>) {
        let destination = match frame.require("destination") {
            Ok(d) => d.to_string(),
            Err(e) => {
                Self::send_error_frame(ctx, &e);
                return;
            }
        };
        let core = self.core.clone();
        let secret = self.jwt_secret.clone();
        let known_user = self.user.clone();
        let token = token_of(&frame);
        let body = frame.body.clone();

        // A SEND without a prior CONNECT must carry its own token.
        async move {
            let user = match (known_user, token) {
                (Some(user), _) => user,
                (None, Some(token)) => match authenticate(core.clone(), secret, token).await {
                    Ok(user) => user,
                    Err(e) => return Err(e),
                },
                (None, None) => return Err(ChatError::AuthFailure("not connected".into())),
            };
            if let Err(e) = dispatch_app(&core, &user, &destination, &body).await {
                warn!("{} on {} failed: {}", user.username, destination, e);
                core.router.send_error(&user.username, &e, Some(&destination)).await;
            }
            Ok(user)
        }
        .into_actor(self)
        .then(move |res, act, ctx| {
            match res {
                Ok(user) => {
                    Self::receipt(ctx, &frame);
                    act.register(user, ctx);
                }
                Err(e) => Self::send_error_frame(ctx, &e),
            }
            fut::ready(())
        })
        .wait(ctx);
    }
}

impl Actor for WebSocketConnection {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.hb(ctx);
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        let Some(user) = self.user.take() else {
            return;
        };
        let server = self.server.clone();
        let core = self.core.clone();
        let session_id = self.id;
        actix::spawn(async move {
            match server.send(chat_server::Disconnect { session_id }).await {
                Ok(true) => {
                    if let Err(e) = core.user_disconnected(&user).await {
                        error!("Presence update for {} failed: {}", user.username, e);
                    }
                }
                Ok(false) => {}
                Err(e) => error!("Broker unreachable on disconnect of {}: {}", session_id, e),
            }
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WebSocketConnection {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                self.on_text(&text, ctx);
            }
            Ok(ws::Message::Continuation(item)) => {
                self.hb = Instant::now();
                match self.fragments.push(item) {
                    Ok(Some(text)) => self.on_text(&text, ctx),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Fragmented message dropped on session {}: {}", self.id, e);
                        Self::send_error_frame(ctx, &e);
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                debug!("Ignoring binary frame on session {}", self.id);
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Nop) => {}
            Err(ws::ProtocolError::Overflow) => {
                warn!("Oversized frame on session {}", self.id);
                Self::send_error_frame(
                    ctx,
                    &ChatError::InvalidRequest(format!("Frame exceeds {} bytes", MAX_FRAME_SIZE)),
                );
                ctx.stop();
            }
            Err(e) => {
                warn!("WebSocket error on session {}: {}", self.id, e);
                ctx.stop();
            }
        }
    }
}

impl Handler<Deliver> for WebSocketConnection {
    type Result = ();

    fn handle(&mut self, msg: Deliver, ctx: &mut ws::WebsocketContext<Self>) {
        let frame = Frame::new(Command::Message)
            .header("destination", &msg.destination)
            .header("subscription", &msg.subscription)
            .header("message-id", &Uuid::new_v4().to_string())
            .with_body("application/json", msg.body);
        Self::send_frame(ctx, frame);
    }
}

/// GET /ws
pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let session = WebSocketConnection::new(
        data.chat_server.clone(),
        data.core.clone(),
        data.config.jwt_secret.clone(),
    );
    ws::WsResponseBuilder::new(session, &req, stream)
        .frame_size(MAX_FRAME_SIZE)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RoomType;
    use crate::rooms::CreateRoom;
    use crate::router::destinations;
    use crate::test_support::TestChat;

    #[test]
    fn app_destinations_parse() {
        assert_eq!(
            AppDestination::parse("/app/chat.sendMessage/12").unwrap(),
            AppDestination::SendMessage(12)
        );
        assert_eq!(AppDestination::parse("/app/chat.typing/3").unwrap(), AppDestination::Typing(3));
        assert_eq!(AppDestination::parse("/app/chat.status").unwrap(), AppDestination::Status);
        assert!(AppDestination::parse("/app/chat.sendMessage/abc").is_err());
        assert!(AppDestination::parse("/topic/chat/1").is_err());
    }

    #[test]
    fn continuation_frames_reassemble() {
        let mut buffer = FragmentBuffer::default();
        let part = "x".repeat(40 * 1024);
        assert_eq!(buffer.push(Item::FirstText(web::Bytes::from(part.clone()))).unwrap(), None);
        assert_eq!(buffer.push(Item::Continue(web::Bytes::from(part.clone()))).unwrap(), None);
        let whole = buffer.push(Item::Last(web::Bytes::from_static(b"!"))).unwrap().unwrap();
        assert_eq!(whole.len(), 80 * 1024 + 1);
        assert!(whole.ends_with("x!"));

        assert_eq!(buffer.push(Item::FirstBinary(web::Bytes::from_static(b"\x00"))).unwrap(), None);
        assert_eq!(buffer.push(Item::Last(web::Bytes::from_static(b"\x01"))).unwrap(), None);

        buffer.push(Item::FirstText(web::Bytes::from(vec![b'a'; MAX_FRAME_SIZE]))).unwrap();
        assert!(matches!(
            buffer.push(Item::Last(web::Bytes::from_static(b"a"))),
            Err(ChatError::InvalidRequest(_))
        ));
    }

    #[actix_web::test]
    async fn images_over_64_kib_travel_in_one_send_frame() {
        use base64::Engine;

        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let bob = chat.user("bob").await;
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

        let image = vec![0xABu8; 200 * 1024];
        let body = serde_json::json!({
            "imageData": base64::engine::general_purpose::STANDARD.encode(&image),
            "filename": "big.png",
            "contentType": "image/png",
        })
        .to_string();
        let wire = Frame::new(Command::Send)
            .header("destination", &format!("/app/chat.sendImage/{}", room.id))
            .with_body("application/json", body)
            .serialize();
        assert!(wire.len() > 64 * 1024 && wire.len() < MAX_FRAME_SIZE);

        // The client may also split it over continuation frames.
        let (head, tail) = wire.as_bytes().split_at(wire.len() / 2);
        let mut buffer = FragmentBuffer::default();
        buffer.push(Item::FirstText(web::Bytes::copy_from_slice(head))).unwrap();
        let text = buffer.push(Item::Last(web::Bytes::copy_from_slice(tail))).unwrap().unwrap();

        let frames = parse_frames(&text).unwrap();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        dispatch_app(&chat.core, &alice, frame.get("destination").unwrap(), &frame.body)
            .await
            .unwrap();

        let sent = chat.transport.published_to(&destinations::room(room.id));
        let url = sent.last().unwrap()["attachmentUrls"][0].as_str().unwrap().to_string();
        let id = url.rsplit('/').next().unwrap();
        assert_eq!(chat.core.fetch_image(id).await.unwrap().data, image);
    }

    #[actix_web::test]
    async fn send_frames_drive_the_core() {
        let chat = TestChat::new();
        let alice = chat.user("alice").await;
        let bob = chat.user("bob").await;
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

        let dest = format!("/app/chat.sendMessage/{}", room.id);
        dispatch_app(&chat.core, &alice, &dest, r#"{"content":"hi bob"}"#).await.unwrap();
        let sent = chat.transport.published_to(&destinations::room(room.id));
        assert_eq!(sent[0]["content"], "hi bob");

        let ack = format!(r#"{{"messageId":{},"status":"READ"}}"#, sent[0]["id"]);
        dispatch_app(&chat.core, &bob, "/app/chat.status", &ack).await.unwrap();
        assert_eq!(chat.transport.published_to(&destinations::room_status(room.id)).len(), 1);

        assert!(matches!(
            dispatch_app(&chat.core, &alice, &dest, "not json").await,
            Err(ChatError::InvalidRequest(_))
        ));
    }
}
