// src/chat_server.rs
//
// In-process STOMP broker. Owns every live session and its subscriptions;
// destinations are matched exactly.

use std::collections::{HashMap, HashSet};

use actix::prelude::*;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::router::{destinations, Transport};

pub type SessionId = Uuid;

/// One outbound MESSAGE frame for a session.
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct Deliver {
    pub destination: String,
    pub subscription: String,
    pub body: String,
}

/// Returns true when this is the user's first live session.
#[derive(Message)]
#[rtype(result = "bool")]
pub struct Connect {
    pub session_id: SessionId,
    pub username: String,
    pub addr: Recipient<Deliver>,
}

/// Returns true when the user's last live session went away.
#[derive(Message)]
#[rtype(result = "bool")]
pub struct Disconnect {
    pub session_id: SessionId,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Subscribe {
    pub session_id: SessionId,
    pub subscription_id: String,
    pub destination: String,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Unsubscribe {
    pub session_id: SessionId,
    pub subscription_id: String,
}

/// Returns the number of frames handed to sessions.
#[derive(Message)]
#[rtype(result = "ChatResult<usize>")]
pub struct Publish {
    pub destination: String,
    pub payload: Value,
}

/// Private delivery: `destination` is `/queue/...`, sessions subscribe to `/user/queue/...`.
#[derive(Message)]
#[rtype(result = "ChatResult<usize>")]
pub struct SendToUser {
    pub username: String,
    pub destination: String,
    pub payload: Value,
}

struct Session {
    username: String,
    addr: Recipient<Deliver>,
    /// subscription id -> destination
    subscriptions: HashMap<String, String>,
}

#[derive(Default)]
pub struct ChatServer {
    sessions: HashMap<SessionId, Session>,
    user_sessions: HashMap<String, HashSet<SessionId>>,
}

impl ChatServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn deliver<'a>(
        sessions: impl Iterator<Item = &'a Session>,
        destination: &str,
        body: &str,
    ) -> usize {
        let mut delivered = 0;
        for session in sessions {
            for (sub_id, sub_destination) in &session.subscriptions {
                if sub_destination == destination {
                    session.addr.do_send(Deliver {
                        destination: destination.to_string(),
                        subscription: sub_id.clone(),
                        body: body.to_string(),
                    });
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

impl Actor for ChatServer {
    type Context = Context<Self>;
}

impl Handler<Connect> for ChatServer {
    type Result = bool;

    fn handle(&mut self, msg: Connect, _: &mut Context<Self>) -> bool {
        let sessions = self.user_sessions.entry(msg.username.clone()).or_default();
        sessions.insert(msg.session_id);
        let first = sessions.len() == 1;
        info!(
            "Session {} connected for {} ({} live)",
            msg.session_id,
            msg.username,
            sessions.len()
        );
        self.sessions.insert(
            msg.session_id,
            Session {
                username: msg.username,
                addr: msg.addr,
                subscriptions: HashMap::new(),
            },
        );
        first
    }
}

impl Handler<Disconnect> for ChatServer {
    type Result = bool;

    fn handle(&mut self, msg: Disconnect, _: &mut Context<Self>) -> bool {
        let Some(session) = self.sessions.remove(&msg.session_id) else {
            return false;
        };
        info!("Session {} for {} closed", msg.session_id, session.username);
        match self.user_sessions.get_mut(&session.username) {
            Some(ids) => {
                ids.remove(&msg.session_id);
                if ids.is_empty() {
                    self.user_sessions.remove(&session.username);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }
}

impl Handler<Subscribe> for ChatServer {
    type Result = ();

    fn handle(&mut self, msg: Subscribe, _: &mut Context<Self>) {
        match self.sessions.get_mut(&msg.session_id) {
            Some(session) => {
                debug!(
                    "{} subscribed to {} as {}",
                    session.username, msg.destination, msg.subscription_id
                );
                session
                    .subscriptions
                    .insert(msg.subscription_id, msg.destination);
            }
            None => warn!("Subscribe from unknown session {}", msg.session_id),
        }
    }
}

impl Handler<Unsubscribe> for ChatServer {
    type Result = ();

    fn handle(&mut self, msg: Unsubscribe, _: &mut Context<Self>) {
        if let Some(session) = self.sessions.get_mut(&msg.session_id) {
            session.subscriptions.remove(&msg.subscription_id);
        }
    }
}

impl Handler<Publish> for ChatServer {
    type Result = ChatResult<usize>;

    fn handle(&mut self, msg: Publish, _: &mut Context<Self>) -> Self::Result {
        let body = encode_body(&msg.payload)?;
        Ok(Self::deliver(self.sessions.values(), &msg.destination, &body))
    }
}

impl Handler<SendToUser> for ChatServer {
    type Result = ChatResult<usize>;

    fn handle(&mut self, msg: SendToUser, _: &mut Context<Self>) -> Self::Result {
        let Some(ids) = self.user_sessions.get(&msg.username) else {
            debug!("{} has no live session for {}", msg.username, msg.destination);
            return Ok(0);
        };
        let body = encode_body(&msg.payload)?;
        let destination = format!("{}{}", destinations::USER_PREFIX, msg.destination);
        let sessions = ids.iter().filter_map(|id| self.sessions.get(id));
        Ok(Self::deliver(sessions, &destination, &body))
    }
}

/// A payload that cannot be written as a frame body is a delivery failure.
fn encode_body<T: Serialize>(payload: &T) -> ChatResult<String> {
    serde_json::to_string(payload).map_err(|e| ChatError::TransportFailure(format!("unencodable payload: {}", e)))
}

/// Transport backed by the broker actor.
#[derive(Clone)]
pub struct BrokerTransport(pub Addr<ChatServer>);

#[async_trait]
impl Transport for BrokerTransport {
    async fn publish(&self, destination: &str, payload: Value) -> ChatResult<()> {
        self.0
            .send(Publish {
                destination: destination.to_string(),
                payload,
            })
            .await
            .map_err(|e| ChatError::TransportFailure(e.to_string()))??;
        Ok(())
    }

    async fn send_to_user(&self, username: &str, destination: &str, payload: Value) -> ChatResult<()> {
        self.0
            .send(SendToUser {
                username: username.to_string(),
                destination: destination.to_string(),
                payload,
            })
            .await
            .map_err(|e| ChatError::TransportFailure(e.to_string()))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    #[test]
    fn unencodable_payloads_are_transport_failures() {
        let mut keyed_by_pair = HashMap::new();
        keyed_by_pair.insert((1, 2), "x");
        let err = encode_body(&keyed_by_pair).unwrap_err();
        assert!(matches!(err, ChatError::TransportFailure(_)));
        assert_eq!(err.code(), "TRANSPORT_FAILURE");
        assert_eq!(encode_body(&json!({"a": 1})).unwrap(), r#"{"a":1}"#);
    }

    struct Collector(Arc<Mutex<Vec<Deliver>>>);

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<Deliver> for Collector {
        type Result = ();

        fn handle(&mut self, msg: Deliver, _: &mut Context<Self>) {
            self.0.lock().unwrap().push(msg);
        }
    }

    fn collector() -> (Recipient<Deliver>, Arc<Mutex<Vec<Deliver>>>) {
        let inbox = Arc::new(Mutex::new(Vec::new()));
        (Collector(inbox.clone()).start().recipient(), inbox)
    }

    async fn settle() {
        actix::clock::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[actix_web::test]
    async fn first_connect_and_last_disconnect_are_reported() {
        let server = ChatServer::new().start();
        let (addr, _) = collector();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let connect = |id| Connect {
            session_id: id,
            username: "alice".into(),
            addr: addr.clone(),
        };
        assert!(server.send(connect(a)).await.unwrap());
        assert!(!server.send(connect(b)).await.unwrap());
        assert!(!server.send(Disconnect { session_id: a }).await.unwrap());
        assert!(server.send(Disconnect { session_id: b }).await.unwrap());
        assert!(!server.send(Disconnect { session_id: b }).await.unwrap());
    }

    #[actix_web::test]
    async fn publishes_reach_matching_subscriptions_only() {
        let server = ChatServer::new().start();
        let (alice_addr, alice_inbox) = collector();
        let (bob_addr, bob_inbox) = collector();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        server
            .send(Connect { session_id: alice, username: "alice".into(), addr: alice_addr })
            .await
            .unwrap();
        server
            .send(Connect { session_id: bob, username: "bob".into(), addr: bob_addr })
            .await
            .unwrap();
        for (session_id, sub, dest) in [
            (alice, "sub-0", "/topic/chat/1"),
            (alice, "sub-1", "/user/queue/errors"),
            (bob, "sub-0", "/topic/chat/2"),
            (bob, "sub-1", "/user/queue/errors"),
        ] {
            server
                .send(Subscribe {
                    session_id,
                    subscription_id: sub.into(),
                    destination: dest.into(),
                })
                .await
                .unwrap();
        }

        let sent = server
            .send(Publish { destination: "/topic/chat/1".into(), payload: json!({"id": 1}) })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent, 1);
        let private = server
            .send(SendToUser {
                username: "bob".into(),
                destination: "/queue/errors".into(),
                payload: json!({"type": "ERROR"}),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(private, 1);
        settle().await;

        let alice_got = alice_inbox.lock().unwrap().clone();
        assert_eq!(alice_got.len(), 1);
        assert_eq!(alice_got[0].subscription, "sub-0");
        assert_eq!(alice_got[0].body, "{\"id\":1}");
        let bob_got = bob_inbox.lock().unwrap().clone();
        assert_eq!(bob_got.len(), 1);
        assert_eq!(bob_got[0].destination, "/user/queue/errors");
    }
}
