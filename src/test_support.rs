// src/test_support.rs

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::chat_core::ChatCore;
use crate::error::{ChatError, ChatResult};
use crate::memory_store::InMemoryStore;
use crate::models::User;
use crate::push::{PushCapability, PushNotification, PushOutcome};
use crate::repository::{Store, UserRepository};
use crate::router::Transport;

/// Keeps every publish in order. `failing()` rejects everything.
#[derive(Default)]
pub struct RecordingTransport {
    fail: bool,
    published: Mutex<Vec<(String, Value)>>,
    private: Mutex<Vec<(String, String, Value)>>,
}

impl RecordingTransport {
    pub fn failing() -> Self {
        RecordingTransport {
            fail: true,
            ..Default::default()
        }
    }

    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_to(&self, destination: &str) -> Vec<Value> {
        self.published()
            .into_iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, v)| v)
            .collect()
    }

    /// (username, destination, payload)
    pub fn private(&self) -> Vec<(String, String, Value)> {
        self.private.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
        self.private.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(&self, destination: &str, payload: Value) -> ChatResult<()> {
        if self.fail {
            return Err(ChatError::TransportFailure("broker unavailable".into()));
        }
        self.published
            .lock()
            .unwrap()
            .push((destination.to_string(), payload));
        Ok(())
    }

    async fn send_to_user(&self, username: &str, destination: &str, payload: Value) -> ChatResult<()> {
        if self.fail {
            return Err(ChatError::TransportFailure("broker unavailable".into()));
        }
        self.private
            .lock()
            .unwrap()
            .push((username.to_string(), destination.to_string(), payload));
        Ok(())
    }
}

/// Records each batch; tokens listed in `invalid` come back as InvalidToken.
#[derive(Default)]
pub struct RecordingPush {
    invalid: Mutex<HashSet<String>>,
    batches: Mutex<Vec<(Vec<String>, PushNotification)>>,
}

impl RecordingPush {
    pub fn mark_invalid(&self, token: &str) {
        self.invalid.lock().unwrap().insert(token.to_string());
    }

    pub fn batches(&self) -> Vec<(Vec<String>, PushNotification)> {
        self.batches.lock().unwrap().clone()
    }

    pub fn tokens_sent(&self) -> Vec<String> {
        self.batches().into_iter().flat_map(|(t, _)| t).collect()
    }
}

#[async_trait]
impl PushCapability for RecordingPush {
    async fn send_batch(&self, tokens: &[String], notification: &PushNotification) -> ChatResult<Vec<PushOutcome>> {
        self.batches
            .lock()
            .unwrap()
            .push((tokens.to_vec(), notification.clone()));
        let invalid = self.invalid.lock().unwrap();
        Ok(tokens
            .iter()
            .map(|t| {
                if invalid.contains(t) {
                    PushOutcome::InvalidToken
                } else {
                    PushOutcome::Delivered
                }
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// A ChatCore over the in-memory store with both outer edges recorded.
pub struct TestChat {
    pub core: Arc<ChatCore>,
    pub store: Arc<InMemoryStore>,
    pub transport: Arc<RecordingTransport>,
    pub push: Arc<RecordingPush>,
}

impl TestChat {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let transport = Arc::new(RecordingTransport::default());
        let push = Arc::new(RecordingPush::default());
        let core = ChatCore::assemble(
            Store::from_backend(store.clone()),
            transport.clone(),
            push.clone(),
            "http://chat.test",
        );
        TestChat {
            core: Arc::new(core),
            store,
            transport,
            push,
        }
    }

    pub async fn user(&self, username: &str) -> User {
        UserRepository::insert(
            self.store.as_ref(),
            User::new(username, None, None, "hash".into()),
        )
        .await
        .unwrap()
    }
}
