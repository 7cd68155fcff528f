// src/push.rs

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

/// FCM accepts at most this many registration ids per request.
const MAX_BATCH: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub click_action: String,
    #[serde(skip)]
    pub data: HashMap<String, String>,
}

/// Per-token result of a batch send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// Provider says the token is gone for good; deactivate it.
    InvalidToken,
    Failed(String),
    Skipped,
}

#[async_trait]
pub trait PushCapability: Send + Sync {
    /// One outcome per token, in token order. Err means the provider was unreachable.
    async fn send_batch(&self, tokens: &[String], notification: &PushNotification) -> ChatResult<Vec<PushOutcome>>;

    fn name(&self) -> &'static str;
}

/// Wired when PUSH_ENABLED is false.
pub struct DisabledPush;

#[async_trait]
impl PushCapability for DisabledPush {
    async fn send_batch(&self, tokens: &[String], notification: &PushNotification) -> ChatResult<Vec<PushOutcome>> {
        debug!(
            "Push disabled, dropping '{}' for {} device(s)",
            notification.title,
            tokens.len()
        );
        Ok(vec![PushOutcome::Skipped; tokens.len()])
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

#[derive(Serialize)]
struct FcmRequest<'a> {
    registration_ids: &'a [String],
    notification: &'a PushNotification,
    data: &'a HashMap<String, String>,
    priority: &'static str,
}

#[derive(Deserialize)]
struct FcmResponse {
    #[serde(default)]
    results: Vec<FcmResult>,
}

#[derive(Deserialize)]
struct FcmResult {
    message_id: Option<String>,
    error: Option<String>,
}

/// FCM HTTP multicast client.
pub struct FcmPushClient {
    http: reqwest::Client,
    endpoint: String,
    server_key: String,
}

impl FcmPushClient {
    pub fn new(endpoint: &str, server_key: &str) -> ChatResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ChatError::Config(format!("push client: {}", e)))?;
        info!("FCM push client targeting {}", endpoint);
        Ok(FcmPushClient {
            http,
            endpoint: endpoint.to_string(),
            server_key: server_key.to_string(),
        })
    }

    async fn send_chunk(&self, tokens: &[String], notification: &PushNotification) -> ChatResult<Vec<PushOutcome>> {
        let body = FcmRequest {
            registration_ids: tokens,
            notification,
            data: &notification.data,
            priority: "high",
        };
        let response = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::AUTHORIZATION, format!("key={}", self.server_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::TransportFailure(format!("push provider unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::TransportFailure(format!("push provider returned {}", status)));
        }
        let parsed: FcmResponse = response
            .json()
            .await
            .map_err(|e| ChatError::TransportFailure(format!("bad push provider reply: {}", e)))?;

        let mut outcomes: Vec<PushOutcome> = parsed.results.into_iter().map(classify).collect();
        outcomes.resize(tokens.len(), PushOutcome::Failed("no result from provider".into()));
        Ok(outcomes)
    }
}

fn classify(result: FcmResult) -> PushOutcome {
    match (result.message_id, result.error.as_deref()) {
        (_, Some("NotRegistered")) | (_, Some("InvalidRegistration")) => PushOutcome::InvalidToken,
        (_, Some(other)) => PushOutcome::Failed(other.to_string()),
        (Some(_), None) => PushOutcome::Delivered,
        (None, None) => PushOutcome::Failed("empty result".into()),
    }
}

#[async_trait]
impl PushCapability for FcmPushClient {
    async fn send_batch(&self, tokens: &[String], notification: &PushNotification) -> ChatResult<Vec<PushOutcome>> {
        let mut outcomes = Vec::with_capacity(tokens.len());
        for chunk in tokens.chunks(MAX_BATCH) {
            match self.send_chunk(chunk, notification).await {
                Ok(mut chunk_outcomes) => outcomes.append(&mut chunk_outcomes),
                Err(e) if outcomes.is_empty() => return Err(e),
                Err(e) => {
                    warn!("Push chunk failed after partial delivery: {}", e);
                    outcomes.extend(chunk.iter().map(|_| PushOutcome::Failed(e.to_string())));
                }
            }
        }
        Ok(outcomes)
    }

    fn name(&self) -> &'static str {
        "fcm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_classify_tokens() {
        let gone = FcmResult { message_id: None, error: Some("NotRegistered".into()) };
        let bad = FcmResult { message_id: None, error: Some("InvalidRegistration".into()) };
        let busy = FcmResult { message_id: None, error: Some("Unavailable".into()) };
        let ok = FcmResult { message_id: Some("0:1".into()), error: None };
        assert_eq!(classify(gone), PushOutcome::InvalidToken);
        assert_eq!(classify(bad), PushOutcome::InvalidToken);
        assert_eq!(classify(busy), PushOutcome::Failed("Unavailable".into()));
        assert_eq!(classify(ok), PushOutcome::Delivered);
    }
}
