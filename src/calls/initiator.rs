//! Obtains the relay url for a call.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use sfucore::net::{HttpClient, HttpRequest};
use sfucore::types::{CallId, ChatId};
use std::sync::Arc;

#[async_trait]
pub trait SessionInitiator: Send + Sync {
    async fn relay_url(&self, chat_id: &ChatId, call_id: &CallId) -> anyhow::Result<String>;
}

/// Always returns the same url. Handy when the relay is known up front.
#[derive(Debug, Clone)]
pub struct StaticSessionInitiator {
    url: String,
}

impl StaticSessionInitiator {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl SessionInitiator for StaticSessionInitiator {
    async fn relay_url(&self, _chat_id: &ChatId, _call_id: &CallId) -> anyhow::Result<String> {
        Ok(self.url.clone())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest<'a> {
    chat_id: &'a ChatId,
    call_id: &'a CallId,
}

#[derive(Deserialize)]
struct SessionResponse {
    url: String,
}

/// Asks a REST endpoint for the relay url: `POST {endpoint}` with
/// `{"chatId", "callId"}`, answered by `{"url": "wss://..."}`.
pub struct RestSessionInitiator {
    http: Arc<dyn HttpClient>,
    endpoint: String,
}

impl RestSessionInitiator {
    pub fn new(http: Arc<dyn HttpClient>, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SessionInitiator for RestSessionInitiator {
    async fn relay_url(&self, chat_id: &ChatId, call_id: &CallId) -> anyhow::Result<String> {
        let body = serde_json::to_vec(&SessionRequest { chat_id, call_id })?;
        let request = HttpRequest::post(&self.endpoint)
            .with_header("Content-Type", "application/json")
            .with_body(body);

        debug!(target: "Call/Initiator", "requesting relay for {chat_id}/{call_id}");
        let response = self.http.execute(request).await?;
        let status = response.status_code;
        let body = response.body_into_vec()?;
        if !(200..300).contains(&status) {
            return Err(anyhow!(
                "session request failed with status {status}: {}",
                String::from_utf8_lossy(&body)
            ));
        }
        let parsed: SessionResponse =
            serde_json::from_slice(&body).context("malformed session response")?;
        url::Url::parse(&parsed.url).with_context(|| format!("invalid relay url {}", parsed.url))?;
        Ok(parsed.url)
    }
}
