//! Request/response chat used while the realtime socket is unavailable.

use anyhow::{Context, bail};
use async_trait::async_trait;
use pam_core::protocol::FullResponse;
use serde::Serialize;
use serde_json::Value;
use tracing::instrument;
use url::Url;
use uuid::Uuid;

#[derive(Serialize, Debug, Clone)]
pub struct FallbackRequest {
    pub message: String,
    pub user_id: String,
    pub session_id: Uuid,
    pub context: Value,
}

#[async_trait]
pub trait ChatFallback: Send + Sync {
    /// Sends one message and returns the assistant's full reply text.
    async fn send(&self, request: FallbackRequest) -> anyhow::Result<String>;
}

pub struct HttpChatFallback {
    client: reqwest::Client,
    url: Url,
}

impl HttpChatFallback {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl ChatFallback for HttpChatFallback {
    #[instrument(skip(self, request), fields(url = %self.url))]
    async fn send(&self, request: FallbackRequest) -> anyhow::Result<String> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .context("Fallback chat request failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("Fallback chat returned status {}", status);
        }

        let body: FullResponse = response
            .json()
            .await
            .context("Fallback chat returned an unexpected body")?;
        Ok(body.text().to_string())
    }
}
