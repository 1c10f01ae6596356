//! Access tokens for the realtime socket.
//!
//! The session never stores a credential itself; it asks a [`TokenProvider`]
//! for a token right before every connection attempt.

use anyhow::{Context, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use url::Url;

/// Tokens expiring within this margin are treated as already expired.
pub const EXPIRY_SKEW: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct AuthToken {
    pub access_token: SecretString,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthToken {
    pub fn new(access_token: &str, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            access_token: SecretString::from(access_token.to_string()),
            expires_at,
        }
    }

    /// A token without a known expiry is assumed fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let skew = chrono::Duration::from_std(EXPIRY_SKEW).unwrap_or_default();
                expires_at - skew > now
            }
            None => true,
        }
    }

    pub fn expose(&self) -> &str {
        self.access_token.expose_secret()
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// The token currently held, if the user is signed in.
    async fn current(&self) -> anyhow::Result<Option<AuthToken>>;
    /// Obtains a new token, replacing the current one.
    async fn refresh(&self) -> anyhow::Result<AuthToken>;
}

/// Returns a token that is valid right now, refreshing a stale one first.
///
/// `Ok(None)` means nobody is signed in. An expired token that cannot be
/// refreshed is an error; it is never handed out.
#[instrument(skip(provider))]
pub async fn valid_token(provider: &dyn TokenProvider) -> anyhow::Result<Option<AuthToken>> {
    let Some(token) = provider.current().await? else {
        return Ok(None);
    };
    if token.is_fresh(Utc::now()) {
        return Ok(Some(token));
    }
    info!("Access token is about to expire; refreshing before connecting");
    let fresh = provider
        .refresh()
        .await
        .context("Access token expired and could not be refreshed")?;
    if !fresh.is_fresh(Utc::now()) {
        warn!("Refreshed access token is already expired");
        bail!("Refreshed access token is already expired");
    }
    Ok(Some(fresh))
}

/// A fixed token, e.g. from `PAM_ACCESS_TOKEN`. It cannot be refreshed.
pub struct StaticTokenProvider {
    token: Option<SecretString>,
    expires_at: Option<DateTime<Utc>>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<&str>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            token: token.map(|t| SecretString::from(t.to_string())),
            expires_at,
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn current(&self) -> anyhow::Result<Option<AuthToken>> {
        Ok(self
            .token
            .as_ref()
            .map(|t| AuthToken::new(t.expose_secret(), self.expires_at)))
    }

    async fn refresh(&self) -> anyhow::Result<AuthToken> {
        bail!("Static access token cannot be refreshed")
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

struct TokenState {
    access_token: Option<SecretString>,
    refresh_token: SecretString,
    expires_at: Option<DateTime<Utc>>,
}

/// Exchanges a refresh token for access tokens at an HTTP endpoint.
pub struct RefreshingTokenProvider {
    client: reqwest::Client,
    refresh_url: Url,
    state: Mutex<TokenState>,
}

impl RefreshingTokenProvider {
    pub fn new(
        refresh_url: Url,
        refresh_token: &str,
        access_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            refresh_url,
            state: Mutex::new(TokenState {
                access_token: access_token.map(|t| SecretString::from(t.to_string())),
                refresh_token: SecretString::from(refresh_token.to_string()),
                expires_at,
            }),
        }
    }
}

#[async_trait]
impl TokenProvider for RefreshingTokenProvider {
    async fn current(&self) -> anyhow::Result<Option<AuthToken>> {
        let state = self.state.lock().await;
        Ok(state
            .access_token
            .as_ref()
            .map(|t| AuthToken::new(t.expose_secret(), state.expires_at)))
    }

    #[instrument(skip(self), fields(url = %self.refresh_url))]
    async fn refresh(&self) -> anyhow::Result<AuthToken> {
        let mut state = self.state.lock().await;
        let response = self
            .client
            .post(self.refresh_url.clone())
            .json(&RefreshRequest {
                refresh_token: state.refresh_token.expose_secret(),
            })
            .send()
            .await
            .context("Token refresh request failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("Token refresh rejected with status {}", status);
        }

        let body: RefreshResponse = response
            .json()
            .await
            .context("Token refresh returned an unexpected body")?;

        let expires_at = body
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));
        state.access_token = Some(SecretString::from(body.access_token.clone()));
        state.expires_at = expires_at;
        if let Some(rotated) = body.refresh_token {
            state.refresh_token = SecretString::from(rotated);
        }
        info!("Access token refreshed");
        Ok(AuthToken::new(&body.access_token, expires_at))
    }
}
