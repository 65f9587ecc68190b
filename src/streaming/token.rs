//! Token service client
//!
//! `GET <url>?channel=<id>&role=publisher|subscriber` with an optional
//! `X-Api-Key` header, answering `{ "token": "..." }`.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::TokenConfig;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token service URL is not configured")]
    NotConfigured,

    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token service answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed token response: {0}")]
    Malformed(String),

    #[error("token service did not answer within {0:?}")]
    Timeout(Duration),

    #[error("token task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Publisher,
    Subscriber,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
        }
    }
}

/// Opaque channel credential
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token(<{} bytes>)", self.0.len())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self, channel: &str, role: Role) -> Result<Token, TokenError>;
}

pub struct HttpTokenClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpTokenClient {
    pub fn new(config: &TokenConfig) -> Result<Self, TokenError> {
        if config.url.is_empty() {
            return Err(TokenError::NotConfigured);
        }

        // Per-read timeout; the whole fetch is bounded by the session's
        // total token budget
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .read_timeout(Duration::from_millis(config.read_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }
}

#[async_trait]
impl TokenProvider for HttpTokenClient {
    #[instrument(skip(self))]
    async fn fetch_token(&self, channel: &str, role: Role) -> Result<Token, TokenError> {
        let mut request = self
            .client
            .get(&self.url)
            .query(&[("channel", channel), ("role", role.as_str())]);
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        let parsed: TokenResponse =
            serde_json::from_slice(&body).map_err(|e| TokenError::Malformed(e.to_string()))?;
        if parsed.token.is_empty() {
            return Err(TokenError::Malformed("empty token".into()));
        }

        debug!("Token issued");
        Ok(Token(parsed.token))
    }
}
