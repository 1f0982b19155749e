//! Ephemeral tokens and the token-minting collaborator.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::errors::{VoiceError, VoiceResult};
use crate::utils::{now_ms, validate_endpoint_url};

/// Short-lived credential authorizing one WebRTC handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralToken {
    pub token: String,
    /// Milliseconds since the Unix epoch
    #[serde(alias = "expiresAt")]
    pub expires_at: u64,
    #[serde(alias = "sessionId", default)]
    pub session_id: String,
}

impl EphemeralToken {
    pub fn new(token: impl Into<String>, expires_at: u64, session_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at,
            session_id: session_id.into(),
        }
    }

    pub fn is_expired(&self) -> bool {
        now_ms() >= self.expires_at
    }

    /// True when the token expires within `margin` from now.
    pub fn expires_within(&self, margin: Duration) -> bool {
        now_ms().saturating_add(margin.as_millis() as u64) >= self.expires_at
    }

    /// Time left before expiry; zero when already expired.
    pub fn time_until_expiry(&self) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now_ms()))
    }
}

/// Mints ephemeral tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetch a token, optionally bound to an existing session id.
    async fn fetch_token(&self, session_id: Option<&str>) -> VoiceResult<EphemeralToken>;
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

/// Token provider backed by the token HTTP endpoint.
pub struct HttpTokenProvider {
    client: reqwest::Client,
    url: Url,
}

impl HttpTokenProvider {
    pub fn new(token_url: &str, timeout: Duration) -> VoiceResult<Self> {
        let url = validate_endpoint_url(token_url)
            .map_err(|e| VoiceError::InvalidConfiguration(format!("token_url: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| VoiceError::InvalidConfiguration(format!("HTTP client: {e}")))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn fetch_token(&self, session_id: Option<&str>) -> VoiceResult<EphemeralToken> {
        debug!(session_id = ?session_id, "Requesting ephemeral token");

        let response = self
            .client
            .post(self.url.clone())
            .json(&TokenRequest { session_id })
            .send()
            .await
            .map_err(|e| VoiceError::TokenRequest(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Token endpoint rejected request");
            return Err(VoiceError::TokenRequest(format!("{status}: {body}")));
        }

        let mut token: EphemeralToken = response
            .json()
            .await
            .map_err(|e| VoiceError::TokenRequest(format!("malformed token response: {e}")))?;

        if token.session_id.is_empty() {
            if let Some(id) = session_id {
                token.session_id = id.to_string();
            }
        }
        if token.is_expired() {
            return Err(VoiceError::TokenExpired(
                "token endpoint returned an expired token".to_string(),
            ));
        }
        Ok(token)
    }
}
