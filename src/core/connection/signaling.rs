use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::{debug, warn};
use url::Url;

use super::base::SdpSignaler;
use crate::errors::{VoiceError, VoiceResult};
use crate::utils::validate_endpoint_url;

/// SDP handshake over HTTP: the offer is POSTed as `application/sdp` with the
/// ephemeral token as bearer credential and the body of a 2xx response is
/// the answer.
pub struct HttpSdpSignaler {
    client: reqwest::Client,
    url: Url,
}

impl HttpSdpSignaler {
    /// `model` is appended as the `model` query parameter when given.
    pub fn new(realtime_url: &str, model: Option<&str>, timeout: Duration) -> VoiceResult<Self> {
        let mut url = validate_endpoint_url(realtime_url)
            .map_err(|e| VoiceError::InvalidConfiguration(format!("realtime_url: {e}")))?;
        if let Some(model) = model.filter(|m| !m.is_empty()) {
            url.query_pairs_mut().append_pair("model", model);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| VoiceError::InvalidConfiguration(format!("HTTP client: {e}")))?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl SdpSignaler for HttpSdpSignaler {
    async fn exchange(&self, offer_sdp: &str, token: &str) -> VoiceResult<String> {
        debug!(url = %self.url, offer_len = offer_sdp.len(), "Posting SDP offer");

        let response = self
            .client
            .post(self.url.clone())
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(CONTENT_TYPE, "application/sdp")
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(|e| VoiceError::HandshakeFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| VoiceError::HandshakeFailed(e.to_string()))?;

        if !status.is_success() {
            warn!(status = %status, "SDP handshake rejected");
            return Err(VoiceError::HandshakeFailed(format!("{status}: {body}")));
        }
        if body.trim().is_empty() {
            return Err(VoiceError::HandshakeFailed("empty SDP answer".to_string()));
        }
        Ok(body)
    }
}
