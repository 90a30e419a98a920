//! Shared plumbing for OpenAI-compatible HTTP capabilities (STT, chat, TTS).

use crate::error::{VoiceError, VoiceResult};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Connection to one OpenAI-compatible endpoint
#[derive(Debug, Clone)]
pub struct OpenAiEndpoint {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1)
    pub base_url: String,
    /// Bearer API key
    pub api_key: String,
    client: reqwest::Client,
}

impl OpenAiEndpoint {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> VoiceResult<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(VoiceError::Config("API key must not be empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(self.url(path)).bearer_auth(&self.api_key)
    }

    /// Verify credentials and reachability with `GET /models`.
    pub async fn preflight(&self, service: &'static str) -> VoiceResult<()> {
        let res = self
            .client
            .get(self.url("models"))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| VoiceError::http(service, e))?;
        check_status(service, res).await?;
        debug!("{} preflight ok ({})", service, self.base_url);
        Ok(())
    }
}

/// Turn a non-success response into a classified error.
pub async fn check_status(
    service: &'static str,
    res: reqwest::Response,
) -> VoiceResult<reqwest::Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(VoiceError::from_status(service, status.as_u16(), body))
}
