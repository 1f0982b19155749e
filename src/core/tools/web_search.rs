//! Web search tool backed by the search proxy endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};
use url::Url;

use super::ToolExecutor;
use crate::core::protocol::ToolDef;
use crate::core::session::ConversationMessage;
use crate::errors::{VoiceError, VoiceResult};
use crate::utils::validate_endpoint_url;

pub const WEB_SEARCH_TOOL_NAME: &str = "web_search";

const FALLBACK_MESSAGE: &str =
    "I wasn't able to search the web just now. Let me answer from what I already know.";

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    context: Vec<&'a ConversationMessage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchResponse {
    pub success: bool,
    pub response: Option<String>,
    pub search_results: Option<Value>,
    pub citations: Option<Vec<Value>>,
    pub error: Option<String>,
}

pub struct WebSearchTool {
    client: reqwest::Client,
    url: Url,
}

impl WebSearchTool {
    pub fn new(search_url: &str, timeout: Duration) -> VoiceResult<Self> {
        let url = validate_endpoint_url(search_url)
            .map_err(|e| VoiceError::InvalidConfiguration(format!("web_search_url: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::InvalidConfiguration(format!("HTTP client: {e}")))?;
        Ok(Self { client, url })
    }

    /// Run a search, returning the proxy's answer text.
    pub async fn search(
        &self,
        query: &str,
        context: &[ConversationMessage],
    ) -> VoiceResult<String> {
        let request = SearchRequest {
            query,
            context: context.iter().collect(),
        };
        let response = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::ToolCall(format!("search proxy {status}: {body}")));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::ToolCall(format!("malformed search response: {e}")))?;
        if !body.success {
            return Err(VoiceError::ToolCall(
                body.error.unwrap_or_else(|| "search failed".to_string()),
            ));
        }

        let mut answer = body
            .response
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| VoiceError::ToolCall("empty search response".to_string()))?;
        let sources: Vec<String> = body
            .citations
            .unwrap_or_default()
            .iter()
            .filter_map(|c| match c {
                Value::String(s) => Some(s.clone()),
                Value::Object(o) => o.get("url").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect();
        if !sources.is_empty() {
            answer.push_str("\n\nSources: ");
            answer.push_str(&sources.join(", "));
        }
        Ok(answer)
    }
}

#[async_trait]
impl ToolExecutor for WebSearchTool {
    fn name(&self) -> &str {
        WEB_SEARCH_TOOL_NAME
    }

    fn definition(&self) -> ToolDef {
        ToolDef::function(
            WEB_SEARCH_TOOL_NAME,
            "Search the web for current information.",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "What to search for" }
                },
                "required": ["query"]
            }),
        )
    }

    async fn execute(&self, arguments: &Value, context: &[ConversationMessage]) -> String {
        let Some(query) = arguments
            .get("query")
            .and_then(Value::as_str)
            .filter(|q| !q.trim().is_empty())
        else {
            warn!("web_search called without a query");
            return FALLBACK_MESSAGE.to_string();
        };

        debug!(query, "Running web search");
        match self.search(query, context).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "Web search failed, returning fallback");
                FALLBACK_MESSAGE.to_string()
            }
        }
    }
}
