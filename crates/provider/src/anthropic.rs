//! Anthropic Messages API client
//!
//! Falls back to a deterministic offline reply when no API key is configured.

use crate::*;
use reqwest::Client;
use tracing::{debug, trace, warn};
use weaver_config::{ChatConfig, DEFAULT_BASE_URL, DEFAULT_MODEL, REQUEST_TIMEOUT};

/// Value of the `anthropic-version` header
pub const API_VERSION: &str = "2023-06-01";

/// Messages API client over a shared connection pool
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

/// Request body of `POST /v1/messages`
#[derive(Debug, Serialize)]
pub(crate) struct WireRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

/// Response body of `POST /v1/messages`
#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

impl AnthropicClient {
    /// Fails with `ProviderError::Request` when the HTTP client cannot be built
    pub fn try_new(
        api_key: impl Into<String>,
        base_url: Option<String>,
        model: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(client, api_key, base_url, model))
    }

    /// Like `try_new`, falling back to a client without the request timeout
    pub fn new(
        api_key: impl Into<String>,
        base_url: Option<String>,
        model: Option<String>,
    ) -> Self {
        let client = match Client::builder().timeout(REQUEST_TIMEOUT).build() {
            Ok(client) => client,
            Err(e) => {
                warn!(
                    "◆ HTTP client with a {}s timeout unavailable ({}), using defaults",
                    REQUEST_TIMEOUT.as_secs(),
                    e
                );
                Client::new()
            }
        };
        Self::with_client(client, api_key, base_url, model)
    }

    fn with_client(
        client: Client,
        api_key: impl Into<String>,
        base_url: Option<String>,
        model: Option<String>,
    ) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(
            config.api_key.clone(),
            Some(config.base_url.clone()),
            Some(config.model.clone()),
        )
    }

    pub fn try_from_config(config: &ChatConfig) -> Result<Self> {
        Self::try_new(
            config.api_key.clone(),
            Some(config.base_url.clone()),
            Some(config.model.clone()),
        )
    }

    /// Client configured solely from the environment
    pub fn from_env() -> Self {
        Self::from_config(&ChatConfig::from_env())
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    pub(crate) fn build_request<'a>(&'a self, request: &'a ChatRequest) -> WireRequest<'a> {
        WireRequest {
            model: &self.model,
            system: Some(request.system_prompt.as_str()).filter(|s| !s.is_empty()),
            messages: &request.messages,
            tools: Some(request.tools.as_slice()).filter(|t| !t.is_empty()),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        }
    }

    fn parse_response(body: &[u8]) -> Result<ChatResponse> {
        let wire: WireResponse = serde_json::from_slice(body)
            .map_err(|e| ProviderError::Protocol(format!("invalid response body: {}", e)))?;

        trace!("◆ Response {} from {}", wire.id, wire.model);

        Ok(ChatResponse {
            content: wire.content,
            stop_reason: wire.stop_reason.unwrap_or_default(),
            usage: wire.usage,
        })
    }

    /// Offline reply echoing the last user text and the tool count
    fn mock_response(request: &ChatRequest) -> ChatResponse {
        let last_user = request
            .messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::User)
            .map(Message::text)
            .find(|t| !t.is_empty())
            .unwrap_or_default();

        ChatResponse::end_turn(format!(
            "[mock] {} (tools available: {})",
            last_user,
            request.tools.len()
        ))
    }

    /// A non-2xx status is kept even when its body could not be read
    fn body_read_error(
        status: u16,
        timed_out: bool,
        detail: impl std::fmt::Display,
    ) -> ProviderError {
        if !(200..300).contains(&status) {
            ProviderError::Upstream {
                status,
                body: String::new(),
            }
        } else if timed_out {
            ProviderError::Timeout(REQUEST_TIMEOUT)
        } else {
            ProviderError::Protocol(format!("failed to read response body: {}", detail))
        }
    }

    fn map_transport(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(REQUEST_TIMEOUT)
        } else {
            ProviderError::Request(err)
        }
    }

    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let url = self.endpoint();
        trace!("◆ POST {}", url);

        let body = serde_json::to_vec(&self.build_request(request))
            .map_err(|e| ProviderError::Protocol(format!("failed to encode request: {}", e)))?;

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .body(body)
            .send()
            .await
            .map_err(Self::map_transport)?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::body_read_error(status.as_u16(), e.is_timeout(), e))?;

        if !status.is_success() {
            return Err(ProviderError::Upstream {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        let response = Self::parse_response(&bytes)?;
        debug!(
            "◆ Chat response: stop_reason={}, {} tool calls",
            response.stop_reason,
            response.tool_calls().len()
        );
        Ok(response)
    }
}

#[async_trait]
impl ChatClient for AnthropicClient {
    async fn chat_with_tools(
        &self,
        cancel: &CancellationToken,
        request: ChatRequest,
    ) -> Result<ChatResponse> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        if !self.is_configured() {
            debug!("◆ No API key configured, answering from mock");
            return Ok(Self::mock_response(&request));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = self.send(&request) => result,
        }
    }

    fn default_model(&self) -> String {
        self.model.clone()
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }
}
