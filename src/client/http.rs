//! HTTP Backend
//!
//! OpenAI-compatible chat completions over blocking HTTP (DeepSeek by
//! default). Separate connect and read timeouts: a short connect timeout and a
//! long read timeout for large generations.

use super::{
    parse_envelope, ClientError, CompletionBackend, CompletionRequest, CompletionResponse,
};
use crate::config::ApiConfig;
use std::time::Duration;

/// Chat completions backend
pub struct HttpBackend {
    agent: ureq::Agent,
    api_key: String,
    endpoint: String,
}

impl HttpBackend {
    /// Create with explicit configuration
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(read_timeout)
            .build();
        Self {
            agent,
            api_key: api_key.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Create from the `[api]` section and a resolved key
    pub fn from_config(config: &ApiConfig, api_key: impl Into<String>) -> Self {
        Self::new(
            config.base_url.clone(),
            api_key,
            config.connect_timeout(),
            config.read_timeout(),
        )
    }

    /// Get the endpoint URL
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Build the JSON request body
pub fn request_body(request: &CompletionRequest) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": request.model,
        "messages": request.messages,
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
        "stream": false,
    });
    if request.reasoning {
        body["thinking"] = serde_json::json!({ "type": "enabled" });
    }
    if request.json_mode {
        body["response_format"] = serde_json::json!({ "type": "json_object" });
    }
    body
}

impl CompletionBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ClientError> {
        let response = self
            .agent
            .post(&self.endpoint)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .set("Content-Type", "application/json")
            .set("Accept", "application/json")
            .send_json(request_body(request))
            .map_err(|e| match e {
                ureq::Error::Status(status, resp) => ClientError::Status {
                    status,
                    body: resp.into_string().unwrap_or_default(),
                },
                ureq::Error::Transport(t) => ClientError::Transport(t.to_string()),
            })?;

        // A connection dropped mid-body surfaces here, not in send_json.
        let body = response
            .into_string()
            .map_err(|e| ClientError::Transport(format!("incomplete body: {}", e)))?;

        parse_envelope(&body)
    }
}
