//! Completion API Client
//!
//! Wire types for a chat-completions style API plus the [`CompletionBackend`]
//! seam the session talks through. The HTTP implementation lives in
//! [`http`]; [`scripted`] replays canned responses for tests and dry runs.
//!
//! A backend only moves bytes. Deciding whether a response counts as a
//! failure (empty content, reasoning phase ate the budget) is the session's
//! job, see [`crate::session::Session::send`].

pub mod http;
pub mod scripted;

pub use http::HttpBackend;
pub use scripted::ScriptedBackend;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message author role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry in a conversation sent to the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A single non-streaming completion request
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Provider model name
    pub model: String,
    /// Full ordered history, system entry first
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    /// Output cap for this call
    pub max_tokens: usize,
    /// Ask the provider to enforce a JSON object response
    pub json_mode: bool,
    /// Enable the provider's thinking phase
    pub reasoning: bool,
}

/// Why generation stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    Other(String),
}

impl FinishReason {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some(other) => FinishReason::Other(other.to_string()),
            None => FinishReason::Other("unknown".to_string()),
        }
    }
}

/// Token accounting reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_hit_tokens: u64,
    pub cache_miss_tokens: u64,
    pub reasoning_tokens: u64,
}

impl Usage {
    /// Completion tokens that went to visible content
    pub fn content_tokens(&self) -> u64 {
        self.completion_tokens.saturating_sub(self.reasoning_tokens)
    }

    /// Fraction of prompt tokens served from the provider's context cache
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hit_tokens + self.cache_miss_tokens;
        if total == 0 {
            0.0
        } else {
            self.cache_hit_tokens as f64 / total as f64
        }
    }
}

/// Parsed completion response
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    /// Assistant content; `None` when the provider sent null
    pub content: Option<String>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

impl CompletionResponse {
    /// Convenience constructor for a clean `stop` response
    pub fn stop(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            finish_reason: FinishReason::Stop,
            usage: Usage::default(),
        }
    }
}

/// Completion errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// Timeout, connection reset, DNS, TLS
    #[error("transport failure: {0}")]
    Transport(String),

    /// Non-2xx HTTP status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// 2xx with nothing in it, or an empty assistant message
    #[error("empty response body")]
    EmptyBody,

    /// Body was not the expected JSON envelope
    #[error("malformed response envelope: {0}")]
    MalformedEnvelope(String),

    /// Envelope parsed but carried no choices
    #[error("response contained no choices")]
    NoChoices,

    /// Reasoning consumed the whole output budget before any content
    #[error("reasoning used all {max_tokens} output tokens ({reasoning_tokens} reasoning, no content)")]
    TruncatedEmptyContent {
        reasoning_tokens: u64,
        max_tokens: usize,
    },
}

impl ClientError {
    /// True when the next attempt should carry a larger output budget
    pub fn is_budget_exhausted(&self) -> bool {
        matches!(self, ClientError::TruncatedEmptyContent { .. })
    }
}

/// A chat completion provider
pub trait CompletionBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Issue one blocking completion request
    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ClientError>;
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    choices: Vec<EnvelopeChoice>,
    #[serde(default)]
    usage: Option<EnvelopeUsage>,
}

#[derive(Deserialize)]
struct EnvelopeChoice {
    message: EnvelopeMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct EnvelopeMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct EnvelopeUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_cache_hit_tokens: u64,
    #[serde(default)]
    prompt_cache_miss_tokens: u64,
    #[serde(default)]
    completion_tokens_details: Option<CompletionDetails>,
}

#[derive(Deserialize, Default)]
struct CompletionDetails {
    #[serde(default)]
    reasoning_tokens: u64,
}

/// Parse a raw response body into a [`CompletionResponse`].
pub fn parse_envelope(body: &str) -> Result<CompletionResponse, ClientError> {
    if body.trim().is_empty() {
        return Err(ClientError::EmptyBody);
    }
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|e| ClientError::MalformedEnvelope(e.to_string()))?;

    let usage = envelope
        .usage
        .map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            cache_hit_tokens: u.prompt_cache_hit_tokens,
            cache_miss_tokens: u.prompt_cache_miss_tokens,
            reasoning_tokens: u
                .completion_tokens_details
                .map(|d| d.reasoning_tokens)
                .unwrap_or(0),
        })
        .unwrap_or_default();

    let choice = envelope
        .choices
        .into_iter()
        .next()
        .ok_or(ClientError::NoChoices)?;

    Ok(CompletionResponse {
        content: choice.message.content,
        finish_reason: FinishReason::parse(choice.finish_reason.as_deref()),
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_envelope_full() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "[]"}, "finish_reason": "length"}],
            "usage": {
                "prompt_tokens": 1200,
                "completion_tokens": 900,
                "prompt_cache_hit_tokens": 1000,
                "prompt_cache_miss_tokens": 200,
                "completion_tokens_details": {"reasoning_tokens": 400}
            }
        }"#;
        let resp = parse_envelope(body).unwrap();
        assert_eq!(resp.content.as_deref(), Some("[]"));
        assert_eq!(resp.finish_reason, FinishReason::Length);
        assert_eq!(resp.usage.reasoning_tokens, 400);
        assert_eq!(resp.usage.content_tokens(), 500);
        assert!((resp.usage.cache_hit_rate() - 1000.0 / 1200.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_envelope_null_content_no_usage() {
        let body = r#"{"choices": [{"message": {"content": null}, "finish_reason": "stop"}]}"#;
        let resp = parse_envelope(body).unwrap();
        assert_eq!(resp.content, None);
        assert_eq!(resp.usage, Usage::default());
    }

    #[test]
    fn test_parse_envelope_failures() {
        assert!(matches!(parse_envelope("  "), Err(ClientError::EmptyBody)));
        assert!(matches!(
            parse_envelope("<html>bad gateway</html>"),
            Err(ClientError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            parse_envelope(r#"{"choices": []}"#),
            Err(ClientError::NoChoices)
        ));
    }

    #[test]
    fn test_finish_reason_parse() {
        assert_eq!(FinishReason::parse(Some("stop")), FinishReason::Stop);
        assert_eq!(
            FinishReason::parse(Some("content_filter")),
            FinishReason::Other("content_filter".to_string())
        );
    }

    #[test]
    fn test_message_role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }
}
