//! Session Manager
//!
//! A [`Session`] is one ongoing exchange with the completion API: a fixed
//! system instruction, the accumulated turn history, and a running token
//! estimate for that history. It is a plain value owned by exactly one bucket
//! loop; nothing in here locks or sleeps.
//!
//! # Lifecycle
//!
//! ```text
//! start ──► send ──► send ──► ensure_ready ──(over budget)──► start ──► send ...
//!   ▲                                                                   │
//!   └──────────────────────────── reset at bucket end ◄─────────────────┘
//! ```
//!
//! When the history plus the next message plus the expected output would
//! reach the context budget, [`Session::ensure_ready`] rolls over to a fresh
//! session. The caller must then send a self-contained instruction, since the
//! new session remembers nothing.

pub mod budget;

pub use budget::{OutputPlan, TokenBudget};

use tracing::{debug, info, warn};

use crate::client::{
    ChatMessage, ClientError, CompletionBackend, CompletionRequest, FinishReason, Role, Usage,
};
use crate::config::DialogenConfig;
use crate::tokens::TokenEstimator;

/// Completion model family, as far as budgeting is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    /// Emits content directly
    Standard,
    /// Runs an internal reasoning phase before emitting content
    Reasoner,
}

impl ModelVariant {
    pub fn from_model_name(model: &str) -> Self {
        if model.to_lowercase().contains("reasoner") {
            ModelVariant::Reasoner
        } else {
            ModelVariant::Standard
        }
    }

    pub fn performs_reasoning(&self) -> bool {
        matches!(self, ModelVariant::Reasoner)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelVariant::Standard => "standard",
            ModelVariant::Reasoner => "reasoner",
        }
    }
}

/// Everything a session needs besides its instruction
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    pub variant: ModelVariant,
    pub temperature: f32,
    pub json_mode: bool,
    pub budget: TokenBudget,
    pub estimator: TokenEstimator,
}

impl SessionConfig {
    pub fn from_config(config: &DialogenConfig) -> Self {
        Self {
            model: config.api.model.clone(),
            variant: config.variant(),
            temperature: config.api.temperature,
            json_mode: config.api.json_mode,
            budget: TokenBudget::from(&config.budget),
            estimator: config.estimator(),
        }
    }
}

/// A successful reply
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    /// Output hit `max_tokens`; content may end mid-record
    pub truncated: bool,
    pub usage: Usage,
}

/// One bounded-context conversation
#[derive(Debug, Clone)]
pub struct Session {
    config: SessionConfig,
    system_instruction: String,
    history: Vec<ChatMessage>,
    running_estimate: usize,
}

impl Session {
    /// Create a session already started with `system_instruction`
    pub fn new(config: SessionConfig, system_instruction: impl Into<String>) -> Self {
        let mut session = Self {
            config,
            system_instruction: system_instruction.into(),
            history: Vec::new(),
            running_estimate: 0,
        };
        session.restart();
        session
    }

    /// Replace the instruction and reset history to just that system entry
    pub fn start(&mut self, system_instruction: impl Into<String>) {
        self.system_instruction = system_instruction.into();
        self.restart();
    }

    /// Reset to the cached instruction, dropping all turns
    pub fn reset(&mut self) {
        self.restart();
    }

    fn restart(&mut self) {
        self.history = vec![ChatMessage::system(self.system_instruction.clone())];
        self.running_estimate = self.config.estimator.estimate(&self.system_instruction);
        debug!(tokens = self.running_estimate, "session started");
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn running_estimate(&self) -> usize {
        self.running_estimate
    }

    pub fn system_instruction(&self) -> &str {
        &self.system_instruction
    }

    pub fn variant(&self) -> ModelVariant {
        self.config.variant
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.config.budget
    }

    /// Estimate tokens with this session's estimator
    pub fn estimate(&self, text: &str) -> usize {
        self.config.estimator.estimate(text)
    }

    /// Would sending `next_message` and receiving `expected_output_tokens`
    /// reach the context budget?
    pub fn needs_rollover(&self, next_message: &str, expected_output_tokens: usize) -> bool {
        self.running_estimate + self.estimate(next_message) + expected_output_tokens
            >= self.config.budget.max_context_tokens
    }

    /// Roll over to a fresh session if needed. Returns true when history was
    /// discarded, in which case `next_message` must not be a continuation.
    pub fn ensure_ready(&mut self, next_message: &str, expected_output_tokens: usize) -> bool {
        if !self.needs_rollover(next_message, expected_output_tokens) {
            return false;
        }
        info!(
            tokens = self.running_estimate,
            limit = self.config.budget.max_context_tokens,
            "context budget reached, starting a fresh session"
        );
        self.restart();
        true
    }

    /// Output budget for `needed` records of `round_count` rounds
    pub fn estimate_output_budget(&self, round_count: u32, needed: usize) -> usize {
        self.config
            .budget
            .estimate_output_budget(round_count, needed, self.config.variant)
    }

    /// Output budget, shrinking `needed` when it would overflow the cap
    pub fn plan_output(&self, round_count: u32, needed: usize) -> OutputPlan {
        self.config
            .budget
            .plan(round_count, needed, self.config.variant)
    }

    /// Send `message` and wait for the reply.
    ///
    /// On failure the user message stays in history, unanswered. The next
    /// `send` replaces it rather than stacking a second user turn, so the
    /// history sent on a retry still alternates.
    pub fn send(
        &mut self,
        backend: &dyn CompletionBackend,
        message: &str,
        max_output_tokens: usize,
    ) -> Result<Reply, ClientError> {
        self.drop_unanswered();
        self.history.push(ChatMessage::user(message));
        self.running_estimate += self.estimate(message);

        let request = CompletionRequest {
            model: self.config.model.clone(),
            messages: self.history.clone(),
            temperature: self.config.temperature,
            max_tokens: max_output_tokens,
            json_mode: self.config.json_mode,
            reasoning: self.config.variant.performs_reasoning(),
        };

        let response = backend.complete(&request).map_err(|e| {
            warn!(
                error = %e,
                input_tokens = self.running_estimate,
                max_tokens = max_output_tokens,
                "completion request failed"
            );
            e
        })?;

        let usage = response.usage;
        log_usage(&usage, max_output_tokens);

        let text = response.content.unwrap_or_default();
        let mut truncated = false;
        match &response.finish_reason {
            FinishReason::Length => {
                if usage.reasoning_tokens > 0 && usage.content_tokens() == 0 {
                    warn!(
                        reasoning = usage.reasoning_tokens,
                        max_tokens = max_output_tokens,
                        "reasoning consumed the whole output budget"
                    );
                    return Err(ClientError::TruncatedEmptyContent {
                        reasoning_tokens: usage.reasoning_tokens,
                        max_tokens: max_output_tokens,
                    });
                }
                warn!(
                    max_tokens = max_output_tokens,
                    "output truncated at max_tokens, salvaging what arrived"
                );
                truncated = true;
            }
            FinishReason::Stop => {}
            FinishReason::Other(reason) => info!(reason = %reason, "unusual finish reason"),
        }

        if text.trim().is_empty() {
            if usage.reasoning_tokens > 0 {
                warn!(
                    reasoning = usage.reasoning_tokens,
                    suggested = max_output_tokens * 3 / 2,
                    "empty content after reasoning"
                );
                return Err(ClientError::TruncatedEmptyContent {
                    reasoning_tokens: usage.reasoning_tokens,
                    max_tokens: max_output_tokens,
                });
            }
            return Err(ClientError::EmptyBody);
        }

        self.running_estimate += self.estimate(&text);
        self.history.push(ChatMessage::assistant(text.clone()));

        Ok(Reply {
            text,
            truncated,
            usage,
        })
    }

    /// Remove a trailing user message left by a failed send
    fn drop_unanswered(&mut self) {
        if self.history.len() > 1 && self.history.last().map(|m| m.role) == Some(Role::User) {
            if let Some(stale) = self.history.pop() {
                let tokens = self.estimate(&stale.content);
                self.running_estimate = self.running_estimate.saturating_sub(tokens);
            }
        }
    }
}

fn log_usage(usage: &Usage, max_tokens: usize) {
    if usage.prompt_tokens == 0 && usage.completion_tokens == 0 {
        return;
    }
    debug!(
        prompt = usage.prompt_tokens,
        cache_hit = usage.cache_hit_tokens,
        cache_miss = usage.cache_miss_tokens,
        completion = usage.completion_tokens,
        reasoning = usage.reasoning_tokens,
        content = usage.content_tokens(),
        max_tokens,
        "token usage"
    );
    if usage.cache_hit_rate() > 0.5 {
        debug!(
            rate = %format!("{:.1}%", usage.cache_hit_rate() * 100.0),
            "context cache hit"
        );
    }
}
