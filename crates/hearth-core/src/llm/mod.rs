//! LLM Completion Contract
//!
//! The completion provider is an external collaborator used for
//! classification, consolidation, dream fusion, reflection and gap judging.
//! The core never trusts its output: every structured response goes through
//! [`parse_json`] which yields a tagged [`ParseOutcome`] instead of an error.

mod parse;

pub use parse::{parse_json, ParseOutcome};

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Provider failure. Malformed output is NOT an error, see `ParseOutcome`.
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("Provider request failed: {0}")]
    Request(String),
    #[error("Provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Provider call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// A completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// What the call is for ("classify_facts", "reflection", ...). Used for
    /// usage accounting and log fields.
    pub operation: String,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    /// Single-turn request with a system prompt
    pub fn new(operation: &str, system: &str, prompt: impl Into<String>) -> Self {
        Self {
            operation: operation.to_string(),
            system: Some(system.to_string()),
            messages: vec![Message {
                role: Role::User,
                content: prompt.into(),
            }],
            max_tokens: 2048,
            temperature: 0.2,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// A content block in a response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    /// Blocks the core does not interpret (tool calls, thinking)
    Other { raw: serde_json::Value },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: Vec<ContentBlock>,
    pub usage: TokenUsage,
    pub model: String,
}

impl CompletionResponse {
    /// Concatenated text blocks
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

// ============================================================================
// PROVIDER CONTRACT
// ============================================================================

/// An LLM completion provider
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    fn model_name(&self) -> &str;
}

/// Instrumentation hook called after every completion. Cost accounting
/// lives outside the core.
pub trait UsageSink: Send + Sync {
    fn record(&self, user_id: &str, operation: &str, model: &str, usage: &TokenUsage);
}

/// Discards usage
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUsage;

impl UsageSink for NoopUsage {
    fn record(&self, _user_id: &str, _operation: &str, _model: &str, _usage: &TokenUsage) {}
}

// ============================================================================
// CLIENT
// ============================================================================

/// Provider plus usage hook, shared by every component that calls the LLM
#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn CompletionProvider>,
    usage: Arc<dyn UsageSink>,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn CompletionProvider>, usage: Arc<dyn UsageSink>) -> Self {
        Self { provider, usage }
    }

    /// Client without usage accounting
    pub fn untracked(provider: Arc<dyn CompletionProvider>) -> Self {
        Self::new(provider, Arc::new(NoopUsage))
    }

    /// Raw completion text
    pub async fn complete_text(
        &self,
        user_id: &str,
        request: CompletionRequest,
    ) -> Result<String, LlmError> {
        let operation = request.operation.clone();
        let response = self.provider.complete(request).await?;
        self.usage
            .record(user_id, &operation, &response.model, &response.usage);
        tracing::debug!(
            user_id,
            operation = %operation,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Completion finished"
        );
        Ok(response.text())
    }

    /// Completion parsed as JSON. Provider failures are errors, bad output is
    /// reported through the outcome.
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        user_id: &str,
        request: CompletionRequest,
    ) -> Result<ParseOutcome<T>, LlmError> {
        let operation = request.operation.clone();
        let text = self.complete_text(user_id, request).await?;
        let outcome = parse_json(&text);
        if let ParseOutcome::Malformed(reason) = &outcome {
            tracing::warn!(user_id, operation = %operation, "Malformed LLM response: {}", reason);
        }
        Ok(outcome)
    }
}
