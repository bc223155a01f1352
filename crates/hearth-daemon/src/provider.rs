//! OpenAI-compatible HTTP providers
//!
//! `POST {base}/chat/completions` for completions and `POST {base}/embeddings`
//! for vectors. Any server speaking that dialect works (OpenAI, vLLM,
//! llama.cpp, Ollama's compatibility layer).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use hearth_core::config::LlmConfig;
use hearth_core::embeddings::{truncate_for_embedding, Embedder, EmbeddingError};
use hearth_core::llm::{
    CompletionProvider, CompletionRequest, CompletionResponse, ContentBlock, LlmError, Role,
    TokenUsage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_EMBED_MODEL: &str = "text-embedding-3-small";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

// ============================================================================
// COMPLETIONS
// ============================================================================

pub struct HttpCompletionProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpCompletionProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client()?,
            base_url: config.base_url.clone().unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_key: config.api_key.clone(),
        })
    }

    fn body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        for message in &request.messages {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(serde_json::json!({"role": role, "content": message.content}));
        }
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        })
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut builder = self
            .client
            .post(endpoint(&self.base_url, "chat/completions"))
            .json(&self.body(&request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(REQUEST_TIMEOUT)
            } else {
                LlmError::Request(e.to_string())
            }
        })?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(LlmError::Status { status, body: text });
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| LlmError::Request(format!("Unreadable completion response: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .filter_map(|c| c.message.content)
            .map(|text| ContentBlock::Text { text })
            .collect();
        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content,
            usage,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Stand-in when no endpoint is configured. Every call fails, which the
/// core treats as "skip".
pub struct UnconfiguredProvider;

#[async_trait]
impl CompletionProvider for UnconfiguredProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Err(LlmError::Request("no completion endpoint configured".to_string()))
    }

    fn model_name(&self) -> &str {
        "none"
    }
}

// ============================================================================
// EMBEDDINGS
// ============================================================================

pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbedder {
    pub fn new(config: &LlmConfig, model: Option<&str>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client()?,
            base_url: config.base_url.clone().unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: model.unwrap_or(DEFAULT_EMBED_MODEL).to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn request(&self, inputs: Vec<&str>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let sent = inputs.len();
        let mut builder = self
            .client
            .post(endpoint(&self.base_url, "embeddings"))
            .json(&serde_json::json!({"model": self.model, "input": inputs}));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::EmbeddingFailed(format!("HTTP {}: {}", status.as_u16(), body)));
        }
        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        if parsed.data.len() != sent {
            return Err(EmbeddingError::BatchMismatch {
                sent,
                received: parsed.data.len(),
            });
        }
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("Text cannot be empty".to_string()));
        }
        self.request(vec![truncate_for_embedding(text)])
            .await?
            .pop()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding generated".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts.iter().map(|t| truncate_for_embedding(t)).collect())
            .await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_paths() {
        assert_eq!(endpoint("http://localhost:8080/v1/", "embeddings"), "http://localhost:8080/v1/embeddings");
        assert_eq!(endpoint("http://localhost:8080/v1", "chat/completions"), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_body_puts_system_first() {
        let provider = HttpCompletionProvider::new(&LlmConfig::default()).unwrap();
        let body = provider.body(&CompletionRequest::new("op", "be terse", "hello"));
        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
    }

    #[test]
    fn test_chat_response_parses_without_usage() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":"[]"}}]}"#).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("[]"));
        assert!(parsed.usage.is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_provider_fails() {
        let result = UnconfiguredProvider
            .complete(CompletionRequest::new("op", "sys", "prompt"))
            .await;
        assert!(matches!(result, Err(LlmError::Request(_))));
    }
}
