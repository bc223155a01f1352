//! Scripted collaborators for tests
//!
//! Deterministic `Embedder` and `CompletionProvider` implementations used by
//! unit tests and the e2e crate (`testing` feature).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::embeddings::{Embedder, EmbeddingError};
use crate::llm::{
    CompletionProvider, CompletionRequest, CompletionResponse, ContentBlock, LlmError, TokenUsage,
    UsageSink,
};
use crate::text::normalize_words;

// ============================================================================
// EMBEDDERS
// ============================================================================

/// Bag-of-words hashing embedder. Identical texts embed identically and texts
/// sharing words land close together.
pub struct HashEmbedder {
    dimensions: usize,
    calls: AtomicUsize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            calls: AtomicUsize::new(0),
        }
    }

    /// Texts embedded so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The vector this embedder produces for `text`
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        let words = normalize_words(text);
        if words.is_empty() {
            v[fnv(text.to_lowercase().as_bytes()) % self.dimensions] = 1.0;
        }
        for w in &words {
            v[fnv(w.as_bytes()) % self.dimensions] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

fn fnv(bytes: &[u8]) -> usize {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash as usize
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn model_name(&self) -> &str {
        "hash-embedder"
    }
}

/// Embedder with pinned vectors for chosen texts, hashing for the rest
#[derive(Default)]
pub struct FixedEmbedder {
    pinned: Mutex<HashMap<String, Vec<f32>>>,
    fallback: HashEmbedder,
}

impl FixedEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(self, text: &str, vector: Vec<f32>) -> Self {
        if let Ok(mut pinned) = self.pinned.lock() {
            pinned.insert(text.to_string(), vector);
        }
        self
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        self.pinned
            .lock()
            .ok()
            .and_then(|p| p.get(text).cloned())
            .unwrap_or_else(|| self.fallback.vector_for(text))
    }
}

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.vector_for(text))
    }

    fn model_name(&self) -> &str {
        "fixed-embedder"
    }
}

/// Batch endpoint always fails; single calls fail only for the poisoned text
pub struct FailingBatchEmbedder {
    poison: String,
    inner: HashEmbedder,
}

impl FailingBatchEmbedder {
    pub fn failing_on(poison: &str) -> Self {
        Self {
            poison: poison.to_string(),
            inner: HashEmbedder::default(),
        }
    }
}

#[async_trait]
impl Embedder for FailingBatchEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text == self.poison {
            return Err(EmbeddingError::EmbeddingFailed("poisoned input".to_string()));
        }
        self.inner.embed(text).await
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::EmbeddingFailed("batch endpoint down".to_string()))
    }

    fn model_name(&self) -> &str {
        "failing-batch-embedder"
    }
}

/// Embedder that is always unavailable
pub struct DownEmbedder;

#[async_trait]
impl Embedder for DownEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::EmbeddingFailed("provider unavailable".to_string()))
    }

    fn model_name(&self) -> &str {
        "down-embedder"
    }
}

// ============================================================================
// COMPLETION PROVIDERS
// ============================================================================

/// Completion provider answering from per-operation scripts.
///
/// Responses queued for an operation are consumed in order; the last one
/// sticks. Operations with no script answer with empty text.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<Result<String, LlmError>>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a text response for `operation`
    pub fn respond(&self, operation: &str, text: impl Into<String>) -> &Self {
        self.push(operation, Ok(text.into()));
        self
    }

    /// Queue a JSON response for `operation`
    pub fn respond_json(&self, operation: &str, value: serde_json::Value) -> &Self {
        self.push(operation, Ok(value.to_string()));
        self
    }

    /// Queue a provider failure for `operation`
    pub fn fail(&self, operation: &str) -> &Self {
        self.push(
            operation,
            Err(LlmError::Request(format!("scripted failure for {}", operation))),
        );
        self
    }

    /// Replace every queued response for `operation`
    pub fn reset(&self, operation: &str) -> &Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.remove(operation);
        }
        self
    }

    fn push(&self, operation: &str, response: Result<String, LlmError>) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts
                .entry(operation.to_string())
                .or_default()
                .push_back(response);
        }
    }

    /// Requests received for `operation`
    pub fn requests_for(&self, operation: &str) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| {
                r.iter()
                    .filter(|req| req.operation == operation)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.requests_for(operation).len()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let operation = request.operation.clone();
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let scripted = self.scripts.lock().ok().and_then(|mut scripts| {
            let queue = scripts.get_mut(&operation)?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        });

        let text = scripted.unwrap_or_else(|| Ok(String::new()))?;
        Ok(CompletionResponse {
            content: vec![ContentBlock::Text { text }],
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
            },
            model: "scripted".to_string(),
        })
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Provider whose calls never complete
pub struct HangingProvider;

#[async_trait]
impl CompletionProvider for HangingProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        std::future::pending().await
    }

    fn model_name(&self) -> &str {
        "hanging"
    }
}

/// Usage sink that remembers what it saw
#[derive(Default)]
pub struct RecordingUsage {
    records: Mutex<Vec<(String, String, TokenUsage)>>,
}

impl RecordingUsage {
    /// (user, operation) pairs recorded so far
    pub fn operations(&self) -> Vec<(String, String)> {
        self.records
            .lock()
            .map(|r| r.iter().map(|(u, o, _)| (u.clone(), o.clone())).collect())
            .unwrap_or_default()
    }
}

impl UsageSink for RecordingUsage {
    fn record(&self, user_id: &str, operation: &str, _model: &str, usage: &TokenUsage) {
        if let Ok(mut records) = self.records.lock() {
            records.push((user_id.to_string(), operation.to_string(), *usage));
        }
    }
}
