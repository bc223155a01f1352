//! Local embeddings with fastembed
//!
//! Nomic Embed Text v1.5 (ONNX, 768d) truncated to 256d Matryoshka vectors.
//! Inference is CPU-bound and runs on the blocking pool.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use super::{truncate_for_embedding, Embedder, EmbeddingError};

/// Dimensions kept after Matryoshka truncation
pub const EMBEDDING_DIMENSIONS: usize = 256;

const MODEL_NAME: &str = "nomic-ai/nomic-embed-text-v1.5";

/// Model cache: `FASTEMBED_CACHE_PATH`, else the platform cache directory
fn cache_dir() -> PathBuf {
    if let Ok(path) = std::env::var("FASTEMBED_CACHE_PATH") {
        return PathBuf::from(path);
    }
    if let Some(dirs) = directories::ProjectDirs::from("com", "hearth", "core") {
        return dirs.cache_dir().join("fastembed");
    }
    PathBuf::from(".fastembed_cache")
}

/// Truncate to [`EMBEDDING_DIMENSIONS`] and L2-normalize
fn matryoshka_truncate(mut vector: Vec<f32>) -> Vec<f32> {
    vector.truncate(EMBEDDING_DIMENSIONS);
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

pub struct LocalEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
}

impl LocalEmbedder {
    /// Load the model, downloading it on first use
    pub fn new() -> Result<Self, EmbeddingError> {
        let cache = cache_dir();
        if let Err(e) = std::fs::create_dir_all(&cache) {
            tracing::warn!(path = %cache.display(), error = %e, "Could not create embedding cache directory");
        }

        let options = InitOptions::new(EmbeddingModel::NomicEmbedTextV15)
            .with_show_download_progress(false)
            .with_cache_dir(cache);
        let model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::ModelInit(format!("{}: {}", MODEL_NAME, e)))?;

        tracing::info!(model = MODEL_NAME, dimensions = EMBEDDING_DIMENSIONS, "Local embedding model loaded");
        Ok(Self {
            model: Arc::new(Mutex::new(model)),
        })
    }

    async fn run(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let model = self.model.clone();
        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|e| EmbeddingError::ModelInit(format!("Lock poisoned: {}", e)))?;
            let vectors = model
                .embed(texts, None)
                .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;
            Ok(vectors.into_iter().map(matryoshka_truncate).collect())
        })
        .await
        .map_err(|e| EmbeddingError::EmbeddingFailed(format!("Embedding task failed: {}", e)))?
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("Text cannot be empty".to_string()));
        }
        self.run(vec![truncate_for_embedding(text).to_string()])
            .await?
            .pop()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding generated".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let inputs: Vec<String> = texts.iter().map(|t| truncate_for_embedding(t).to_string()).collect();
        let vectors = self.run(inputs).await?;
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::BatchMismatch {
                sent: texts.len(),
                received: vectors.len(),
            });
        }
        Ok(vectors)
    }

    fn model_name(&self) -> &str {
        MODEL_NAME
    }
}
