//! Batched embedding with degraded fallback
//!
//! Texts are embedded in bounded batches with at most `concurrency` batches
//! in flight. A failed (or short) batch is retried item by item; an item that
//! still fails yields `None` and is logged, never silently dropped from the
//! output ordering.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};
use lru::LruCache;

use super::{truncate_for_embedding, Embedder};
use crate::config::EmbeddingConfig;

/// Batching front-end over an `Embedder`
pub struct EmbeddingBatcher {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    concurrency: usize,
    /// Cache for texts embedded recently (repeated facts, repeated queries)
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingBatcher {
    pub fn new(embedder: Arc<dyn Embedder>, config: &EmbeddingConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            embedder,
            batch_size: config.batch_size.max(1),
            concurrency: config.concurrency.max(1),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    /// Embed one text, `None` on failure
    pub async fn embed_one(&self, text: &str) -> Option<Vec<f32>> {
        self.embed_all(&[text.to_string()]).await.pop().flatten()
    }

    /// Embed every text, preserving input order
    pub async fn embed_all(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<(usize, String)> = Vec::new();

        if let Ok(mut cache) = self.cache.lock() {
            for (i, text) in texts.iter().enumerate() {
                match cache.get(text) {
                    Some(v) => results[i] = Some(v.clone()),
                    None => misses.push((i, text.clone())),
                }
            }
        } else {
            misses.extend(texts.iter().cloned().enumerate());
        }

        if misses.is_empty() {
            return results;
        }

        let chunks: Vec<Vec<(usize, String)>> = misses
            .chunks(self.batch_size)
            .map(|c| c.to_vec())
            .collect();

        let embedded: Vec<Vec<(usize, String, Option<Vec<f32>>)>> = stream::iter(chunks)
            .map(|chunk| self.embed_chunk(chunk))
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut cache = self.cache.lock().ok();
        for (i, text, vector) in embedded.into_iter().flatten() {
            if let (Some(cache), Some(v)) = (cache.as_mut(), vector.as_ref()) {
                cache.put(text, v.clone());
            }
            results[i] = vector;
        }

        results
    }

    async fn embed_chunk(
        &self,
        chunk: Vec<(usize, String)>,
    ) -> Vec<(usize, String, Option<Vec<f32>>)> {
        let inputs: Vec<String> = chunk
            .iter()
            .map(|(_, t)| truncate_for_embedding(t).to_string())
            .collect();

        match self.embedder.embed_batch(&inputs).await {
            Ok(vectors) if vectors.len() == chunk.len() => {
                return chunk
                    .into_iter()
                    .zip(vectors)
                    .map(|((i, t), v)| (i, t, Some(v)))
                    .collect();
            }
            Ok(vectors) => {
                tracing::warn!(
                    sent = chunk.len(),
                    received = vectors.len(),
                    "Embedding batch size mismatch, falling back to serial calls"
                );
            }
            Err(e) => {
                tracing::warn!(
                    batch = chunk.len(),
                    "Embedding batch failed, falling back to serial calls: {}",
                    e
                );
            }
        }

        let mut out = Vec::with_capacity(chunk.len());
        for ((i, text), input) in chunk.into_iter().zip(inputs) {
            match self.embedder.embed(&input).await {
                Ok(v) => out.push((i, text, Some(v))),
                Err(e) => {
                    tracing::warn!(index = i, "Embedding failed for item: {}", e);
                    out.push((i, text, None));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingBatchEmbedder, HashEmbedder};

    fn config(batch_size: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            batch_size,
            concurrency: 2,
            cache_capacity: 16,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_embed_all_preserves_order() {
        let embedder = Arc::new(HashEmbedder::default());
        let batcher = EmbeddingBatcher::new(embedder.clone(), &config(2));

        let texts: Vec<String> = (0..5).map(|i| format!("text number {}", i)).collect();
        let out = batcher.embed_all(&texts).await;

        assert_eq!(out.len(), 5);
        for (text, v) in texts.iter().zip(&out) {
            assert_eq!(v.as_ref().unwrap(), &embedder.vector_for(text));
        }
    }

    #[tokio::test]
    async fn test_batch_failure_falls_back_to_serial() {
        let embedder = Arc::new(FailingBatchEmbedder::failing_on("poison"));
        let batcher = EmbeddingBatcher::new(embedder, &config(8));

        let texts = vec![
            "first".to_string(),
            "poison".to_string(),
            "third".to_string(),
        ];
        let out = batcher.embed_all(&texts).await;

        assert!(out[0].is_some());
        assert!(out[1].is_none());
        assert!(out[2].is_some());
    }

    #[tokio::test]
    async fn test_cache_avoids_second_call() {
        let embedder = Arc::new(HashEmbedder::default());
        let batcher = EmbeddingBatcher::new(embedder.clone(), &config(4));

        batcher.embed_one("cached text").await;
        batcher.embed_one("cached text").await;
        assert_eq!(embedder.calls(), 1);
    }
}
