//! Component wiring shared by the daemon and the CLI

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use hearth_core::embeddings::{Embedder, EmbeddingBatcher};
use hearth_core::llm::{CompletionProvider, CompletionRequest, LlmClient};
use hearth_core::scheduler::{DeliveryError, ItemHandler, ScheduledItem};
use hearth_core::{Gardener, HearthConfig, Storage};

use crate::provider::{HttpCompletionProvider, HttpEmbedder, UnconfiguredProvider};

const TASK_OPERATION: &str = "subagent_task";

const TASK_SYSTEM: &str = "You are a background assistant completing a task the user scheduled earlier. \
Do the work described and reply with the result the user should see.";

/// Value of `embedding.model` selecting the local fastembed model
pub const LOCAL_EMBED_MODEL: &str = "local";

/// Everything a tick needs
pub struct Runtime {
    pub config: HearthConfig,
    pub storage: Arc<Storage>,
    pub llm: LlmClient,
    pub embedder: Option<Arc<EmbeddingBatcher>>,
    pub gardener: Gardener,
}

impl Runtime {
    pub fn open(config: HearthConfig) -> anyhow::Result<Self> {
        let db_path = config.db_path();
        let storage = Arc::new(Storage::new(db_path).context("Failed to open the memory store")?);
        tracing::info!(path = %storage.path().display(), "Storage initialized");

        let provider: Arc<dyn CompletionProvider> = match config.llm.base_url {
            Some(_) => Arc::new(HttpCompletionProvider::new(&config.llm).context("Failed to build HTTP client")?),
            None => {
                tracing::warn!("No completion endpoint configured (HEARTH_LLM_URL); LLM stages will be skipped");
                Arc::new(UnconfiguredProvider)
            }
        };
        tracing::info!(model = provider.model_name(), "Completion provider ready");
        let llm = LlmClient::new(provider, storage.clone());

        let embedder = build_embedder(&config)?
            .map(|e| Arc::new(EmbeddingBatcher::new(e, &config.embedding)));
        if embedder.is_none() {
            tracing::info!("No embedding provider configured, dedup falls back to keyword matching");
        }

        let gardener = Gardener::new(storage.clone(), llm.clone(), embedder.clone(), &config);
        Ok(Self {
            config,
            storage,
            llm,
            embedder,
            gardener,
        })
    }

    /// Handler for claimed items
    pub fn handler(&self) -> LoggingHandler {
        LoggingHandler { llm: self.llm.clone() }
    }
}

fn build_embedder(config: &HearthConfig) -> anyhow::Result<Option<Arc<dyn Embedder>>> {
    let model = config.embedding.model.as_deref();

    if model == Some(LOCAL_EMBED_MODEL) {
        #[cfg(feature = "local-embeddings")]
        {
            let local = hearth_core::LocalEmbedder::new().context("Failed to load local embedding model")?;
            return Ok(Some(Arc::new(local)));
        }
        #[cfg(not(feature = "local-embeddings"))]
        anyhow::bail!("embedding.model = \"local\" needs the local-embeddings feature");
    }

    match (&config.llm.base_url, model) {
        (Some(_), Some(model)) => Ok(Some(Arc::new(
            HttpEmbedder::new(&config.llm, Some(model)).context("Failed to build HTTP client")?,
        ))),
        _ => Ok(None),
    }
}

/// Delivers nudges to the log and runs tasks through the completion
/// provider. Channel adapters replace this.
pub struct LoggingHandler {
    llm: LlmClient,
}

#[async_trait]
impl ItemHandler for LoggingHandler {
    async fn deliver(&self, item: &ScheduledItem) -> Result<(), DeliveryError> {
        tracing::info!(
            item_id = %item.id,
            user_id = %item.user_id,
            item_type = item.item_type.as_str(),
            message = %item.message,
            "Nudge delivered"
        );
        Ok(())
    }

    async fn run_task(&self, item: &ScheduledItem) -> Result<String, DeliveryError> {
        let mut prompt = format!("Task: {}\n", item.message);
        if !item.allowed_tools.is_empty() {
            prompt.push_str(&format!("Tools you may reference: {}\n", item.allowed_tools.join(", ")));
        }
        if let Some(context) = &item.context {
            prompt.push_str(&format!("Context: {}\n", context));
        }

        let request = CompletionRequest::new(TASK_OPERATION, TASK_SYSTEM, prompt);
        let result = self
            .llm
            .complete_text(&item.user_id, request)
            .await
            .map_err(|e| DeliveryError(e.to_string()))?;
        if result.trim().is_empty() {
            return Err(DeliveryError("empty task result".to_string()));
        }
        tracing::info!(item_id = %item.id, user_id = %item.user_id, "Task completed");
        Ok(result)
    }
}
