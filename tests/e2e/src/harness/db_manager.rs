//! Test Database Manager
//!
//! Provides isolated stores for end-to-end tests:
//! - Temporary databases that are cleaned up on drop
//! - Extra handles on the same file, as separate processes would hold
//! - Components wired against a scripted completion provider

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hearth_core::config::{EmbeddingConfig, ReflectionConfig, StoreConfig};
use hearth_core::embeddings::EmbeddingBatcher;
use hearth_core::testing::{HashEmbedder, ScriptedProvider};
use hearth_core::{FactPipeline, Gardener, HearthConfig, LlmClient, ScheduleEngine, Storage};
use tempfile::TempDir;

/// Manager for test databases
///
/// Every manager owns its own temp directory, so tests never share state.
///
/// # Example
///
/// ```rust,ignore
/// let db = TestDatabaseManager::new_temp();
/// db.provider.respond("reflection", "{}");
/// let gardener = db.gardener();
/// ```
pub struct TestDatabaseManager {
    pub storage: Arc<Storage>,
    /// Provider behind every component built by this manager
    pub provider: Arc<ScriptedProvider>,
    pub config: HearthConfig,
    _temp_dir: TempDir,
    db_path: PathBuf,
}

impl TestDatabaseManager {
    /// Fresh store with a reflection workspace and default settings
    pub fn new_temp() -> Self {
        Self::with_config(HearthConfig::default())
    }

    /// Fresh store; `data_dir` and the reflection workspace are pointed at
    /// the temp directory
    pub fn with_config(mut config: HearthConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        config.store = StoreConfig {
            data_dir: Some(temp_dir.path().to_path_buf()),
            ..config.store
        };
        config.reflection = ReflectionConfig {
            workspace: Some(temp_dir.path().join("workspace")),
            ..config.reflection
        };

        let db_path = temp_dir.path().join(&config.store.db_file);
        let storage = Arc::new(Storage::new(Some(db_path.clone())).expect("Failed to create test storage"));

        Self {
            storage,
            provider: Arc::new(ScriptedProvider::new()),
            config,
            _temp_dir: temp_dir,
            db_path,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Reflection workspace inside the temp directory
    pub fn workspace(&self) -> PathBuf {
        self.config
            .reflection
            .workspace
            .clone()
            .expect("workspace is always set by the manager")
    }

    /// Second connection pool on the same database file
    pub fn open_another(&self) -> Arc<Storage> {
        Arc::new(Storage::new(Some(self.db_path.clone())).expect("Failed to reopen test storage"))
    }

    /// Client recording usage into this store
    pub fn llm(&self) -> LlmClient {
        LlmClient::new(self.provider.clone(), self.storage.clone())
    }

    pub fn batcher(&self) -> Arc<EmbeddingBatcher> {
        Arc::new(EmbeddingBatcher::new(
            Arc::new(HashEmbedder::default()),
            &EmbeddingConfig::default(),
        ))
    }

    pub fn scheduler(&self) -> ScheduleEngine {
        ScheduleEngine::new(self.storage.clone(), self.config.scheduler.clone())
    }

    pub fn pipeline(&self) -> FactPipeline {
        FactPipeline::new(
            self.storage.clone(),
            self.batcher(),
            self.llm(),
            self.config.dedup.clone(),
        )
    }

    pub fn gardener(&self) -> Gardener {
        Gardener::new(self.storage.clone(), self.llm(), Some(self.batcher()), &self.config)
    }
}
