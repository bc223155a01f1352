//! # Hearth Core
//!
//! Persistent memory substrate for a personal assistant.
//!
//! - **Data Store**: SQLite (WAL, FTS5) holding memories, relations,
//!   profiles, sessions, the scheduled-item queue and usage records
//! - **Decay Engine**: importance-weighted prominence decay, archive and prune
//! - **Relation Graph**: typed UPDATES / EXTENDS / DERIVES edges; supersession
//!   is an edge, never a delete
//! - **Dedup & Classifier**: embedding dedup, forget and correction routing,
//!   one batched LLM classification call per message
//! - **Background Gardener**: light ticks for bookkeeping, a daily sleep tick
//!   in quiet hours for the dream cycle and self-reflection
//! - **Scheduled-Item Engine**: nudges and tasks with atomic claim, dedup,
//!   recurrence and a derived board view
//! - **Gap Pipeline**: a few proactive items per day, bounded by a dial
//!
//! Embedding and completion providers are external collaborators behind the
//! [`Embedder`] and [`CompletionProvider`] traits.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hearth_core::{HearthConfig, NewMemory, Storage};
//!
//! let config = HearthConfig::load(None)?;
//! let storage = Storage::new(config.db_path())?;
//!
//! let memory = storage.insert_memory(NewMemory::new("alice", "Prefers tea over coffee"))?;
//! let stats = storage.memory_stats("alice")?;
//! ```
//!
//! ## Feature Flags
//!
//! - `bundled-sqlite` (default): bundled SQLite
//! - `encryption`: SQLCipher, keyed by `HEARTH_ENCRYPTION_KEY`
//! - `local-embeddings`: fastembed provider running on the local CPU
//! - `testing`: scripted mock providers for downstream test crates

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod decay;
pub mod dedup;
pub mod embeddings;
pub mod gaps;
pub mod gardener;
pub mod jobs;
pub mod llm;
pub mod memory;
pub mod scheduler;
pub mod storage;
pub mod text;

/// Scripted providers for tests
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::{ConfigError, HearthConfig};

pub use memory::{
    LearnedFrom, MemoryCategory, MemoryEntry, MemoryFilter, MemoryRelation, MemorySource,
    MemoryStats, MemoryType, NewMemory, RelationDirection, RelationType,
};

pub use storage::{
    BehavioralPattern, ProfileEntry, ProfileScope, Result, Session, SessionMessage,
    SessionSummary, Storage, StorageError, SubagentRun, UsageTotals,
};

pub use decay::{DecayEngine, DecayReport};

pub use embeddings::{cosine_similarity, Embedder, EmbeddingBatcher, EmbeddingError};
#[cfg(feature = "local-embeddings")]
#[cfg_attr(docsrs, doc(cfg(feature = "local-embeddings")))]
pub use embeddings::LocalEmbedder;

pub use llm::{
    CompletionProvider, CompletionRequest, CompletionResponse, LlmClient, LlmError, NoopUsage,
    ParseOutcome, TokenUsage, UsageSink,
};

pub use dedup::{ExtractionOutcome, FactCandidate, FactPipeline, PipelineError};

pub use scheduler::{
    AddOutcome, BoardHold, BoardStatus, DeliveryError, ExecutionStatus, ItemHandler, ItemKind,
    NewScheduledItem, RunReport, ScheduleEngine, ScheduledItem,
};

pub use gardener::{Gardener, GardenerError, QuietHours, TickReport, TickState};

pub use gaps::{Dial, GapInput, GapPipeline, Signal, SignalKind};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        Dial, Embedder, FactCandidate, FactPipeline, Gardener, HearthConfig, LlmClient,
        MemoryCategory, MemoryEntry, MemoryFilter, NewMemory, NewScheduledItem, RelationType,
        Result, ScheduleEngine, Storage, StorageError,
    };
}
