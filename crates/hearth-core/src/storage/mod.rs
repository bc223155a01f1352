//! Storage Module
//!
//! SQLite-based storage layer with:
//! - WAL mode, separate reader/writer connections
//! - FTS5 keyword search with query sanitization
//! - Embedded vector storage with brute-force cosine search
//! - Relation graph, profiles, sessions, scheduled-item queue

mod migrations;
mod profiles;
mod relations;
mod scheduled;
mod sessions;
mod sqlite;
mod usage;

pub use migrations::MIGRATIONS;
pub use profiles::{BehavioralPattern, ProfileEntry, ProfileScope};
pub use sessions::{Session, SessionMessage, SessionSummary};
pub use sqlite::{Result, Storage, StorageError};
pub use usage::{SubagentRun, UsageTotals};
