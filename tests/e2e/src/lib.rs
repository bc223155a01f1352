//! End-to-end test support for Hearth
//!
//! - `harness`: isolated on-disk stores and wired components
//! - `mocks`: scripted collaborators and seed data

pub mod harness;
pub mod mocks;

pub use harness::TestDatabaseManager;
pub use mocks::{RecordingHandler, TestDataFactory};
