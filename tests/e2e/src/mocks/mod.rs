//! Scripted collaborators and seed data

mod fixtures;
mod handler;

pub use fixtures::{operations, TestDataFactory};
pub use handler::RecordingHandler;
