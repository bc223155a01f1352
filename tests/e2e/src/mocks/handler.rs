//! Item handler that records what it was given

use std::sync::Mutex;

use async_trait::async_trait;
use hearth_core::{DeliveryError, ItemHandler, ScheduledItem};

/// Records delivered nudges and finished tasks. Optionally fails every
/// delivery to exercise the release path.
#[derive(Default)]
pub struct RecordingHandler {
    delivered: Mutex<Vec<String>>,
    tasks: Mutex<Vec<String>>,
    failing: bool,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler whose every delivery and task fails
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Ids of delivered nudges, in delivery order
    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Ids of tasks run to completion
    pub fn tasks(&self) -> Vec<String> {
        self.tasks.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ItemHandler for RecordingHandler {
    async fn deliver(&self, item: &ScheduledItem) -> Result<(), DeliveryError> {
        if self.failing {
            return Err(DeliveryError("channel offline".to_string()));
        }
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push(item.id.clone());
        }
        Ok(())
    }

    async fn run_task(&self, item: &ScheduledItem) -> Result<String, DeliveryError> {
        if self.failing {
            return Err(DeliveryError("sub-agent unavailable".to_string()));
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(item.id.clone());
        }
        Ok(format!("Done: {}", item.message))
    }
}
