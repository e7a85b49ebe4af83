//! Alert delivery seam.

use quotawatch_core::AlertEvent;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("sink {sink} failed: {reason}")]
    Failed { sink: String, reason: String },
}

/// Receives every alert event the engines produce, in order.
///
/// A failing sink is logged and skipped; it never blocks other sinks or
/// the next tick.
pub trait AlertSink: Send {
    fn name(&self) -> &str;
    fn dispatch(&mut self, event: &AlertEvent) -> Result<(), DispatchError>;
}

/// Collects events in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: std::sync::Arc<std::sync::Mutex<Vec<AlertEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl AlertSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn dispatch(&mut self, event: &AlertEvent) -> Result<(), DispatchError> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}
