//! Alert sinks used by the daemon.

use std::io::{self, Write};

use chrono::{DateTime, Local};
use tracing::{info, warn};

use quotawatch_core::AlertEvent;
use quotawatch_engine::{AlertSink, DispatchError};

/// Sends every alert to the tracing subscriber. Loud alerts log at WARN.
pub struct LogSink;

impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn dispatch(&mut self, event: &AlertEvent) -> Result<(), DispatchError> {
        if event.loud {
            warn!(entity = %event.entity_id, value = event.value, title = event.title(), "{event}");
        } else {
            info!(entity = %event.entity_id, value = event.value, title = event.title(), "{event}");
        }
        Ok(())
    }
}

/// Prints one human-readable line per alert. Loud alerts ring the
/// terminal bell.
pub struct ConsoleSink<W> {
    out: W,
}

impl ConsoleSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> AlertSink for ConsoleSink<W> {
    fn name(&self) -> &str {
        "console"
    }

    fn dispatch(&mut self, event: &AlertEvent) -> Result<(), DispatchError> {
        let ts = DateTime::from_timestamp(event.at as i64, 0)
            .unwrap_or_default()
            .with_timezone(&Local)
            .format("%H:%M:%S");
        let bell = if event.loud { "\x07" } else { "" };
        writeln!(self.out, "{bell}[{ts}] {}: {event}", event.title())
            .and_then(|()| self.out.flush())
            .map_err(|e| DispatchError::Failed {
                sink: self.name().to_string(),
                reason: e.to_string(),
            })
    }
}
