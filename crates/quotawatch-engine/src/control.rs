//! The external override control.
//!
//! A single boolean the operator can flip to skip phase A reminders, and
//! which the quota engine writes back when it changes phase. On disk it
//! is a file holding `0` or `1`.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("override value {0:?} is neither 0 nor 1")]
    Malformed(String),

    #[error("override file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Read/write access to the override flag.
pub trait ControlPort: Send {
    fn read(&mut self) -> Result<bool, ControlError>;
    fn write(&mut self, value: bool) -> Result<(), ControlError>;
}

fn parse_flag(raw: &str) -> Result<bool, ControlError> {
    match raw.trim() {
        "" | "0" => Ok(false),
        "1" => Ok(true),
        other => Err(ControlError::Malformed(other.to_string())),
    }
}

fn render_flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

/// Override flag backed by a file. An absent file reads as `0`.
pub struct FileControlPort {
    path: PathBuf,
}

impl FileControlPort {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_err(&self, source: io::Error) -> ControlError {
        ControlError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl ControlPort for FileControlPort {
    fn read(&mut self) -> Result<bool, ControlError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => parse_flag(&raw),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn write(&mut self, value: bool) -> Result<(), ControlError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        fs::write(&self.path, render_flag(value)).map_err(|e| self.io_err(e))
    }
}

/// In-memory override flag. Clones share the same value, so a test can
/// keep a handle while the scheduler owns the port.
#[derive(Clone, Default)]
pub struct MemoryControlPort {
    raw: Arc<Mutex<String>>,
}

impl MemoryControlPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the raw contents, as an operator editing the file would.
    pub fn set_raw(&self, raw: &str) {
        *self.raw.lock().unwrap_or_else(PoisonError::into_inner) = raw.to_string();
    }

    pub fn raw(&self) -> String {
        self.raw.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ControlPort for MemoryControlPort {
    fn read(&mut self) -> Result<bool, ControlError> {
        parse_flag(&self.raw())
    }

    fn write(&mut self, value: bool) -> Result<(), ControlError> {
        self.set_raw(render_flag(value));
        Ok(())
    }
}

/// Wraps a port so that read failures never stall the loop: a bad read
/// falls back to the last good value.
pub struct OverrideChannel {
    port: Box<dyn ControlPort>,
    last_good: bool,
}

impl OverrideChannel {
    pub fn new(port: impl ControlPort + 'static) -> Self {
        Self {
            port: Box::new(port),
            last_good: false,
        }
    }

    pub fn read(&mut self) -> bool {
        match self.port.read() {
            Ok(value) => {
                self.last_good = value;
                value
            }
            Err(e) => {
                warn!(error = %e, fallback = self.last_good, "failed to read override, using last value");
                self.last_good
            }
        }
    }

    /// Returns whether the write went through.
    pub fn write(&mut self, value: bool) -> bool {
        match self.port.write(value) {
            Ok(()) => {
                self.last_good = value;
                true
            }
            Err(e) => {
                warn!(error = %e, value, "failed to write override");
                false
            }
        }
    }
}
