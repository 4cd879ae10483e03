//! Diagnostics sinks for assertions.

use std::sync::{Arc, Mutex};

use tilevault_atomic::diagnostics::{AtomicWriteDiagnostics, DiagnosticsSink};
use tilevault_atomic::lock::{LockDiagnosticEvent, LockDiagnosticsSink};
use tilevault_core::error::{Error, Result};

/// Collects lock diagnostic events.
#[derive(Debug, Clone, Default)]
pub struct RecordingLockSink {
    events: Arc<Mutex<Vec<LockDiagnosticEvent>>>,
}

impl RecordingLockSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<LockDiagnosticEvent> {
        self.events.lock().expect("lock").clone()
    }
}

impl LockDiagnosticsSink for RecordingLockSink {
    fn record(&self, event: &LockDiagnosticEvent) -> Result<()> {
        self.events.lock().expect("lock").push(event.clone());
        Ok(())
    }
}

/// A sink that rejects everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingSink;

impl LockDiagnosticsSink for FailingSink {
    fn record(&self, _event: &LockDiagnosticEvent) -> Result<()> {
        Err(Error::internal("diagnostics sink unavailable"))
    }
}

impl DiagnosticsSink for FailingSink {
    fn record(&self, _entry: AtomicWriteDiagnostics) -> Result<()> {
        Err(Error::internal("diagnostics sink unavailable"))
    }
}
