//! Observability infrastructure for tilevault.
//!
//! Structured logging with consistent spans. Components log through the
//! `tracing` macros; binaries and test harnesses install a subscriber once
//! with [`init_logging`].

use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Error, Result};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(Error::Configuration(format!(
                "unsupported log format '{other}' (expected json or pretty)"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `tilevault_atomic=debug`)
///
/// # Example
///
/// ```rust
/// use tilevault_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(env_filter);
        let installed = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        };
        if let Err(e) = installed {
            tracing::debug!(error = %e, "global subscriber already installed; keeping it");
        }
    });
}

/// Creates a span for one atomic write with standard fields.
///
/// # Example
///
/// ```rust
/// use tilevault_core::observability::atomic_write_span;
///
/// let span = atomic_write_span("tile_write", "/maps/1/tiles/1", "svc");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn atomic_write_span(op_type: &str, target_path: &str, author: &str) -> Span {
    tracing::info_span!(
        "atomic_write",
        op_type = op_type,
        target = target_path,
        author = author,
    )
}

/// Creates a span for a lock-manager call.
#[must_use]
pub fn lock_span(operation: &str, lock_id: &str, owner: &str) -> Span {
    tracing::debug_span!("lock", op = operation, lock_id = lock_id, owner = owner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = atomic_write_span("tile_write", "/maps/1", "svc");
        let _guard = span.enter();
        let inner = lock_span("acquire", "atomic:/maps/1", "svc");
        let _inner = inner.enter();
        tracing::info!("inside spans");
    }

    #[test]
    fn log_format_parses() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
