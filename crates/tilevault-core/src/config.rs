//! Subsystem configuration.
//!
//! Values come from [`Config::default`] and may be overridden from the
//! environment with [`Config::from_env`]. Call [`Config::validate`] before
//! wiring anything from a configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dal::{validate_identifier, DalEngine};
use crate::error::{Error, Result};
use crate::observability::LogFormat;

/// Default table for durable leases.
pub const DEFAULT_LOCK_TABLE: &str = "dal_locks";

/// Default ring-buffer capacity for operation diagnostics.
pub const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 1000;

/// Which lock manager backend to build.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LockBackendKind {
    /// In-process map (tests/tooling, single process only).
    #[default]
    Memory,
    /// Transactional table reached through the DAL.
    Durable,
}

impl std::str::FromStr for LockBackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Self::Memory),
            "durable" | "database" | "db" => Ok(Self::Durable),
            other => Err(Error::Configuration(format!(
                "unsupported lock backend '{other}' (expected memory or durable)"
            ))),
        }
    }
}

/// Retry budget for lock acquisition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRetryConfig {
    /// Total acquisition attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 25,
            max_delay_ms: 500,
        }
    }
}

/// Configuration for the atomic-write subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Root directory of the storage layout.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Database engine behind the DAL handles.
    #[serde(default = "default_dal_engine")]
    pub dal_engine: DalEngine,

    /// Lock manager backend.
    #[serde(default)]
    pub lock_backend: LockBackendKind,

    /// Table used by the durable lock backend.
    #[serde(default = "default_lock_table")]
    pub lock_table: String,

    /// Lease duration for write locks taken by the executor, in milliseconds.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Lock acquisition retry budget.
    #[serde(default)]
    pub lock_retry: LockRetryConfig,

    /// Ring-buffer capacity for operation diagnostics.
    #[serde(default = "default_diagnostics_capacity")]
    pub diagnostics_capacity: usize,

    /// Minimum age before a finished tmp directory may be deleted, in seconds.
    #[serde(default = "default_cleanup_safety_window_secs")]
    pub cleanup_safety_window_secs: u64,

    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data")
}

const fn default_dal_engine() -> DalEngine {
    DalEngine::Noop
}

fn default_lock_table() -> String {
    DEFAULT_LOCK_TABLE.to_string()
}

const fn default_lease_ttl_ms() -> u64 {
    30_000
}

const fn default_diagnostics_capacity() -> usize {
    DEFAULT_DIAGNOSTICS_CAPACITY
}

const fn default_cleanup_safety_window_secs() -> u64 {
    24 * 60 * 60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            dal_engine: default_dal_engine(),
            lock_backend: LockBackendKind::default(),
            lock_table: default_lock_table(),
            lease_ttl_ms: default_lease_ttl_ms(),
            lock_retry: LockRetryConfig::default(),
            diagnostics_capacity: default_diagnostics_capacity(),
            cleanup_safety_window_secs: default_cleanup_safety_window_secs(),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `TILEVAULT_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(root) = env_string("TILEVAULT_STORAGE_ROOT") {
            config.storage_root = PathBuf::from(root);
        }
        if let Some(engine) = env_string("TILEVAULT_DAL_ENGINE") {
            config.dal_engine = engine.parse()?;
        }
        if let Some(backend) = env_string("TILEVAULT_LOCK_BACKEND") {
            config.lock_backend = backend.parse()?;
        }
        if let Some(table) = env_string("TILEVAULT_LOCK_TABLE") {
            config.lock_table = table;
        }
        if let Some(ttl) = env_u64("TILEVAULT_LEASE_TTL_MS")? {
            config.lease_ttl_ms = ttl;
        }
        if let Some(attempts) = env_u64("TILEVAULT_LOCK_MAX_ATTEMPTS")? {
            config.lock_retry.max_attempts = u32::try_from(attempts).map_err(|_| {
                Error::Configuration(format!(
                    "TILEVAULT_LOCK_MAX_ATTEMPTS is out of range: {attempts}"
                ))
            })?;
        }
        if let Some(delay) = env_u64("TILEVAULT_LOCK_INITIAL_DELAY_MS")? {
            config.lock_retry.initial_delay_ms = delay;
        }
        if let Some(delay) = env_u64("TILEVAULT_LOCK_MAX_DELAY_MS")? {
            config.lock_retry.max_delay_ms = delay;
        }
        if let Some(capacity) = env_u64("TILEVAULT_DIAGNOSTICS_CAPACITY")? {
            config.diagnostics_capacity = usize::try_from(capacity).map_err(|_| {
                Error::Configuration(format!(
                    "TILEVAULT_DIAGNOSTICS_CAPACITY is out of range: {capacity}"
                ))
            })?;
        }
        if let Some(window) = env_u64("TILEVAULT_CLEANUP_SAFETY_WINDOW_SECS")? {
            config.cleanup_safety_window_secs = window;
        }
        if let Some(format) = env_string("TILEVAULT_LOG_FORMAT") {
            config.log_format = format.parse()?;
        }

        Ok(config)
    }

    /// Checks that the configuration can be wired.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when:
    /// - the durable lock backend is paired with the no-op engine
    /// - the lock table is not a plain SQL identifier
    /// - the retry budget allows zero attempts or its delays are inverted
    /// - the lease TTL is zero
    pub fn validate(&self) -> Result<()> {
        if self.lock_backend == LockBackendKind::Durable && self.dal_engine == DalEngine::Noop {
            return Err(Error::Configuration(
                "durable lock backend requires a database engine (TILEVAULT_DAL_ENGINE)".into(),
            ));
        }
        validate_identifier(&self.lock_table)?;
        if self.lock_retry.max_attempts == 0 {
            return Err(Error::Configuration(
                "lock retry budget must allow at least one attempt".into(),
            ));
        }
        if self.lock_retry.initial_delay_ms > self.lock_retry.max_delay_ms {
            return Err(Error::Configuration(format!(
                "initial lock delay ({}ms) exceeds the cap ({}ms)",
                self.lock_retry.initial_delay_ms, self.lock_retry.max_delay_ms
            )));
        }
        if self.lease_ttl_ms == 0 {
            return Err(Error::Configuration("lease TTL must be positive".into()));
        }
        Ok(())
    }

    /// Returns the write-lock lease duration.
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// Returns the tmp-directory cleanup safety window.
    #[must_use]
    pub const fn cleanup_safety_window(&self) -> Duration {
        Duration::from_secs(self.cleanup_safety_window_secs)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    env_string(name)
        .map(|value| {
            value.parse::<u64>().map_err(|e| {
                Error::Configuration(format!("{name} must be an unsigned integer: {e}"))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.lock_table, "dal_locks");
        assert_eq!(config.lock_retry.max_attempts, 5);
        assert_eq!(config.lock_retry.initial_delay_ms, 25);
        assert_eq!(config.lock_retry.max_delay_ms, 500);
        assert_eq!(config.diagnostics_capacity, 1000);
        assert_eq!(config.lease_ttl(), Duration::from_secs(30));
        assert_eq!(config.cleanup_safety_window(), Duration::from_secs(86_400));
        config.validate().unwrap();
    }

    #[test]
    fn durable_locks_need_a_database() {
        let config = Config {
            lock_backend: LockBackendKind::Durable,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let config = Config {
            lock_backend: LockBackendKind::Durable,
            dal_engine: DalEngine::Sqlite,
            ..Config::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn rejects_inverted_delays_and_bad_tables() {
        let mut config = Config::default();
        config.lock_retry.initial_delay_ms = 1000;
        assert!(config.validate().is_err());

        let config = Config {
            lock_table: "locks;--".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: Config =
            serde_json::from_str(r#"{"lock_backend":"durable","dal_engine":"sqlite"}"#).unwrap();
        assert_eq!(config.lock_backend, LockBackendKind::Durable);
        assert_eq!(config.dal_engine, DalEngine::Sqlite);
        assert_eq!(config.lock_table, DEFAULT_LOCK_TABLE);
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("memory".parse::<LockBackendKind>().unwrap(), LockBackendKind::Memory);
        assert_eq!("DB".parse::<LockBackendKind>().unwrap(), LockBackendKind::Durable);
        assert!("redis".parse::<LockBackendKind>().is_err());
    }
}
