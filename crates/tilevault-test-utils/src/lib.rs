//! Shared test utilities for tilevault integration tests.
//!
//! This crate provides:
//! - [`RecordingHooks`]: Write hooks that record calls and inject failures
//! - [`RecordingLockSink`] / [`FailingSink`]: Diagnostics sinks for assertions
//! - [`TestContext`]: Temporary storage root with a wired subsystem
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use tilevault_test_utils::{RecordingHooks, TestContext};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let ctx = TestContext::new();
//!     let hooks = RecordingHooks::new();
//!     let outcome = ctx.subsystem.execute_atomic_write(ctx.request("/t"), &hooks).await;
//!     // ... assert ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod hooks;
pub mod sinks;

pub use assertions::*;
pub use fixtures::*;
pub use hooks::*;
pub use sinks::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tilevault_atomic=debug".parse().expect("valid directive"))
                .add_directive("tilevault_core=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
