//! Logging initialization against an existing global subscriber.
//!
//! Lives in its own test binary so the global default is not shared.

use tilevault_core::observability::{init_logging, LogFormat};

#[test]
fn keeps_an_already_installed_subscriber() {
    tracing::subscriber::set_global_default(tracing_subscriber::registry()).unwrap();

    init_logging(LogFormat::Json);

    assert!(tracing::dispatcher::get_default(|dispatch| {
        dispatch.is::<tracing_subscriber::Registry>()
    }));
}
