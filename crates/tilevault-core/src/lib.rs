//! # tilevault-core
//!
//! Shared primitives for the tilevault atomic-write subsystem.
//!
//! - **Errors**: One error taxonomy and result alias for every component
//! - **Identifiers**: Path-safe project and map ids
//! - **Storage layout**: Canonical core / project / map locations and lock ids
//! - **Database abstraction**: Engine-agnostic connections, transactions and
//!   per-scope handles
//! - **Configuration and observability**: Environment-driven config and
//!   structured logging helpers
//!
//! ## Example
//!
//! ```rust
//! use tilevault_core::prelude::*;
//!
//! let layout = StorageLayout::new("/srv/tilevault");
//! let project = ProjectId::new("acme").unwrap();
//! let map = MapId::new("basemap").unwrap();
//!
//! assert!(layout.map_root(&project, &map).starts_with(layout.project_root(&project)));
//! assert_eq!(LockKeys::map(&project, &map), "map:acme:basemap");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod dal;
pub mod error;
pub mod id;
pub mod layout;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{Config, LockBackendKind, LockRetryConfig};
    pub use crate::dal::{
        CommandResult, DalCommand, DalCommandKind, DalConnection, DalConnectionExt, DalEngine,
        DalHandles, DalQuery, DalRow, DalScope, DalSession, DalValue, NoopDal, SqliteDal,
    };
    pub use crate::error::{Error, Result};
    pub use crate::id::{MapId, ProjectId};
    pub use crate::layout::{LockKeys, StorageLayout};
}

// Re-export key types at crate root for ergonomics
pub use config::{Config, LockBackendKind, LockRetryConfig};
pub use dal::{DalConnection, DalConnectionExt, DalEngine, DalHandles};
pub use error::{Error, Result};
pub use id::{MapId, ProjectId};
pub use layout::{LockKeys, StorageLayout};
pub use observability::{init_logging, LogFormat};
