//! Lazily opened, cached connections per logical scope.
//!
//! Each scope of the storage layout (core, project, map) has its own
//! database. [`DalHandles`] opens a scope's connection on first use and hands
//! out the same `Arc` afterwards.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{DalConnection, DalEngine, NoopDal, SqliteDal};
use crate::error::{Error, Result};
use crate::id::{MapId, ProjectId};
use crate::layout::StorageLayout;

/// A logical database scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DalScope {
    /// The core-level database.
    Core,
    /// A project database.
    Project(ProjectId),
    /// A map database nested in a project.
    Map(ProjectId, MapId),
}

impl DalScope {
    /// Returns the database file for this scope under `layout`.
    #[must_use]
    pub fn db_path(&self, layout: &StorageLayout) -> PathBuf {
        match self {
            Self::Core => layout.core_db_path(),
            Self::Project(project) => layout.project_db_path(project),
            Self::Map(project, map) => layout.map_db_path(project, map),
        }
    }
}

impl fmt::Display for DalScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Core => f.write_str("core"),
            Self::Project(project) => write!(f, "project:{project}"),
            Self::Map(project, map) => write!(f, "map:{project}:{map}"),
        }
    }
}

/// Opens a connection for a scope given its database path.
pub type DalOpener =
    Arc<dyn Fn(&DalScope, &Path) -> Result<Arc<dyn DalConnection>> + Send + Sync>;

/// Cache of per-scope connections.
pub struct DalHandles {
    layout: StorageLayout,
    engine: DalEngine,
    opener: DalOpener,
    cache: Mutex<HashMap<DalScope, Arc<dyn DalConnection>>>,
}

impl fmt::Debug for DalHandles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DalHandles")
            .field("layout", &self.layout)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl DalHandles {
    /// Creates handles for one of the built-in engines.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for [`DalEngine::External`]; use
    /// [`DalHandles::with_opener`] to plug in an outside engine.
    pub fn new(layout: StorageLayout, engine: DalEngine) -> Result<Self> {
        let opener: DalOpener = match engine {
            DalEngine::Noop => Arc::new(|_scope: &DalScope, _path: &Path| {
                Ok(Arc::new(NoopDal::new()) as Arc<dyn DalConnection>)
            }),
            DalEngine::Sqlite => Arc::new(|_scope: &DalScope, path: &Path| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::io(parent.display(), e))?;
                }
                Ok(Arc::new(SqliteDal::open(path)?) as Arc<dyn DalConnection>)
            }),
            DalEngine::External => {
                return Err(Error::Configuration(
                    "external DAL engines must be supplied with an opener".into(),
                ))
            }
        };
        Ok(Self::with_opener(layout, engine, opener))
    }

    /// Creates handles backed by a caller-supplied opener.
    #[must_use]
    pub fn with_opener(layout: StorageLayout, engine: DalEngine, opener: DalOpener) -> Self {
        Self {
            layout,
            engine,
            opener,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the engine behind these handles.
    #[must_use]
    pub const fn engine(&self) -> DalEngine {
        self.engine
    }

    /// Returns the storage layout used to place database files.
    #[must_use]
    pub const fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Returns the core-level connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be opened.
    pub fn core(&self) -> Result<Arc<dyn DalConnection>> {
        self.handle(DalScope::Core)
    }

    /// Returns a project connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be opened.
    pub fn project(&self, project: &ProjectId) -> Result<Arc<dyn DalConnection>> {
        self.handle(DalScope::Project(project.clone()))
    }

    /// Returns a map connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be opened.
    pub fn map(&self, project: &ProjectId, map: &MapId) -> Result<Arc<dyn DalConnection>> {
        self.handle(DalScope::Map(project.clone(), map.clone()))
    }

    /// Returns the connection for `scope`, opening it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be opened.
    pub fn handle(&self, scope: DalScope) -> Result<Arc<dyn DalConnection>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| Error::internal("lock poisoned"))?;
        if let Some(existing) = cache.get(&scope) {
            return Ok(Arc::clone(existing));
        }

        let path = scope.db_path(&self.layout);
        let conn = (self.opener)(&scope, &path)?;
        tracing::debug!(%scope, engine = %self.engine, path = %path.display(), "opened DAL handle");
        cache.insert(scope, Arc::clone(&conn));
        Ok(conn)
    }

    /// Number of scopes opened so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.cache.lock().map_or(0, |cache| cache.len())
    }
}
