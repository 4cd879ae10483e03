//! Canonical on-disk layout for tilevault storage.
//!
//! This module is the **single source of truth** for storage paths. Writers
//! must derive locations through [`StorageLayout`] and lock identifiers
//! through [`LockKeys`]; no path strings should be assembled elsewhere.
//!
//! # Path Layout
//!
//! ```text
//! {root}/
//! ├── core/
//! │   └── core.db
//! └── projects/
//!     └── {project_id}/
//!         ├── project.db
//!         ├── tmp/
//!         └── maps/
//!             └── {map_id}/
//!                 ├── map.db
//!                 ├── tiles/
//!                 ├── files/
//!                 └── tmp/
//! ```
//!
//! All functions are pure string composition; nothing here touches the
//! filesystem.

use std::path::{Path, PathBuf};

use crate::id::{MapId, ProjectId};

/// Canonical path generator rooted at a configured storage directory.
///
/// # Example
///
/// ```
/// use std::path::Path;
/// use tilevault_core::id::{MapId, ProjectId};
/// use tilevault_core::layout::StorageLayout;
///
/// let layout = StorageLayout::new("/srv/tilevault");
/// let project = ProjectId::new("p1").unwrap();
/// let map = MapId::new("m1").unwrap();
///
/// assert_eq!(layout.core_db_path(), Path::new("/srv/tilevault/core/core.db"));
/// assert_eq!(
///     layout.map_tiles_root(&project, &map),
///     Path::new("/srv/tilevault/projects/p1/maps/m1/tiles")
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    /// Directory holding the core-level database.
    pub const CORE_DIR: &'static str = "core";
    /// File name of the core-level database.
    pub const CORE_DB: &'static str = "core.db";
    /// Directory holding all projects.
    pub const PROJECTS_DIR: &'static str = "projects";
    /// File name of a project database.
    pub const PROJECT_DB: &'static str = "project.db";
    /// Directory holding a project's maps.
    pub const MAPS_DIR: &'static str = "maps";
    /// File name of a map database.
    pub const MAP_DB: &'static str = "map.db";
    /// Tile directory name inside a map.
    pub const TILES_DIR: &'static str = "tiles";
    /// Attached-file directory name inside a map.
    pub const FILES_DIR: &'static str = "files";
    /// Staging directory name for in-flight atomic writes.
    pub const TMP_DIR: &'static str = "tmp";

    /// Creates a layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    // =========================================================================
    // Core
    // =========================================================================

    /// Returns the core-level directory.
    #[must_use]
    pub fn core_root(&self) -> PathBuf {
        self.root.join(Self::CORE_DIR)
    }

    /// Returns the core-level database path: `core/core.db`.
    #[must_use]
    pub fn core_db_path(&self) -> PathBuf {
        self.core_root().join(Self::CORE_DB)
    }

    // =========================================================================
    // Projects
    // =========================================================================

    /// Returns a project's root: `projects/{project}`.
    #[must_use]
    pub fn project_root(&self, project: &ProjectId) -> PathBuf {
        self.root.join(Self::PROJECTS_DIR).join(project.as_str())
    }

    /// Returns a project's database path: `projects/{project}/project.db`.
    #[must_use]
    pub fn project_db_path(&self, project: &ProjectId) -> PathBuf {
        self.project_root(project).join(Self::PROJECT_DB)
    }

    /// Returns a project's staging root: `projects/{project}/tmp`.
    #[must_use]
    pub fn project_tmp_root(&self, project: &ProjectId) -> PathBuf {
        self.project_root(project).join(Self::TMP_DIR)
    }

    // =========================================================================
    // Maps
    // =========================================================================

    /// Returns a map's root: `projects/{project}/maps/{map}`.
    #[must_use]
    pub fn map_root(&self, project: &ProjectId, map: &MapId) -> PathBuf {
        self.project_root(project)
            .join(Self::MAPS_DIR)
            .join(map.as_str())
    }

    /// Returns a map's database path.
    #[must_use]
    pub fn map_db_path(&self, project: &ProjectId, map: &MapId) -> PathBuf {
        self.map_root(project, map).join(Self::MAP_DB)
    }

    /// Returns a map's tile root.
    #[must_use]
    pub fn map_tiles_root(&self, project: &ProjectId, map: &MapId) -> PathBuf {
        self.map_root(project, map).join(Self::TILES_DIR)
    }

    /// Returns a map's attached-file root.
    #[must_use]
    pub fn map_files_root(&self, project: &ProjectId, map: &MapId) -> PathBuf {
        self.map_root(project, map).join(Self::FILES_DIR)
    }

    /// Returns a map's staging root.
    #[must_use]
    pub fn map_tmp_root(&self, project: &ProjectId, map: &MapId) -> PathBuf {
        self.map_root(project, map).join(Self::TMP_DIR)
    }

    /// Returns a staging directory for one operation under a map's tmp root.
    #[must_use]
    pub fn map_operation_tmp_dir(
        &self,
        project: &ProjectId,
        map: &MapId,
        operation: &str,
    ) -> PathBuf {
        self.map_tmp_root(project, map).join(operation)
    }
}

/// Lock identifier conventions shared by every writer.
///
/// Lock ids are caller-defined strings; these helpers keep the common
/// scopes consistent so that a project-wide write and a map write agree on
/// what they are contending for.
pub struct LockKeys;

impl LockKeys {
    /// Prefix for project-wide locks.
    pub const PROJECT_PREFIX: &'static str = "project:";
    /// Prefix for map-level locks.
    pub const MAP_PREFIX: &'static str = "map:";
    /// Prefix for locks keyed by an atomic write's target path.
    pub const ATOMIC_PREFIX: &'static str = "atomic:";

    /// Returns `project:{project}`.
    #[must_use]
    pub fn project(project: &ProjectId) -> String {
        format!("{}{project}", Self::PROJECT_PREFIX)
    }

    /// Returns `map:{project}:{map}`.
    #[must_use]
    pub fn map(project: &ProjectId, map: &MapId) -> String {
        format!("{}{project}:{map}", Self::MAP_PREFIX)
    }

    /// Returns `atomic:{target_path}`.
    #[must_use]
    pub fn atomic(target_path: &str) -> String {
        format!("{}{target_path}", Self::ATOMIC_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (ProjectId, MapId) {
        (ProjectId::new("p1").unwrap(), MapId::new("m1").unwrap())
    }

    #[test]
    fn project_paths_are_nested_under_projects() {
        let layout = StorageLayout::new("/data");
        let (project, _) = ids();
        assert_eq!(layout.project_root(&project), Path::new("/data/projects/p1"));
        assert_eq!(
            layout.project_db_path(&project),
            Path::new("/data/projects/p1/project.db")
        );
        assert_eq!(
            layout.project_tmp_root(&project),
            Path::new("/data/projects/p1/tmp")
        );
    }

    #[test]
    fn map_paths_are_nested_under_their_project() {
        let layout = StorageLayout::new("/data");
        let (project, map) = ids();
        let map_root = layout.map_root(&project, &map);
        assert!(map_root.starts_with(layout.project_root(&project)));
        assert_eq!(
            layout.map_db_path(&project, &map),
            Path::new("/data/projects/p1/maps/m1/map.db")
        );
        assert_eq!(
            layout.map_files_root(&project, &map),
            Path::new("/data/projects/p1/maps/m1/files")
        );
        assert_eq!(
            layout.map_tmp_root(&project, &map),
            Path::new("/data/projects/p1/maps/m1/tmp")
        );
        assert_eq!(
            layout.map_operation_tmp_dir(&project, &map, "op-7"),
            Path::new("/data/projects/p1/maps/m1/tmp/op-7")
        );
    }

    #[test]
    fn lock_keys_follow_conventions() {
        let (project, map) = ids();
        assert_eq!(LockKeys::project(&project), "project:p1");
        assert_eq!(LockKeys::map(&project, &map), "map:p1:m1");
        assert_eq!(LockKeys::atomic("/maps/1/tiles/1"), "atomic:/maps/1/tiles/1");
    }
}
