// SPDX-License-Identifier: MIT OR Apache-2.0
//! awcp-workspace
#![deny(unsafe_code)]
//!
//! Executor-side work paths. One root directory owns every delegation's
//! work path; allocation is exclusive, paths are always direct children
//! of the root, and anything left over from a crash is swept at startup.
//!
//! Delegation ids arrive over the wire and are untrusted: they become
//! directory names only after the containment checks here.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Errors raised by the workspace manager.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// The id is empty, contains separators, or is a traversal attempt.
    #[error("invalid delegation id for work path: {id:?}")]
    InvalidId {
        /// The offending id.
        id: String,
    },

    /// The id already has a live allocation.
    #[error("work path already allocated for delegation {id}")]
    AlreadyAllocated {
        /// The offending id.
        id: String,
    },

    /// The resolved path does not lie under the configured root.
    #[error("work path escapes the work root: {path}")]
    OutsideRoot {
        /// The escaping path.
        path: PathBuf,
    },

    /// Refusing to prepare a non-empty directory.
    #[error("work path is not empty: {path}")]
    NotEmpty {
        /// The occupied path.
        path: PathBuf,
    },

    /// Underlying filesystem failure.
    #[error("workspace io error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// OS error.
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Allocates, prepares, and releases per-delegation work paths under a
/// single root.
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
    allocated: Mutex<HashSet<String>>,
}

impl WorkspaceManager {
    /// Create a manager rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Fails if the root cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| WorkspaceError::io(&root, e))?;
        Ok(Self {
            root,
            allocated: Mutex::new(HashSet::new()),
        })
    }

    /// The configured root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reserve `root/<id>` for a delegation without touching the disk.
    ///
    /// # Errors
    ///
    /// Rejects unsafe ids, double allocations, and paths that would land
    /// outside the root.
    pub fn allocate(&self, id: &str) -> Result<PathBuf, WorkspaceError> {
        validate_id(id)?;
        let path = self.root.join(id);
        self.validate(&path)?;

        let mut allocated = self.allocated.lock().unwrap_or_else(|e| e.into_inner());
        if !allocated.insert(id.to_string()) {
            return Err(WorkspaceError::AlreadyAllocated { id: id.to_string() });
        }
        debug!(target: "awcp.workspace", id, path = %path.display(), "allocated work path");
        Ok(path)
    }

    /// Enforce that `path` lies directly under the root.
    ///
    /// # Errors
    ///
    /// [`WorkspaceError::OutsideRoot`] otherwise.
    pub fn validate(&self, path: &Path) -> Result<(), WorkspaceError> {
        let ok = path.parent() == Some(self.root.as_path())
            && path
                .components()
                .all(|c| !matches!(c, Component::ParentDir));
        if ok {
            Ok(())
        } else {
            Err(WorkspaceError::OutsideRoot {
                path: path.to_path_buf(),
            })
        }
    }

    /// Create the work directory; refuses to reuse a non-empty one.
    ///
    /// # Errors
    ///
    /// [`WorkspaceError::NotEmpty`] if something already lives there, or an
    /// io error.
    pub fn prepare(&self, path: &Path) -> Result<(), WorkspaceError> {
        self.validate(path)?;
        std::fs::create_dir_all(path).map_err(|e| WorkspaceError::io(path, e))?;
        let mut entries =
            std::fs::read_dir(path).map_err(|e| WorkspaceError::io(path, e))?;
        if entries.next().is_some() {
            return Err(WorkspaceError::NotEmpty {
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Drop the allocation and delete the directory tree.
    ///
    /// Idempotent and fault-tolerant: a missing directory is fine, and a
    /// deletion failure is logged rather than raised so release can never
    /// mask the error that triggered it.
    pub fn release(&self, id: &str) {
        {
            let mut allocated = self.allocated.lock().unwrap_or_else(|e| e.into_inner());
            allocated.remove(id);
        }
        let path = self.root.join(id);
        if self.validate(&path).is_err() {
            warn!(target: "awcp.workspace", id, "refusing to release path outside root");
            return;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(()) => debug!(target: "awcp.workspace", id, "released work path"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(target: "awcp.workspace", id, error = %e, "failed to delete work path");
            }
        }
    }

    /// Delete every child directory with no live allocation, reclaiming
    /// space from prior crashes. Returns the number of directories removed.
    ///
    /// # Errors
    ///
    /// Fails only if the root cannot be listed; individual deletions are
    /// logged and skipped.
    pub fn cleanup_stale(&self) -> Result<usize, WorkspaceError> {
        let allocated = {
            let guard = self.allocated.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        let entries =
            std::fs::read_dir(&self.root).map_err(|e| WorkspaceError::io(&self.root, e))?;

        let mut removed = 0;
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(target: "awcp.workspace", error = %e, "skipping unreadable work root entry");
                    continue;
                }
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if allocated.contains(name) {
                continue;
            }
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    debug!(target: "awcp.workspace", stale = name, "swept stale work path");
                    removed += 1;
                }
                Err(e) => {
                    warn!(target: "awcp.workspace", stale = name, error = %e, "failed to sweep stale work path");
                }
            }
        }
        Ok(removed)
    }

    /// Number of live allocations.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.allocated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

fn validate_id(id: &str) -> Result<(), WorkspaceError> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains('/')
        || id.contains('\\')
        || id.contains('\0');
    if bad {
        return Err(WorkspaceError::InvalidId { id: id.to_string() });
    }
    Ok(())
}
