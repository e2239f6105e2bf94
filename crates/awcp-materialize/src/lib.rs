// SPDX-License-Identifier: MIT OR Apache-2.0
//! awcp-materialize
#![deny(unsafe_code)]
//!
//! Builds the Delegator's export tree: one directory per resource under
//! the export root, a `.awcp/manifest.json` describing what was shipped,
//! and the reverse path (`sync_back`) that folds applied snapshot state
//! from the export tree back into the rw resource sources.
//!
//! A failed materialization removes everything it wrote; admission
//! refusals never leave a half-built export behind.

use awcp_core::{AccessMode, Resource, PROTOCOL_VERSION};
use awcp_glob::{is_skipped_dir, SelectionRules};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Directory under the export root holding AWCP metadata.
pub const MANIFEST_DIR: &str = ".awcp";
/// Manifest file name inside [`MANIFEST_DIR`].
pub const MANIFEST_FILE: &str = "manifest.json";

/// Errors raised while building or reversing an export tree.
#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    /// Two resources share a name.
    #[error("duplicate resource name: {name}")]
    DuplicateResource {
        /// The repeated name.
        name: String,
    },

    /// A resource's source directory does not exist.
    #[error("resource {name}: source not found: {path}")]
    SourceMissing {
        /// Resource name.
        name: String,
        /// Missing source path.
        path: PathBuf,
    },

    /// A resource's include/exclude patterns failed to compile.
    #[error("resource {name}: {reason}")]
    InvalidRules {
        /// Resource name.
        name: String,
        /// Compile failure detail.
        reason: String,
    },

    /// The export tree has no readable manifest.
    #[error("export manifest unreadable: {reason}")]
    ManifestInvalid {
        /// Decode failure detail.
        reason: String,
    },

    /// Underlying filesystem failure.
    #[error("materialize io error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// OS error.
        #[source]
        source: std::io::Error,
    },
}

impl MaterializeError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// One resource line in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Resource name (top-level directory under the export root).
    pub name: String,
    /// Declared access mode.
    pub mode: AccessMode,
}

/// `.awcp/manifest.json` — written at materialization, verified by the
/// Executor after transport setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportManifest {
    /// Protocol version the export was built for.
    pub protocol_version: String,
    /// Owning delegation.
    pub delegation_id: String,
    /// Materialization time.
    pub created_at: DateTime<Utc>,
    /// Shipped resources with their declared modes.
    pub resources: Vec<ManifestEntry>,
}

/// Read and decode the manifest under `export_root`.
///
/// # Errors
///
/// [`MaterializeError::ManifestInvalid`] when missing or undecodable.
pub fn read_manifest(export_root: &Path) -> Result<ExportManifest, MaterializeError> {
    let path = export_root.join(MANIFEST_DIR).join(MANIFEST_FILE);
    let raw = std::fs::read_to_string(&path).map_err(|e| MaterializeError::ManifestInvalid {
        reason: format!("{}: {e}", path.display()),
    })?;
    serde_json::from_str(&raw).map_err(|e| MaterializeError::ManifestInvalid {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Materialization
// ---------------------------------------------------------------------------

/// Build `export_root/<resource>/…` for every resource and write the
/// manifest. On any failure the partially-built tree is removed first.
///
/// # Errors
///
/// Duplicate names, missing sources, invalid glob rules, or io failures.
pub fn materialize_export(
    delegation_id: &str,
    resources: &[Resource],
    export_root: &Path,
) -> Result<(), MaterializeError> {
    let mut seen = std::collections::BTreeSet::new();
    for r in resources {
        if !seen.insert(r.name.as_str()) {
            return Err(MaterializeError::DuplicateResource {
                name: r.name.clone(),
            });
        }
    }

    let result = build_tree(delegation_id, resources, export_root);
    if result.is_err() {
        remove_export(export_root);
    }
    result
}

fn build_tree(
    delegation_id: &str,
    resources: &[Resource],
    export_root: &Path,
) -> Result<(), MaterializeError> {
    std::fs::create_dir_all(export_root).map_err(|e| MaterializeError::io(export_root, e))?;

    for resource in resources {
        let source = PathBuf::from(&resource.source);
        if !source.is_dir() {
            return Err(MaterializeError::SourceMissing {
                name: resource.name.clone(),
                path: source,
            });
        }
        let rules = SelectionRules::compile(&resource.include, &resource.exclude).map_err(
            |e| MaterializeError::InvalidRules {
                name: resource.name.clone(),
                reason: e.to_string(),
            },
        )?;
        let dest = export_root.join(&resource.name);
        debug!(
            target: "awcp.materialize",
            resource = %resource.name,
            source = %source.display(),
            dest = %dest.display(),
            "materializing resource"
        );
        copy_tree(&source, &dest, &rules)?;
    }

    let manifest = ExportManifest {
        protocol_version: PROTOCOL_VERSION.into(),
        delegation_id: delegation_id.into(),
        created_at: Utc::now(),
        resources: resources
            .iter()
            .map(|r| ManifestEntry {
                name: r.name.clone(),
                mode: r.mode,
            })
            .collect(),
    };
    let meta_dir = export_root.join(MANIFEST_DIR);
    std::fs::create_dir_all(&meta_dir).map_err(|e| MaterializeError::io(&meta_dir, e))?;
    let manifest_path = meta_dir.join(MANIFEST_FILE);
    let json = serde_json::to_vec_pretty(&manifest).map_err(|e| {
        MaterializeError::ManifestInvalid {
            reason: e.to_string(),
        }
    })?;
    std::fs::write(&manifest_path, json).map_err(|e| MaterializeError::io(&manifest_path, e))?;

    Ok(())
}

/// Copy `src_root` into `dest_root`, honoring selection rules and the
/// conventional skip list. Symlinks are not followed.
fn copy_tree(
    src_root: &Path,
    dest_root: &Path,
    rules: &SelectionRules,
) -> Result<(), MaterializeError> {
    let walker = WalkDir::new(src_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.file_name().to_str().is_some_and(is_skipped_dir))
        });

    for entry in walker {
        let entry = entry.map_err(|e| MaterializeError::Io {
            path: src_root.to_path_buf(),
            source: e.into(),
        })?;
        let path = entry.path();
        let rel = path.strip_prefix(src_root).unwrap_or(path);
        if rel.as_os_str().is_empty() {
            continue;
        }

        if entry.file_type().is_dir() {
            // Directories are created lazily for the files they contain so
            // an excluded subtree leaves no empty shell behind.
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        if !rules.decide(rel).is_selected() {
            continue;
        }

        let dest_path = dest_root.join(rel);
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MaterializeError::io(parent, e))?;
        }
        std::fs::copy(path, &dest_path).map_err(|e| MaterializeError::io(&dest_path, e))?;
    }

    Ok(())
}

/// Remove the per-delegation export tree. Missing trees and deletion
/// failures are logged, never raised — removal runs on cleanup paths.
pub fn remove_export(export_root: &Path) {
    match std::fs::remove_dir_all(export_root) {
        Ok(()) => debug!(target: "awcp.materialize", root = %export_root.display(), "removed export tree"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(target: "awcp.materialize", root = %export_root.display(), error = %e, "failed to remove export tree");
        }
    }
}

// ---------------------------------------------------------------------------
// Sync-back
// ---------------------------------------------------------------------------

/// Files propagated by one [`sync_back`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Files copied from the export tree into resource sources.
    pub files_copied: u64,
}

/// Fold applied snapshot state from the export tree back into the sources
/// of the given resources. Read-only resources must not be passed here;
/// the function copies every selected file it finds.
///
/// Deletions are not propagated: a snapshot is a whole materialization,
/// and files absent from it are left untouched at the source.
///
/// # Errors
///
/// Invalid glob rules or io failures.
pub fn sync_back(
    export_root: &Path,
    rw_resources: &[Resource],
) -> Result<SyncStats, MaterializeError> {
    let mut stats = SyncStats::default();

    for resource in rw_resources {
        debug_assert!(resource.mode.is_writable());
        let staged = export_root.join(&resource.name);
        if !staged.is_dir() {
            continue;
        }
        let rules = SelectionRules::compile(&resource.include, &resource.exclude).map_err(
            |e| MaterializeError::InvalidRules {
                name: resource.name.clone(),
                reason: e.to_string(),
            },
        )?;
        let source = PathBuf::from(&resource.source);

        for entry in WalkDir::new(&staged).follow_links(false) {
            let entry = entry.map_err(|e| MaterializeError::Io {
                path: staged.clone(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&staged).unwrap_or(entry.path());
            if !rules.decide(rel).is_selected() {
                continue;
            }
            let dest = source.join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MaterializeError::io(parent, e))?;
            }
            std::fs::copy(entry.path(), &dest)
                .map_err(|e| MaterializeError::io(&dest, e))?;
            stats.files_copied += 1;
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use awcp_core::Resource;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn materialize_copies_each_resource_under_its_name() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("proj");
        write(&src.join("main.rs"), "fn main() {}");
        write(&src.join("docs/guide.md"), "# guide");

        let export = tmp.path().join("export");
        let resources = vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)];
        materialize_export("d-1", &resources, &export).unwrap();

        assert_eq!(
            std::fs::read_to_string(export.join("ws/main.rs")).unwrap(),
            "fn main() {}"
        );
        assert!(export.join("ws/docs/guide.md").is_file());
    }

    #[test]
    fn manifest_records_version_and_modes() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("proj");
        write(&src.join("f"), "x");

        let export = tmp.path().join("export");
        let resources = vec![
            Resource::fs("code", src.display().to_string(), AccessMode::Rw),
            Resource::fs("data", src.display().to_string(), AccessMode::Ro),
        ];
        materialize_export("d-7", &resources, &export).unwrap();

        let manifest = read_manifest(&export).unwrap();
        assert_eq!(manifest.protocol_version, PROTOCOL_VERSION);
        assert_eq!(manifest.delegation_id, "d-7");
        assert_eq!(manifest.resources.len(), 2);
        assert_eq!(manifest.resources[1].mode, AccessMode::Ro);
    }

    #[test]
    fn selection_rules_filter_the_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("proj");
        write(&src.join("src/lib.rs"), "pub fn f() {}");
        write(&src.join("build.log"), "noise");

        let export = tmp.path().join("export");
        let mut resource = Resource::fs("ws", src.display().to_string(), AccessMode::Rw);
        resource.exclude = vec!["*.log".into()];
        materialize_export("d-1", &[resource], &export).unwrap();

        assert!(export.join("ws/src/lib.rs").is_file());
        assert!(!export.join("ws/build.log").exists());
    }

    #[test]
    fn skip_dirs_never_ship() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("proj");
        write(&src.join(".git/HEAD"), "ref: x");
        write(&src.join("node_modules/pkg/index.js"), "x");
        write(&src.join("kept.txt"), "x");

        let export = tmp.path().join("export");
        let resources = vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)];
        materialize_export("d-1", &resources, &export).unwrap();

        assert!(export.join("ws/kept.txt").is_file());
        assert!(!export.join("ws/.git").exists());
        assert!(!export.join("ws/node_modules").exists());
    }

    #[test]
    fn missing_source_rolls_back_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let good = tmp.path().join("good");
        write(&good.join("f"), "x");

        let export = tmp.path().join("export");
        let resources = vec![
            Resource::fs("a", good.display().to_string(), AccessMode::Rw),
            Resource::fs("b", tmp.path().join("absent").display().to_string(), AccessMode::Rw),
        ];
        let err = materialize_export("d-1", &resources, &export).unwrap_err();
        assert!(matches!(err, MaterializeError::SourceMissing { .. }));
        assert!(!export.exists(), "partial export must be rolled back");
    }

    #[test]
    fn duplicate_resource_names_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("proj");
        write(&src.join("f"), "x");
        let resources = vec![
            Resource::fs("ws", src.display().to_string(), AccessMode::Rw),
            Resource::fs("ws", src.display().to_string(), AccessMode::Ro),
        ];
        let err =
            materialize_export("d-1", &resources, &tmp.path().join("export")).unwrap_err();
        assert!(matches!(err, MaterializeError::DuplicateResource { .. }));
    }

    #[test]
    fn remove_export_tolerates_missing_tree() {
        let tmp = tempfile::tempdir().unwrap();
        remove_export(&tmp.path().join("never-existed"));
    }

    #[test]
    fn sync_back_copies_rw_changes_to_source() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("proj");
        write(&src.join("greeting.txt"), "hello\n");

        let export = tmp.path().join("export");
        let resources = vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)];
        materialize_export("d-1", &resources, &export).unwrap();

        // Simulate an applied snapshot: the export copy gained a line and a file.
        write(&export.join("ws/greeting.txt"), "hello\nhi\n");
        write(&export.join("ws/new.txt"), "fresh");

        let stats = sync_back(&export, &resources).unwrap();
        assert_eq!(stats.files_copied, 2);
        assert_eq!(
            std::fs::read_to_string(src.join("greeting.txt")).unwrap(),
            "hello\nhi\n"
        );
        assert_eq!(std::fs::read_to_string(src.join("new.txt")).unwrap(), "fresh");
    }

    #[test]
    fn sync_back_ignores_resources_without_staged_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("proj");
        write(&src.join("f"), "x");
        let resources = vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)];
        let stats = sync_back(&tmp.path().join("no-export"), &resources).unwrap();
        assert_eq!(stats.files_copied, 0);
    }
}
