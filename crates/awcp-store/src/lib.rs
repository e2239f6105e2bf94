// SPDX-License-Identifier: MIT OR Apache-2.0
//! awcp-store
#![deny(unsafe_code)]
//!
//! Durable delegation records: one JSON file per delegation under
//! `<base>/delegations/`, written via a temp file and rename so a crash
//! never leaves a torn record. Each delegation's file doubles as its
//! write lock — there is no global lock.

use awcp_core::Delegation;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Errors raised by the delegation store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record exists for the requested id.
    #[error("delegation record not found: {id}")]
    NotFound {
        /// The missing id.
        id: String,
    },

    /// A record exists but could not be decoded.
    #[error("delegation record corrupt: {id}: {reason}")]
    Corrupt {
        /// The offending id.
        id: String,
        /// Decode failure detail.
        reason: String,
    },

    /// Underlying filesystem failure.
    #[error("store io error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// OS error.
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// File-based store for [`Delegation`] records.
#[derive(Debug, Clone)]
pub struct DelegationStore {
    dir: PathBuf,
}

impl DelegationStore {
    /// Create a store rooted at `base_dir`; records live under
    /// `base_dir/delegations/`.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = base_dir.into().join("delegations");
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir })
    }

    /// Directory holding the record files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a record, replacing any previous version.
    ///
    /// # Errors
    ///
    /// Fails on filesystem or encoding errors; a failed write never
    /// clobbers the previous record.
    pub fn save(&self, delegation: &Delegation) -> Result<PathBuf, StoreError> {
        let path = self.record_path(&delegation.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(delegation).map_err(|e| StoreError::Corrupt {
            id: delegation.id.clone(),
            reason: e.to_string(),
        })?;
        std::fs::write(&tmp, json).map_err(|e| StoreError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;
        Ok(path)
    }

    /// Load a record by id.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when no file exists; [`StoreError::Corrupt`]
    /// when the file cannot be decoded.
    pub fn load(&self, id: &str) -> Result<Delegation, StoreError> {
        let path = self.record_path(id);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound { id: id.to_string() }
            } else {
                StoreError::io(&path, e)
            }
        })?;
        serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Returns `true` if a record file exists for `id`.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.record_path(id).is_file()
    }

    /// List all stored delegation ids, sorted.
    ///
    /// # Errors
    ///
    /// Fails if the store directory cannot be read (a missing directory is
    /// an empty list).
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load every decodable record at startup; corrupt files are logged
    /// and skipped so one bad record cannot block recovery.
    ///
    /// # Errors
    ///
    /// Fails only if the directory listing itself fails.
    pub fn load_all(&self) -> Result<Vec<Delegation>, StoreError> {
        let mut out = Vec::new();
        for id in self.list()? {
            match self.load(&id) {
                Ok(d) => out.push(d),
                Err(err) => {
                    warn!(target: "awcp.store", id = %id, error = %err, "skipping unreadable delegation record");
                }
            }
        }
        Ok(out)
    }

    /// Delete a record; deleting a missing record is not an error.
    ///
    /// # Errors
    ///
    /// Fails on filesystem errors other than not-found.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.record_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use awcp_core::{
        AccessMode, DelegatorState, LeaseRequest, Resource, SnapshotPolicy, TaskSpec,
    };

    fn record(id: &str) -> Delegation {
        Delegation::new(
            id,
            "http://127.0.0.1:9",
            TaskSpec {
                description: "t".into(),
                prompt: "p".into(),
            },
            vec![Resource::fs("ws", "/tmp/ws", AccessMode::Rw)],
            LeaseRequest {
                ttl_seconds: 60,
                access_mode: AccessMode::Rw,
            },
            SnapshotPolicy::Auto,
        )
    }

    #[test]
    fn save_then_load_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DelegationStore::open(tmp.path()).unwrap();
        let d = record("d-1");
        store.save(&d).unwrap();
        let back = store.load("d-1").unwrap();
        assert_eq!(back.id, "d-1");
        assert_eq!(back.state, DelegatorState::Created);
    }

    #[test]
    fn load_unknown_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DelegationStore::open(tmp.path()).unwrap();
        assert!(matches!(
            store.load("nope"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn save_overwrites_previous_version() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DelegationStore::open(tmp.path()).unwrap();
        let mut d = record("d-1");
        store.save(&d).unwrap();
        d.transition(DelegatorState::Invited).unwrap();
        store.save(&d).unwrap();
        assert_eq!(store.load("d-1").unwrap().state, DelegatorState::Invited);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn list_is_sorted_and_ignores_foreign_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DelegationStore::open(tmp.path()).unwrap();
        store.save(&record("b")).unwrap();
        store.save(&record("a")).unwrap();
        std::fs::write(store.dir().join("notes.txt"), "x").unwrap();
        assert_eq!(store.list().unwrap(), vec!["a".to_string(), "b".into()]);
    }

    #[test]
    fn load_all_skips_corrupt_records() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DelegationStore::open(tmp.path()).unwrap();
        store.save(&record("good")).unwrap();
        std::fs::write(store.dir().join("bad.json"), "{not json").unwrap();
        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "good");
    }

    #[test]
    fn delete_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DelegationStore::open(tmp.path()).unwrap();
        store.save(&record("d-1")).unwrap();
        store.delete("d-1").unwrap();
        store.delete("d-1").unwrap();
        assert!(!store.exists("d-1"));
    }

    #[test]
    fn corrupt_record_reports_reason() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DelegationStore::open(tmp.path()).unwrap();
        std::fs::write(store.dir().join("d-1.json"), "[]").unwrap();
        let err = store.load("d-1").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
