// SPDX-License-Identifier: MIT OR Apache-2.0
//! awcp-snapshot
#![deny(unsafe_code)]
//!
//! Delegator-side snapshot reconciliation. Reception is policy-driven
//! (`auto` / `staged` / `discard`); staged payloads are persisted under
//! `<base>/snapshots/<delegation>/<snapshot>/` with metadata beside; at
//! most one snapshot per delegation is ever applied, and re-delivery of
//! a known snapshot id over a reconnected stream is a no-op.

use awcp_core::{
    Delegation, Snapshot, SnapshotPayload, SnapshotPolicy, SnapshotStatus,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Payload file name inside a staged snapshot directory.
pub const PAYLOAD_FILE: &str = "payload";
/// Metadata file name inside a staged snapshot directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Errors raised by snapshot bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// The snapshot id is unknown on this delegation.
    #[error("snapshot not found: {snapshot_id}")]
    NotFound {
        /// The missing id.
        snapshot_id: String,
    },

    /// The snapshot is not in `pending` state.
    #[error("snapshot {snapshot_id} is {status:?}, not pending")]
    NotPending {
        /// The offending id.
        snapshot_id: String,
        /// Its actual status.
        status: SnapshotStatus,
    },

    /// The delegation already has an applied snapshot.
    #[error("delegation already has applied snapshot {applied_id}")]
    AlreadyApplied {
        /// The snapshot that holds the slot.
        applied_id: String,
    },

    /// A staged payload is missing or undecodable.
    #[error("staged payload unreadable for {snapshot_id}: {reason}")]
    PayloadUnreadable {
        /// The offending id.
        snapshot_id: String,
        /// Failure detail.
        reason: String,
    },

    /// Underlying filesystem failure.
    #[error("snapshot io error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// OS error.
        #[source]
        source: std::io::Error,
    },
}

impl SnapshotError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// On-disk store
// ---------------------------------------------------------------------------

/// Metadata persisted next to a staged payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Owning delegation.
    pub delegation_id: String,
    /// Snapshot id.
    pub snapshot_id: String,
    /// Executor summary.
    pub summary: String,
    /// Notable items.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub highlights: Vec<String>,
    /// Executor recommendation flag.
    #[serde(default)]
    pub recommended: bool,
    /// Checksum of the raw payload bytes, as received.
    pub checksum_sha256: String,
    /// Staging time.
    pub created_at: DateTime<Utc>,
}

/// Staged snapshot payloads under `<base>/snapshots/`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Open (and create) the store under `base_dir/snapshots`.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let root = base_dir.into().join("snapshots");
        std::fs::create_dir_all(&root).map_err(|e| SnapshotError::io(&root, e))?;
        Ok(Self { root })
    }

    /// The store's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a payload and its metadata; returns the snapshot directory.
    ///
    /// The archive is stored decoded (raw bytes), not base64, so staged
    /// payloads on disk are directly inspectable with standard tools.
    ///
    /// # Errors
    ///
    /// Fails on undecodable base64 or filesystem errors.
    pub fn stage(
        &self,
        meta: &SnapshotMetadata,
        payload: &SnapshotPayload,
    ) -> Result<PathBuf, SnapshotError> {
        let dir = self.snapshot_dir(&meta.delegation_id, &meta.snapshot_id);
        std::fs::create_dir_all(&dir).map_err(|e| SnapshotError::io(&dir, e))?;

        let bytes = BASE64.decode(&payload.archive_b64).map_err(|e| {
            SnapshotError::PayloadUnreadable {
                snapshot_id: meta.snapshot_id.clone(),
                reason: format!("invalid base64: {e}"),
            }
        })?;
        let payload_path = dir.join(PAYLOAD_FILE);
        std::fs::write(&payload_path, &bytes).map_err(|e| SnapshotError::io(&payload_path, e))?;

        let meta_path = dir.join(METADATA_FILE);
        let json = serde_json::to_vec_pretty(meta).map_err(|e| {
            SnapshotError::PayloadUnreadable {
                snapshot_id: meta.snapshot_id.clone(),
                reason: e.to_string(),
            }
        })?;
        std::fs::write(&meta_path, json).map_err(|e| SnapshotError::io(&meta_path, e))?;

        debug!(
            target: "awcp.snapshot",
            delegation = %meta.delegation_id,
            snapshot = %meta.snapshot_id,
            bytes = bytes.len(),
            "staged snapshot payload"
        );
        Ok(dir)
    }

    /// Reload a staged payload as the wire shape.
    ///
    /// # Errors
    ///
    /// Fails when the payload or metadata is missing or unreadable.
    pub fn load_payload(
        &self,
        delegation_id: &str,
        snapshot_id: &str,
    ) -> Result<SnapshotPayload, SnapshotError> {
        let dir = self.snapshot_dir(delegation_id, snapshot_id);
        let bytes = std::fs::read(dir.join(PAYLOAD_FILE)).map_err(|e| {
            SnapshotError::PayloadUnreadable {
                snapshot_id: snapshot_id.to_string(),
                reason: e.to_string(),
            }
        })?;
        let meta = self.load_metadata(delegation_id, snapshot_id)?;
        Ok(SnapshotPayload {
            archive_b64: BASE64.encode(&bytes),
            checksum_sha256: meta.checksum_sha256,
        })
    }

    /// Reload staged metadata.
    ///
    /// # Errors
    ///
    /// Fails when missing or undecodable.
    pub fn load_metadata(
        &self,
        delegation_id: &str,
        snapshot_id: &str,
    ) -> Result<SnapshotMetadata, SnapshotError> {
        let path = self
            .snapshot_dir(delegation_id, snapshot_id)
            .join(METADATA_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            SnapshotError::PayloadUnreadable {
                snapshot_id: snapshot_id.to_string(),
                reason: e.to_string(),
            }
        })?;
        serde_json::from_str(&raw).map_err(|e| SnapshotError::PayloadUnreadable {
            snapshot_id: snapshot_id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Delete one staged snapshot directory; missing is fine.
    pub fn remove(&self, delegation_id: &str, snapshot_id: &str) {
        remove_quietly(&self.snapshot_dir(delegation_id, snapshot_id));
    }

    /// Delete every staged snapshot for a delegation; missing is fine.
    pub fn remove_delegation(&self, delegation_id: &str) {
        remove_quietly(&self.root.join(delegation_id));
    }

    /// Remove snapshot directories whose delegation is no longer known.
    /// Returns the number of directories removed.
    ///
    /// # Errors
    ///
    /// Fails only if the root cannot be listed.
    pub fn sweep_stale(&self, live_ids: &[String]) -> Result<usize, SnapshotError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SnapshotError::io(&self.root, e)),
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if live_ids.iter().any(|id| id == name) {
                continue;
            }
            if entry.path().is_dir() {
                remove_quietly(&entry.path());
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn snapshot_dir(&self, delegation_id: &str, snapshot_id: &str) -> PathBuf {
        self.root.join(delegation_id).join(snapshot_id)
    }
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(target: "awcp.snapshot", path = %path.display(), error = %e, "failed to remove snapshot dir");
        }
    }
}

// ---------------------------------------------------------------------------
// Reception & apply bookkeeping
// ---------------------------------------------------------------------------

/// One received snapshot event, borrowed from the decoded stream.
#[derive(Debug, Clone, Copy)]
pub struct ReceivedSnapshot<'a> {
    /// Executor-minted snapshot id.
    pub snapshot_id: &'a str,
    /// Executor summary.
    pub summary: &'a str,
    /// Notable items.
    pub highlights: &'a [String],
    /// Executor recommendation flag.
    pub recommended: bool,
    /// The payload as received.
    pub payload: &'a SnapshotPayload,
}

/// What reception decided to do with a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Policy `auto`: the caller must now apply via transport and then
    /// call [`mark_applied`].
    ApplyNow,
    /// Policy `staged`: payload persisted at the given path.
    Staged(PathBuf),
    /// Policy `discard`: metadata recorded, payload dropped.
    Discarded,
    /// Known id re-delivered (stream reconnect); nothing to do.
    Duplicate,
    /// `max_snapshots` reached; the snapshot was ignored.
    Overflow,
}

/// Record a snapshot event on the delegation per its policy.
///
/// Idempotent on snapshot id: re-delivery returns
/// [`Disposition::Duplicate`] without touching the record.
///
/// # Errors
///
/// Staging failures (policy `staged` only).
pub fn receive(
    delegation: &mut Delegation,
    store: &SnapshotStore,
    max_snapshots: usize,
    snap: ReceivedSnapshot<'_>,
) -> Result<Disposition, SnapshotError> {
    if delegation.snapshot(snap.snapshot_id).is_some() {
        return Ok(Disposition::Duplicate);
    }
    if delegation.snapshots.len() >= max_snapshots {
        warn!(
            target: "awcp.snapshot",
            delegation = %delegation.id,
            snapshot = %snap.snapshot_id,
            limit = max_snapshots,
            "ignoring snapshot past maxSnapshots"
        );
        return Ok(Disposition::Overflow);
    }

    let now = Utc::now();
    let mut record = Snapshot {
        id: snap.snapshot_id.to_string(),
        summary: snap.summary.to_string(),
        highlights: snap.highlights.to_vec(),
        recommended: snap.recommended,
        status: SnapshotStatus::Pending,
        local_path: None,
        created_at: now,
        applied_at: None,
    };

    let disposition = match delegation.snapshot_policy {
        SnapshotPolicy::Auto => Disposition::ApplyNow,
        SnapshotPolicy::Staged => {
            let meta = SnapshotMetadata {
                delegation_id: delegation.id.clone(),
                snapshot_id: snap.snapshot_id.to_string(),
                summary: snap.summary.to_string(),
                highlights: snap.highlights.to_vec(),
                recommended: snap.recommended,
                checksum_sha256: snap.payload.checksum_sha256.clone(),
                created_at: now,
            };
            let dir = store.stage(&meta, snap.payload)?;
            record.local_path = Some(dir.clone());
            Disposition::Staged(dir)
        }
        SnapshotPolicy::Discard => {
            record.status = SnapshotStatus::Discarded;
            Disposition::Discarded
        }
    };

    delegation.snapshots.push(record);
    delegation.touch();
    Ok(disposition)
}

/// Verify that `snapshot_id` may be applied on this delegation.
///
/// # Errors
///
/// Unknown id, non-pending status, or an already-occupied applied slot.
pub fn check_apply(delegation: &Delegation, snapshot_id: &str) -> Result<(), SnapshotError> {
    if let Some(applied_id) = &delegation.applied_snapshot_id {
        return Err(SnapshotError::AlreadyApplied {
            applied_id: applied_id.clone(),
        });
    }
    let snap = delegation
        .snapshot(snapshot_id)
        .ok_or_else(|| SnapshotError::NotFound {
            snapshot_id: snapshot_id.to_string(),
        })?;
    if snap.status != SnapshotStatus::Pending {
        return Err(SnapshotError::NotPending {
            snapshot_id: snapshot_id.to_string(),
            status: snap.status,
        });
    }
    Ok(())
}

/// Record a successful apply: flips status, stamps `applied_at`, and takes
/// the delegation's single applied slot.
///
/// # Errors
///
/// Same conditions as [`check_apply`].
pub fn mark_applied(delegation: &mut Delegation, snapshot_id: &str) -> Result<(), SnapshotError> {
    check_apply(delegation, snapshot_id)?;
    let now = Utc::now();
    if let Some(snap) = delegation.snapshot_mut(snapshot_id) {
        snap.status = SnapshotStatus::Applied;
        snap.applied_at = Some(now);
    }
    delegation.applied_snapshot_id = Some(snapshot_id.to_string());
    delegation.touch();
    Ok(())
}

/// Discard a pending snapshot: removes the staged payload and flips status.
///
/// # Errors
///
/// Unknown id or non-pending status.
pub fn discard(
    delegation: &mut Delegation,
    store: &SnapshotStore,
    snapshot_id: &str,
) -> Result<(), SnapshotError> {
    let snap = delegation
        .snapshot(snapshot_id)
        .ok_or_else(|| SnapshotError::NotFound {
            snapshot_id: snapshot_id.to_string(),
        })?;
    if snap.status != SnapshotStatus::Pending {
        return Err(SnapshotError::NotPending {
            snapshot_id: snapshot_id.to_string(),
            status: snap.status,
        });
    }
    store.remove(&delegation.id, snapshot_id);
    if let Some(snap) = delegation.snapshot_mut(snapshot_id) {
        snap.status = SnapshotStatus::Discarded;
        snap.local_path = None;
    }
    delegation.touch();
    Ok(())
}
