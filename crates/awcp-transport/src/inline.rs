// SPDX-License-Identifier: MIT OR Apache-2.0
//! The inline reference adapter: the whole export tree rides inside the
//! transport handle as a checksummed, base64-embedded gzip'd tar.
//!
//! No remote state exists, so `prepare`/`release` are trivially idempotent
//! and the dependency probe always passes. Every other adapter concern —
//! checksum verification on setup, access-mode and selection-rule
//! enforcement on apply — is exercised for real.

use crate::archive::{pack_tree_async, unpack_tree_async};
use crate::{
    DelegatorTransport, DependencyCheck, ExecutorTransport, TransportCapabilities, TransportError,
};
use async_trait::async_trait;
use awcp_core::{Resource, SnapshotPayload, TransportHandle};
use awcp_glob::SelectionRules;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Adapter kind tag used in INVITE transport descriptors.
pub const INLINE_KIND: &str = "inline";

/// In-tree adapter carrying workspace state inline over the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineTransport;

impl InlineTransport {
    /// Create the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DelegatorTransport for InlineTransport {
    async fn prepare(
        &self,
        delegation_id: &str,
        export_path: &Path,
        _ttl_seconds: u64,
    ) -> Result<TransportHandle, TransportError> {
        let payload = pack_tree_async(export_path.to_path_buf()).await?;
        debug!(
            target: "awcp.transport",
            delegation = delegation_id,
            "packed export tree into inline handle"
        );
        Ok(TransportHandle::Inline {
            archive_b64: payload.archive_b64,
            checksum_sha256: payload.checksum_sha256,
        })
    }

    async fn apply_snapshot(
        &self,
        delegation_id: &str,
        payload: &SnapshotPayload,
        rw_resources: &[Resource],
        export_path: &Path,
    ) -> Result<(), TransportError> {
        let mut rules: HashMap<String, SelectionRules> = HashMap::new();
        for r in rw_resources {
            let compiled = SelectionRules::compile(&r.include, &r.exclude).map_err(|e| {
                TransportError::Setup {
                    reason: format!("resource {}: {e}", r.name),
                }
            })?;
            rules.insert(r.name.clone(), compiled);
        }

        let filter = move |rel: &Path| -> bool {
            let mut components = rel.components();
            let Some(Component::Normal(first)) = components.next() else {
                return false;
            };
            let Some(first) = first.to_str() else {
                return false;
            };
            // Only rw resources are writable; everything else in the
            // archive (ro resources, the manifest dir) is dropped.
            let Some(resource_rules) = rules.get(first) else {
                return false;
            };
            let inner: PathBuf = components.collect();
            if inner.as_os_str().is_empty() {
                return true;
            }
            resource_rules.decide(&inner).is_selected()
        };

        let written =
            unpack_tree_async(payload.clone(), export_path.to_path_buf(), filter).await?;
        debug!(
            target: "awcp.transport",
            delegation = delegation_id,
            files = written,
            "applied snapshot into export tree"
        );
        Ok(())
    }

    async fn release(&self, _delegation_id: &str) -> Result<(), TransportError> {
        // Nothing lives outside the handle itself.
        Ok(())
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            supports_snapshots: true,
            live_sync: false,
        }
    }

    fn kind(&self) -> &str {
        INLINE_KIND
    }
}

#[async_trait]
impl ExecutorTransport for InlineTransport {
    fn check_dependency(&self) -> DependencyCheck {
        DependencyCheck::available()
    }

    async fn setup(
        &self,
        delegation_id: &str,
        handle: &TransportHandle,
        work_path: &Path,
    ) -> Result<PathBuf, TransportError> {
        let TransportHandle::Inline {
            archive_b64,
            checksum_sha256,
        } = handle
        else {
            return Err(TransportError::WrongHandle {
                got: handle.kind().to_string(),
                adapter: INLINE_KIND.to_string(),
            });
        };
        let payload = SnapshotPayload {
            archive_b64: archive_b64.clone(),
            checksum_sha256: checksum_sha256.clone(),
        };
        let written =
            unpack_tree_async(payload, work_path.to_path_buf(), |_| true).await?;
        debug!(
            target: "awcp.transport",
            delegation = delegation_id,
            files = written,
            work_path = %work_path.display(),
            "materialized inline handle"
        );
        Ok(work_path.to_path_buf())
    }

    async fn capture_snapshot(
        &self,
        delegation_id: &str,
        work_path: &Path,
    ) -> Result<Option<SnapshotPayload>, TransportError> {
        let payload = pack_tree_async(work_path.to_path_buf()).await?;
        debug!(
            target: "awcp.transport",
            delegation = delegation_id,
            "captured work path into snapshot payload"
        );
        Ok(Some(payload))
    }

    async fn release(&self, _delegation_id: &str, _work_path: &Path) -> Result<(), TransportError> {
        // The workspace manager owns work-path deletion.
        Ok(())
    }

    fn kind(&self) -> &str {
        INLINE_KIND
    }
}
