// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! awcp-transport
#![deny(unsafe_code)]

/// Archive payload codec (tar + gzip + base64 + sha256).
pub mod archive;
/// The inline reference adapter.
pub mod inline;

pub use inline::InlineTransport;

use async_trait::async_trait;
use awcp_core::{ErrorCode, ProtocolError, Resource, SnapshotPayload, TransportHandle};
use std::path::{Path, PathBuf};

/// Errors raised by transport adapters.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Materialization or preparation failed.
    #[error("transport setup failed: {reason}")]
    Setup {
        /// Failure detail.
        reason: String,
    },

    /// Credential or authentication failure.
    #[error("transport auth failed: {reason}")]
    Auth {
        /// Failure detail.
        reason: String,
    },

    /// The payload checksum did not match its contents.
    #[error("payload checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Declared checksum.
        expected: String,
        /// Computed checksum.
        actual: String,
    },

    /// The payload could not be decoded at all.
    #[error("invalid payload: {reason}")]
    InvalidPayload {
        /// Failure detail.
        reason: String,
    },

    /// A handle of the wrong kind reached this adapter.
    #[error("handle kind {got} not usable by adapter {adapter}")]
    WrongHandle {
        /// Kind found on the handle.
        got: String,
        /// This adapter's kind.
        adapter: String,
    },

    /// Underlying filesystem failure.
    #[error("transport io error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// OS error.
        #[source]
        source: std::io::Error,
    },
}

impl TransportError {
    /// The wire code this failure surfaces as.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Auth { .. } => ErrorCode::AuthFailed,
            _ => ErrorCode::SetupFailed,
        }
    }

    /// Convert to the wire-level typed error.
    #[must_use]
    pub fn to_protocol_error(&self) -> ProtocolError {
        ProtocolError::new(self.code(), self.to_string())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Static capability set; engine logic branches on these, never on the
/// concrete adapter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// The adapter conveys executor state back as snapshot payloads.
    pub supports_snapshots: bool,
    /// Changes appear under the export tree continuously (mounted
    /// filesystems); snapshot reception is skipped entirely.
    pub live_sync: bool,
}

/// Result of the Executor-side dependency probe, gating INVITE acceptance.
#[derive(Debug, Clone)]
pub struct DependencyCheck {
    /// The adapter can operate in this environment.
    pub available: bool,
    /// What is missing, when unavailable.
    pub hint: Option<String>,
}

impl DependencyCheck {
    /// An unconditionally-available dependency.
    #[must_use]
    pub fn available() -> Self {
        Self {
            available: true,
            hint: None,
        }
    }

    /// A missing dependency with a remediation hint.
    pub fn missing(hint: impl Into<String>) -> Self {
        Self {
            available: false,
            hint: Some(hint.into()),
        }
    }
}

/// Delegator half of the adapter contract.
///
/// `prepare` and `release` must be safe to call twice for the same id;
/// `apply_snapshot` must be idempotent for identical payloads.
#[async_trait]
pub trait DelegatorTransport: Send + Sync {
    /// One-time initialization at engine startup. Idempotent.
    ///
    /// # Errors
    ///
    /// Adapter-specific setup failures.
    async fn initialize(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Produce the handle the Executor needs, after ACCEPT.
    ///
    /// # Errors
    ///
    /// `SETUP_FAILED`-class failures.
    async fn prepare(
        &self,
        delegation_id: &str,
        export_path: &Path,
        ttl_seconds: u64,
    ) -> Result<TransportHandle, TransportError>;

    /// Merge executor-delivered state into the export tree, honoring
    /// per-resource access modes and selection rules.
    ///
    /// # Errors
    ///
    /// Decode or filesystem failures; partial writes may remain and a
    /// retry with the same payload must converge to the same tree.
    async fn apply_snapshot(
        &self,
        delegation_id: &str,
        payload: &SnapshotPayload,
        rw_resources: &[Resource],
        export_path: &Path,
    ) -> Result<(), TransportError>;

    /// Revoke credentials and delete transport artifacts. Retriable.
    ///
    /// # Errors
    ///
    /// Adapter-specific failures; callers log and continue.
    async fn release(&self, delegation_id: &str) -> Result<(), TransportError>;

    /// Static capability set.
    fn capabilities(&self) -> TransportCapabilities;

    /// Adapter kind tag, matched against INVITE transport descriptors.
    fn kind(&self) -> &str;
}

/// Executor half of the adapter contract.
#[async_trait]
pub trait ExecutorTransport: Send + Sync {
    /// One-time initialization with the engine's work root. Idempotent.
    ///
    /// # Errors
    ///
    /// Adapter-specific setup failures.
    async fn initialize(&self, _work_root: &Path) -> Result<(), TransportError> {
        Ok(())
    }

    /// Final teardown at engine shutdown.
    ///
    /// # Errors
    ///
    /// Adapter-specific failures; callers log and continue.
    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Probe whether this adapter can operate here (mount helpers
    /// installed, CLI present, …). Gates INVITE acceptance.
    fn check_dependency(&self) -> DependencyCheck;

    /// Materialize the handle into `work_path`; returns the path the task
    /// should actually run in (usually `work_path` itself).
    ///
    /// # Errors
    ///
    /// `SETUP_FAILED`-class failures, including checksum mismatches.
    async fn setup(
        &self,
        delegation_id: &str,
        handle: &TransportHandle,
        work_path: &Path,
    ) -> Result<PathBuf, TransportError>;

    /// Capture the work path after a successful run. Live-sync adapters
    /// return `None`.
    ///
    /// # Errors
    ///
    /// Archive or filesystem failures.
    async fn capture_snapshot(
        &self,
        delegation_id: &str,
        work_path: &Path,
    ) -> Result<Option<SnapshotPayload>, TransportError>;

    /// Unmount, drop credentials, delete clones. Retriable.
    ///
    /// # Errors
    ///
    /// Adapter-specific failures; callers log and continue.
    async fn release(&self, delegation_id: &str, work_path: &Path) -> Result<(), TransportError>;

    /// Adapter kind tag.
    fn kind(&self) -> &str;
}
