// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! awcp-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for AWCP.
//!
//! One Delegator hands a bounded slice of its filesystem to one Executor;
//! this crate defines everything both sides must agree on and nothing else.

/// Closed error-code taxonomy shared by both engines.
pub mod error;
/// Executor-to-Delegator event stream vocabulary.
pub mod event;
/// Wire messages: INVITE, ACCEPT, START, ERROR.
pub mod message;
/// Post-SSE result recovery surface.
pub mod recovery;
/// Delegator and Executor state machines.
pub mod state;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

pub use error::{ErrorClass, ErrorCode, ProtocolError};
pub use event::ExecutorEvent;
pub use message::{
    AcceptMessage, Ack, EnvironmentSpec, ErrorMessage, ExecutorConstraints, InviteMessage,
    ProtocolMessage, SandboxProfile, StartMessage, TransportDescriptor, WorkDirInfo,
};
pub use recovery::{ResultResponse, ResultStatus};
pub use state::{DelegatorState, ExecutorState};

/// Protocol version carried in every wire message.
///
/// Messages with a different version are rejected with `DECLINED`.
///
/// # Examples
///
/// ```
/// assert_eq!(awcp_core::PROTOCOL_VERSION, "1");
/// ```
pub const PROTOCOL_VERSION: &str = "1";

/// Mint a fresh delegation identifier.
///
/// Identifiers are opaque to the protocol; the Executor must treat them as
/// untrusted strings (they become directory names under its work root).
#[must_use]
pub fn new_delegation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Mint a fresh snapshot identifier, unique within a delegation.
#[must_use]
pub fn new_snapshot_id() -> String {
    format!("snap-{}", Uuid::new_v4())
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// The work to perform, opaque to the protocol.
///
/// Both fields pass through to the injected task runner unmodified.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskSpec {
    /// Short human-readable description (for logs and UIs).
    pub description: String,

    /// Full instruction text handed to the task runner.
    pub prompt: String,
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Access mode granted on a resource or lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Read-only: the resource never appears in an applied snapshot delta.
    Ro,
    /// Read-write: executor changes flow back on snapshot apply.
    Rw,
}

impl AccessMode {
    /// Returns `true` for [`AccessMode::Rw`].
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, Self::Rw)
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ro => "ro",
            Self::Rw => "rw",
        })
    }
}

/// A named piece of the delegated environment.
///
/// `source` interpretation is owned by the transport adapter; for `fs`
/// resources it is a directory on the Delegator's filesystem.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Name, unique within the environment. Becomes the top-level directory
    /// under the export tree and the executor work path.
    pub name: String,

    /// Resource type tag (e.g. `"fs"`).
    #[serde(rename = "type")]
    pub kind: String,

    /// Adapter-interpreted source locator.
    pub source: String,

    /// Access mode for this resource.
    pub mode: AccessMode,

    /// Include globs, evaluated relative to the resource root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,

    /// Exclude globs; exclude wins over include.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

impl Resource {
    /// Convenience constructor for a filesystem resource with no glob rules.
    pub fn fs(name: impl Into<String>, source: impl Into<String>, mode: AccessMode) -> Self {
        Self {
            name: name.into(),
            kind: "fs".into(),
            source: source.into(),
            mode,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

/// What the Delegator asks for when inviting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRequest {
    /// Requested lifetime in seconds.
    pub ttl_seconds: u64,
    /// Requested access mode.
    pub access_mode: AccessMode,
}

/// The active lease set when START is issued. Frozen once the delegation
/// reaches a terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Absolute expiry time (Delegator clock).
    pub expires_at: DateTime<Utc>,
    /// Granted access mode (may be a downgrade of the request).
    pub access_mode: AccessMode,
}

impl Lease {
    /// Returns `true` if `now` is past expiry plus `grace_seconds`.
    ///
    /// The grace absorbs bounded clock skew between the two parties.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>, grace_seconds: i64) -> bool {
        now > self.expires_at + chrono::Duration::seconds(grace_seconds)
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// What the Delegator does when a snapshot event arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotPolicy {
    /// Apply immediately on receipt.
    #[default]
    Auto,
    /// Persist the payload; an explicit apply is required.
    Staged,
    /// Record metadata only.
    Discard,
}

/// Disposition of a received snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    /// Persisted, awaiting an explicit apply or discard.
    Pending,
    /// Merged into the Delegator's export tree.
    Applied,
    /// Metadata recorded, payload dropped.
    Discarded,
}

/// Executor work-path state conveyed back to the Delegator.
///
/// The payload is a whole materialization, not a delta: a gzip'd tar of the
/// work path, base64-embedded so it survives JSON transport, with a SHA-256
/// checksum over the raw archive bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    /// Base64-encoded gzip'd tar archive.
    pub archive_b64: String,
    /// Lowercase hex SHA-256 of the raw (pre-base64) archive bytes.
    pub checksum_sha256: String,
}

/// Per-snapshot record kept on the delegation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Identifier, unique within the delegation (minted by the Executor).
    pub id: String,

    /// Executor-provided summary of the changes.
    pub summary: String,

    /// Optional notable items called out by the executor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub highlights: Vec<String>,

    /// Executor recommends applying this snapshot.
    #[serde(default)]
    pub recommended: bool,

    /// Current disposition.
    pub status: SnapshotStatus,

    /// Where the payload is persisted, when staged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,

    /// Receipt time.
    pub created_at: DateTime<Utc>,

    /// Apply time, when applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Transport handles
// ---------------------------------------------------------------------------

/// The opaque value the Executor uses to materialize the Delegator's
/// resources. Only the variant's owning adapter interprets the contents.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransportHandle {
    /// Whole export tree carried inline as a checksummed archive.
    #[serde(rename_all = "camelCase")]
    Inline {
        /// Base64-encoded gzip'd tar of the export tree.
        archive_b64: String,
        /// Lowercase hex SHA-256 of the raw archive bytes.
        checksum_sha256: String,
    },

    /// Escape hatch for out-of-tree adapters (SSH mounts, object stores,
    /// Git remotes). The engine never looks inside `value`.
    #[serde(rename_all = "camelCase")]
    Custom {
        /// Adapter kind tag, matched against the registered adapter.
        transport: String,
        /// Adapter-owned payload.
        #[serde(default)]
        value: serde_json::Value,
    },
}

impl TransportHandle {
    /// The adapter kind this handle belongs to.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Inline { .. } => "inline",
            Self::Custom { transport, .. } => transport,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Success payload of a completed delegation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    /// What the executor did.
    pub summary: String,

    /// Notable items, in executor order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub highlights: Vec<String>,

    /// Free-form notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Pre-flight admission measurements attached to the delegation record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReport {
    /// Total bytes that would be shipped.
    pub total_bytes: u64,
    /// Number of files that would be shipped.
    pub file_count: u64,
    /// Size of the largest single file.
    pub largest_file_bytes: u64,
}

// ---------------------------------------------------------------------------
// Delegation record
// ---------------------------------------------------------------------------

/// The durable source-of-truth record owned by the Delegator.
///
/// Persisted as JSON after every mutation; survives process restarts.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Delegation {
    /// Opaque identifier, unique per Delegator.
    pub id: String,

    /// Base URL of the Executor.
    pub peer_url: String,

    /// The task, passed through to the runner.
    pub task: TaskSpec,

    /// Ordered set of resources; names are unique.
    pub environment: Vec<Resource>,

    /// What was asked for.
    pub lease_requested: LeaseRequest,

    /// What was granted; set when START is issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_active: Option<Lease>,

    /// Governs snapshot reception.
    pub snapshot_policy: SnapshotPolicy,

    /// Current protocol state.
    pub state: DelegatorState,

    /// Delegator-local materialized export tree; removed on release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_path: Option<PathBuf>,

    /// Per-transport handle produced by `prepare`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_handle: Option<TransportHandle>,

    /// Received snapshots, in arrival order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<Snapshot>,

    /// At most one snapshot is ever applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_snapshot_id: Option<String>,

    /// Set on success; mutually exclusive with `error` in terminal states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskOutcome>,

    /// Set on failure; mutually exclusive with `result` in terminal states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProtocolError>,

    /// Pre-flight measurements from the admission scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission: Option<AdmissionReport>,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Last mutation time; monotonically non-decreasing.
    pub updated_at: DateTime<Utc>,
}

impl Delegation {
    /// Create a fresh record in [`DelegatorState::Created`].
    pub fn new(
        id: impl Into<String>,
        peer_url: impl Into<String>,
        task: TaskSpec,
        environment: Vec<Resource>,
        lease_requested: LeaseRequest,
        snapshot_policy: SnapshotPolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            peer_url: peer_url.into(),
            task,
            environment,
            lease_requested,
            lease_active: None,
            snapshot_policy,
            state: DelegatorState::Created,
            export_path: None,
            transport_handle: None,
            snapshots: Vec::new(),
            applied_snapshot_id: None,
            result: None,
            error: None,
            admission: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump `updated_at`, keeping it monotonic even under clock steps.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = self.updated_at.max(now);
    }

    /// Transition to `next`, bumping `updated_at`.
    ///
    /// # Errors
    ///
    /// Fails with a typed error when the transition is not legal from the
    /// current state; the record is left unchanged.
    pub fn transition(&mut self, next: DelegatorState) -> Result<(), ProtocolError> {
        if !self.state.can_transition_to(next) {
            return Err(ProtocolError::new(
                ErrorCode::Declined,
                format!("illegal transition {} -> {}", self.state, next),
            ));
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    /// Resources with [`AccessMode::Rw`], the only candidates for apply.
    #[must_use]
    pub fn rw_resources(&self) -> Vec<Resource> {
        self.environment
            .iter()
            .filter(|r| r.mode.is_writable())
            .cloned()
            .collect()
    }

    /// Find a snapshot by id.
    #[must_use]
    pub fn snapshot(&self, snapshot_id: &str) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.id == snapshot_id)
    }

    /// Mutable lookup by snapshot id.
    pub fn snapshot_mut(&mut self, snapshot_id: &str) -> Option<&mut Snapshot> {
        self.snapshots.iter_mut().find(|s| s.id == snapshot_id)
    }

    /// Terminal-state invariant: exactly one of `result` / `error` is set
    /// once the state is terminal.
    #[must_use]
    pub fn terminal_invariant_holds(&self) -> bool {
        if !self.state.is_terminal() {
            return true;
        }
        self.result.is_some() != self.error.is_some()
    }
}

/// Validate an environment: at least one resource, unique non-empty names.
///
/// # Errors
///
/// Returns `DECLINED` describing the first violation found.
pub fn validate_environment(resources: &[Resource]) -> Result<(), ProtocolError> {
    if resources.is_empty() {
        return Err(ProtocolError::new(
            ErrorCode::Declined,
            "environment has no resources",
        ));
    }
    let mut seen = std::collections::BTreeSet::new();
    for r in resources {
        if r.name.is_empty() {
            return Err(ProtocolError::new(
                ErrorCode::Declined,
                "resource name is empty",
            ));
        }
        if !seen.insert(r.name.as_str()) {
            return Err(ProtocolError::new(
                ErrorCode::Declined,
                format!("duplicate resource name: {}", r.name),
            ));
        }
    }
    Ok(())
}
