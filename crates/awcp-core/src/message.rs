// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire messages exchanged over the Executor's `POST /` endpoint.
//!
//! Every message carries `version: "1"`; a mismatch is rejected with
//! `DECLINED` before any other processing.

use crate::error::{ErrorCode, ProtocolError};
use crate::{AccessMode, Lease, LeaseRequest, Resource, TaskSpec, TransportHandle};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Discriminated union of all protocol messages, dispatched by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type")]
pub enum ProtocolMessage {
    /// Delegator → Executor: propose a delegation.
    #[serde(rename = "INVITE")]
    Invite(InviteMessage),
    /// Executor → Delegator: synchronous admission acceptance.
    #[serde(rename = "ACCEPT")]
    Accept(AcceptMessage),
    /// Delegator → Executor: begin execution.
    #[serde(rename = "START")]
    Start(StartMessage),
    /// Either direction: refusal or unilateral cancellation.
    #[serde(rename = "ERROR")]
    Error(ErrorMessage),
}

impl ProtocolMessage {
    /// The delegation this message belongs to.
    #[must_use]
    pub fn delegation_id(&self) -> &str {
        match self {
            Self::Invite(m) => &m.delegation_id,
            Self::Accept(m) => &m.delegation_id,
            Self::Start(m) => &m.delegation_id,
            Self::Error(m) => &m.delegation_id,
        }
    }

    /// The protocol version this message claims.
    #[must_use]
    pub fn version(&self) -> &str {
        match self {
            Self::Invite(m) => &m.version,
            Self::Accept(m) => &m.version,
            Self::Start(m) => &m.version,
            Self::Error(m) => &m.version,
        }
    }

    /// Reject messages whose version does not match ours.
    ///
    /// # Errors
    ///
    /// `DECLINED` naming both versions.
    pub fn check_version(&self) -> Result<(), ProtocolError> {
        check_version(self.version())
    }
}

/// Reject a version string that does not match [`crate::PROTOCOL_VERSION`].
///
/// # Errors
///
/// `DECLINED` naming both versions.
pub fn check_version(version: &str) -> Result<(), ProtocolError> {
    if version == crate::PROTOCOL_VERSION {
        Ok(())
    } else {
        Err(ProtocolError::new(
            ErrorCode::Declined,
            format!(
                "protocol version mismatch: got {version}, want {}",
                crate::PROTOCOL_VERSION
            ),
        ))
    }
}

// ---------------------------------------------------------------------------
// INVITE
// ---------------------------------------------------------------------------

/// The resources offered with an INVITE.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EnvironmentSpec {
    /// Ordered resource set; names unique.
    pub resources: Vec<Resource>,
}

/// Declares which transport the delegation will use. Adapter-specific
/// options ride along untyped; the engine only reads `type`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransportDescriptor {
    /// Adapter kind tag (e.g. `"inline"`).
    #[serde(rename = "type")]
    pub kind: String,

    /// Adapter-owned options.
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl TransportDescriptor {
    /// Descriptor with no options.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            options: serde_json::Map::new(),
        }
    }
}

/// Delegator → Executor: propose a delegation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InviteMessage {
    /// Protocol version (`"1"`).
    pub version: String,
    /// Delegation identifier minted by the Delegator.
    pub delegation_id: String,
    /// The task, opaque to the protocol.
    pub task: TaskSpec,
    /// Requested lease bounds.
    pub lease: LeaseRequest,
    /// Offered resources.
    pub environment: EnvironmentSpec,
    /// Transport the delegation will use.
    pub transport: TransportDescriptor,
}

// ---------------------------------------------------------------------------
// ACCEPT
// ---------------------------------------------------------------------------

/// Where the Executor will materialize the work.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkDirInfo {
    /// Executor-local work path.
    pub path: String,
}

/// Sandbox posture the Executor will run the task under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxProfile {
    /// Tool access confined to the work path.
    pub cwd_only: bool,
    /// Network access permitted.
    pub allow_network: bool,
    /// Process execution permitted.
    pub allow_exec: bool,
}

impl Default for SandboxProfile {
    fn default() -> Self {
        Self {
            cwd_only: true,
            allow_network: false,
            allow_exec: true,
        }
    }
}

/// Constraints the Executor imposes; the Delegator adopts them.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConstraints {
    /// Granted access mode; may downgrade the request.
    pub accepted_access_mode: AccessMode,
    /// TTL ceiling; the effective TTL is `min(requested, this)`.
    pub max_ttl_seconds: u64,
    /// Sandbox posture.
    pub sandbox_profile: SandboxProfile,
}

/// Executor → Delegator: synchronous admission acceptance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcceptMessage {
    /// Protocol version (`"1"`).
    pub version: String,
    /// Echoed delegation identifier.
    pub delegation_id: String,
    /// Allocated work path.
    pub executor_work_dir: WorkDirInfo,
    /// Constraints to merge into the delegation.
    pub executor_constraints: ExecutorConstraints,
}

// ---------------------------------------------------------------------------
// START
// ---------------------------------------------------------------------------

/// Delegator → Executor: begin execution under the given lease.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartMessage {
    /// Protocol version (`"1"`).
    pub version: String,
    /// Echoed delegation identifier.
    pub delegation_id: String,
    /// Absolute lease; the Executor re-reads its own clock against it.
    pub lease: Lease,
    /// Everything the Executor needs to materialize the workspace.
    pub work_dir: TransportHandle,
}

// ---------------------------------------------------------------------------
// ERROR
// ---------------------------------------------------------------------------

/// Refusal or unilateral cancellation, either direction.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    /// Protocol version (`"1"`).
    pub version: String,
    /// Delegation the error refers to.
    pub delegation_id: String,
    /// Stable error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Optional remediation hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorMessage {
    /// Build an ERROR message for `delegation_id` from a typed error.
    pub fn from_protocol_error(delegation_id: impl Into<String>, err: ProtocolError) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION.into(),
            delegation_id: delegation_id.into(),
            code: err.code,
            message: err.message,
            hint: err.hint,
        }
    }

    /// Convert back into the typed error.
    #[must_use]
    pub fn to_protocol_error(&self) -> ProtocolError {
        let err = ProtocolError::new(self.code, self.message.clone());
        match &self.hint {
            Some(hint) => err.with_hint(hint.clone()),
            None => err,
        }
    }
}

/// Trivial acknowledgement body for START and ERROR posts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
pub struct Ack {
    /// Always `true` on success paths.
    pub ok: bool,
}

impl Ack {
    /// The affirmative acknowledgement.
    #[must_use]
    pub fn yes() -> Self {
        Self { ok: true }
    }
}
