// SPDX-License-Identifier: MIT OR Apache-2.0
//! Closed error-code taxonomy.
//!
//! Every failure that crosses the wire or lands on a delegation record is a
//! typed value: stable code, human message, optional hint. The code set is
//! closed; adding a variant is a protocol change.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorClass
// ---------------------------------------------------------------------------

/// Broad family an [`ErrorCode`] belongs to; drives retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Surfaced synchronously at admission; no resources were allocated.
    /// Never retried automatically.
    Refusal,
    /// Transport or workspace setup problems; both sides roll back.
    Setup,
    /// The injected task runner raised.
    Task,
    /// Cancellation, expiry, and stream loss.
    Lifecycle,
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Serializes as `SCREAMING_SNAKE_CASE`, matching the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The Executor (or a version/validation gate) refused the delegation.
    Declined,
    /// The Executor's transport adapter dependency is unavailable.
    DepMissing,
    /// Admission bounds exceeded (bytes, file count, or single-file size).
    WorkspaceTooLarge,
    /// The Executor could not allocate a work path.
    WorkdirDenied,
    /// START arrived after the lease it carries had already expired.
    StartExpired,
    /// The lease expired while the delegation was in flight.
    Expired,
    /// Transport credential or authentication failure.
    AuthFailed,
    /// Transport or workspace setup failed.
    SetupFailed,
    /// The task runner raised.
    TaskFailed,
    /// Unilateral cancellation.
    Cancelled,
    /// Unknown delegation id.
    NotFound,
    /// SSE reconnect attempts were exhausted.
    SseFailed,
}

impl ErrorCode {
    /// Stable wire string for this code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Declined => "DECLINED",
            Self::DepMissing => "DEP_MISSING",
            Self::WorkspaceTooLarge => "WORKSPACE_TOO_LARGE",
            Self::WorkdirDenied => "WORKDIR_DENIED",
            Self::StartExpired => "START_EXPIRED",
            Self::Expired => "EXPIRED",
            Self::AuthFailed => "AUTH_FAILED",
            Self::SetupFailed => "SETUP_FAILED",
            Self::TaskFailed => "TASK_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::NotFound => "NOT_FOUND",
            Self::SseFailed => "SSE_FAILED",
        }
    }

    /// The family this code belongs to.
    #[must_use]
    pub fn class(self) -> ErrorClass {
        match self {
            Self::Declined | Self::DepMissing | Self::WorkspaceTooLarge | Self::WorkdirDenied => {
                ErrorClass::Refusal
            }
            Self::SetupFailed | Self::AuthFailed => ErrorClass::Setup,
            Self::TaskFailed => ErrorClass::Task,
            Self::Cancelled | Self::Expired | Self::StartExpired | Self::NotFound
            | Self::SseFailed => ErrorClass::Lifecycle,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ProtocolError
// ---------------------------------------------------------------------------

/// A typed protocol failure: code, message, optional hint.
///
/// This is both the wire shape (inside ERROR messages and `error` events)
/// and the value stored on a failed delegation record. The conflict
/// discriminant never crosses the wire; it only steers local surfaces
/// (the control plane maps conflicts to 409).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProtocolError {
    /// Stable machine-readable code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Optional remediation hint (e.g. which bound was exceeded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// The refusal is a state conflict (occupied applied slot, terminal
    /// delegation), not a malformed request.
    #[serde(skip)]
    conflict: bool,
}

impl ProtocolError {
    /// Create an error with no hint.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hint: None,
            conflict: false,
        }
    }

    /// Attach a hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Returns `true` for refusals caused by conflicting state.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.conflict
    }

    // -- Convenience constructors for common codes ---------------------------

    /// `DECLINED` refusal.
    pub fn declined(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Declined, message)
    }

    /// `DECLINED` refusal caused by conflicting state (an occupied
    /// applied slot, a terminal delegation, a non-pending snapshot).
    pub fn conflict(message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorCode::Declined, message);
        err.conflict = true;
        err
    }

    /// `NOT_FOUND` for an unknown delegation id.
    pub fn not_found(delegation_id: &str) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("unknown delegation: {delegation_id}"),
        )
    }

    /// `CANCELLED` lifecycle error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    /// `SETUP_FAILED` wrapping an underlying cause.
    pub fn setup_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SetupFailed, message)
    }

    /// `TASK_FAILED` wrapping the runner's message.
    pub fn task_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TaskFailed, message)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " ({hint})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ProtocolError {}
