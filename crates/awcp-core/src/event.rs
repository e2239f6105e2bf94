// SPDX-License-Identifier: MIT OR Apache-2.0
//! Executor-to-Delegator event stream vocabulary.
//!
//! Events for one delegation are totally ordered. `status` may repeat;
//! exactly one terminal (`done` or `error`) closes the stream, and a
//! `snapshot` always precedes the terminal that references its id.

use crate::error::{ErrorCode, ProtocolError};
use crate::{SnapshotPayload, TaskOutcome};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One event on a delegation's stream.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecutorEvent {
    /// Informational progress; may repeat any number of times.
    #[serde(rename_all = "camelCase")]
    Status {
        /// Human-readable progress line.
        message: String,
        /// Executor-side substate (e.g. `"running"`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        substate: Option<String>,
    },

    /// A captured work-path state; zero or more per delegation.
    #[serde(rename_all = "camelCase")]
    Snapshot {
        /// Identifier, unique within the delegation.
        snapshot_id: String,
        /// Executor summary of the changes.
        summary: String,
        /// Notable items.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        highlights: Vec<String>,
        /// The materialized state itself.
        payload: SnapshotPayload,
        /// Executor recommends applying this snapshot.
        #[serde(default)]
        recommended: bool,
    },

    /// Terminal success.
    #[serde(rename_all = "camelCase")]
    Done {
        /// What was accomplished.
        summary: String,
        /// Notable items.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        highlights: Vec<String>,
        /// Ids of every snapshot emitted before this event.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        snapshot_ids: Vec<String>,
        /// The snapshot the executor recommends, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recommended_snapshot_id: Option<String>,
    },

    /// Terminal failure.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Stable error code.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
        /// Optional remediation hint.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
}

impl ExecutorEvent {
    /// Returns `true` for `done` and `error`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Wire name of this event's variant (also the SSE event field).
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Snapshot { .. } => "snapshot",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Build the terminal error event from a [`ProtocolError`].
    #[must_use]
    pub fn from_error(err: ProtocolError) -> Self {
        Self::Error {
            code: err.code,
            message: err.message,
            hint: err.hint,
        }
    }

    /// Extract the success outcome from a `done` event.
    #[must_use]
    pub fn outcome(&self) -> Option<TaskOutcome> {
        match self {
            Self::Done {
                summary,
                highlights,
                ..
            } => Some(TaskOutcome {
                summary: summary.clone(),
                highlights: highlights.clone(),
                notes: None,
            }),
            _ => None,
        }
    }
}
