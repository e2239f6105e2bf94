// SPDX-License-Identifier: MIT OR Apache-2.0
//! Post-SSE recovery surface: the body of `GET /tasks/{id}/result`.
//!
//! When a Delegator exhausts its SSE reconnect budget, the Executor's
//! retained completion record stays reachable here for the retention
//! window; `recover` rebuilds the delegation's terminal state from it.

use crate::error::ProtocolError;
use crate::SnapshotPayload;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Where a delegation stands, as reported by the result endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Still executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Error,
    /// Unknown id, or the retention window elapsed.
    NotFound,
    /// Admitted but never started.
    NotApplicable,
}

/// Body of `GET /tasks/{id}/result`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResultResponse {
    /// Where the delegation stands.
    pub status: ResultStatus,
    /// Terminal time, for finished delegations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Success summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Success highlights.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub highlights: Vec<String>,
    /// The captured snapshot, so recovery can still reconcile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_payload: Option<SnapshotPayload>,
    /// Failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProtocolError>,
}

impl ResultResponse {
    /// A response with only the status set.
    #[must_use]
    pub fn bare(status: ResultStatus) -> Self {
        Self {
            status,
            completed_at: None,
            summary: None,
            highlights: Vec::new(),
            snapshot_payload: None,
            error: None,
        }
    }
}
