// SPDX-License-Identifier: MIT OR Apache-2.0
//! The two coordinated state machines.
//!
//! Transitions are monotonic: once a terminal state is reached no further
//! transitions are valid on either side.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Delegator
// ---------------------------------------------------------------------------

/// Delegation lifecycle as seen by the Delegator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DelegatorState {
    /// Record persisted; admission and materialization not yet done.
    Created,
    /// INVITE sent, awaiting the synchronous ACCEPT/ERROR.
    Invited,
    /// ACCEPT received; executor constraints merged.
    Accepted,
    /// START sent and acknowledged.
    Started,
    /// Executor reported progress.
    Running,
    /// Terminal: task finished, result recorded.
    Completed,
    /// Terminal: failure recorded.
    Error,
    /// Terminal: cancelled by this side.
    Cancelled,
    /// Terminal: lease expired before completion.
    Expired,
}

impl DelegatorState {
    /// Returns `true` for the four terminal states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error | Self::Cancelled | Self::Expired
        )
    }

    /// Valid successor states.
    #[must_use]
    pub fn valid_transitions(self) -> &'static [DelegatorState] {
        match self {
            Self::Created => &[Self::Invited, Self::Error, Self::Cancelled],
            Self::Invited => &[Self::Accepted, Self::Error, Self::Cancelled],
            Self::Accepted => &[Self::Started, Self::Error, Self::Cancelled],
            Self::Started => &[
                Self::Running,
                Self::Completed,
                Self::Error,
                Self::Cancelled,
                Self::Expired,
            ],
            Self::Running => &[
                Self::Completed,
                Self::Error,
                Self::Cancelled,
                Self::Expired,
            ],
            Self::Completed | Self::Error | Self::Cancelled | Self::Expired => &[],
        }
    }

    /// Returns `true` if `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: DelegatorState) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for DelegatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Invited => "invited",
            Self::Accepted => "accepted",
            Self::Started => "started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Delegation lifecycle as seen by the Executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ExecutorState {
    /// INVITE passed the admission gate; waiting for START.
    PendingAdmission,
    /// Admission recorded, work path allocated.
    Accepted,
    /// START received; workspace and transport setup in flight.
    Starting,
    /// Task runner invoked.
    Running,
    /// Terminal: done emitted.
    Completed,
    /// Terminal: error emitted.
    Failed,
    /// Terminal: Delegator cancelled or lease expired.
    Cancelled,
}

impl ExecutorState {
    /// Returns `true` for the three terminal states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Valid successor states.
    #[must_use]
    pub fn valid_transitions(self) -> &'static [ExecutorState] {
        match self {
            Self::PendingAdmission => &[Self::Accepted, Self::Cancelled],
            Self::Accepted => &[Self::Starting, Self::Cancelled],
            Self::Starting => &[Self::Running, Self::Failed, Self::Cancelled],
            Self::Running => &[Self::Completed, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    /// Returns `true` if `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: ExecutorState) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PendingAdmission => "pendingAdmission",
            Self::Accepted => "accepted",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
