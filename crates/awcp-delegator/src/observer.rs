// SPDX-License-Identifier: MIT OR Apache-2.0
//! Observer seam for embedding hosts.
//!
//! The engine notifies, the observer reacts; it never calls back into the
//! engine. All methods default to no-ops so hosts implement only what
//! they care about.

use awcp_core::{Delegation, DelegatorState, Snapshot};

/// Lifecycle notifications emitted by the Delegator engine.
pub trait DelegationObserver: Send + Sync {
    /// A delegation record was created and admitted.
    fn on_created(&self, _delegation: &Delegation) {}

    /// The delegation changed state.
    fn on_state_changed(&self, _delegation_id: &str, _state: DelegatorState) {}

    /// A snapshot arrived (any policy).
    fn on_snapshot_received(&self, _delegation_id: &str, _snapshot: &Snapshot) {}

    /// A snapshot was applied into the export tree.
    fn on_snapshot_applied(&self, _delegation_id: &str, _snapshot_id: &str) {}

    /// The delegation reached a terminal state.
    fn on_terminal(&self, _delegation: &Delegation) {}
}

/// The default observer: ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl DelegationObserver for NoopObserver {}
