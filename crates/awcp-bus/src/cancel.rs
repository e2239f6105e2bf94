// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cooperative cancellation for in-flight delegations.
//!
//! One token per delegation, cloned into the lease watchdog, the SSE
//! scope, and the task pipeline. The first recorded reason wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

/// Why a delegation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The Delegator sent an ERROR message.
    DelegatorRequested,
    /// The lease deadline passed.
    LeaseExpired,
    /// The engine is shutting down.
    Shutdown,
}

struct TokenInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
}

/// Cloneable cancellation token; all clones share one state.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// A token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation. Idempotent; only the first reason is kept.
    pub fn cancel(&self, reason: CancelReason) {
        {
            let mut guard = self
                .inner
                .reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if guard.is_none() {
                *guard = Some(reason);
            }
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// The recorded reason, if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        *self
            .inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves when the token is cancelled; immediately if it already is.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            self.inner.notify.notified().await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
