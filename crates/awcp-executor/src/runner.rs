// SPDX-License-Identifier: MIT OR Apache-2.0
//! The injected task-runner seam.
//!
//! The engine treats the runner as a single async function from a
//! materialized work path to a summary. Progress flows out through a
//! write-only [`StatusSink`]; the runner never holds a reference to the
//! engine. Cancellation is cooperative via the provided token.

use async_trait::async_trait;
use awcp_bus::{CancelToken, EventHub};
use awcp_core::{ExecutorEvent, Resource, TaskSpec, new_snapshot_id};
use awcp_transport::ExecutorTransport;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

/// Everything a runner gets for one delegation.
pub struct TaskRequest {
    /// The delegation being executed.
    pub delegation_id: String,
    /// Materialized work path (the adapter's `setup` return value).
    pub work_path: PathBuf,
    /// The task, opaque to the engine.
    pub task: TaskSpec,
    /// The delegated environment, for runners that care about modes.
    pub environment: Vec<Resource>,
    /// Write-only progress sink.
    pub status: StatusSink,
    /// Intermediate snapshot capture; most runners never touch it.
    pub snapshots: SnapshotSink,
    /// Cooperative cancellation; observed at the runner's discretion.
    pub cancel: CancelToken,
}

/// What a successful run reports back.
#[derive(Debug, Clone)]
pub struct TaskReport {
    /// What was accomplished.
    pub summary: String,
    /// Notable items, in runner order.
    pub highlights: Vec<String>,
}

/// A runner failure; the message becomes the `TASK_FAILED` error message.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TaskRunError {
    /// Failure detail.
    pub message: String,
}

impl TaskRunError {
    /// Build a failure from any displayable cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The injected component that performs the delegated work.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the task against the materialized work path.
    ///
    /// # Errors
    ///
    /// Any failure surfaces to the Delegator as `TASK_FAILED`.
    async fn run(&self, request: TaskRequest) -> Result<TaskReport, TaskRunError>;
}

// ---------------------------------------------------------------------------
// StatusSink
// ---------------------------------------------------------------------------

/// Write-only handle for publishing `status` events from inside a run.
#[derive(Clone)]
pub struct StatusSink {
    hub: Arc<EventHub>,
    delegation_id: String,
}

impl StatusSink {
    pub(crate) fn new(hub: Arc<EventHub>, delegation_id: impl Into<String>) -> Self {
        Self {
            hub,
            delegation_id: delegation_id.into(),
        }
    }

    /// Publish a progress line.
    pub fn status(&self, message: impl Into<String>, substate: Option<&str>) {
        self.hub.publish(
            &self.delegation_id,
            ExecutorEvent::Status {
                message: message.into(),
                substate: substate.map(str::to_string),
            },
        );
    }
}

impl std::fmt::Debug for StatusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusSink")
            .field("delegation_id", &self.delegation_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// SnapshotSink
// ---------------------------------------------------------------------------

struct SnapshotSinkInner {
    hub: Arc<EventHub>,
    transport: Arc<dyn ExecutorTransport>,
    delegation_id: String,
    work_path: PathBuf,
    emitted: Mutex<Vec<String>>,
    last_payload: Mutex<Option<awcp_core::SnapshotPayload>>,
}

/// Write-only handle for emitting intermediate snapshots mid-run.
///
/// Each capture packs the current work-path state through the transport
/// adapter and publishes a `snapshot` event. The engine lists every
/// emitted id in the final `done` event; when a runner emits at least one
/// snapshot itself, the end-of-run capture is skipped.
#[derive(Clone)]
pub struct SnapshotSink {
    inner: Arc<SnapshotSinkInner>,
}

impl SnapshotSink {
    pub(crate) fn new(
        hub: Arc<EventHub>,
        transport: Arc<dyn ExecutorTransport>,
        delegation_id: impl Into<String>,
        work_path: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(SnapshotSinkInner {
                hub,
                transport,
                delegation_id: delegation_id.into(),
                work_path,
                emitted: Mutex::new(Vec::new()),
                last_payload: Mutex::new(None),
            }),
        }
    }

    /// Capture the current work-path state and emit it as a snapshot.
    ///
    /// Returns the minted snapshot id, or `None` on a live-sync transport
    /// (which has nothing to convey).
    ///
    /// # Errors
    ///
    /// Transport capture failures.
    pub async fn capture(
        &self,
        summary: impl Into<String>,
        highlights: Vec<String>,
        recommended: bool,
    ) -> Result<Option<String>, TaskRunError> {
        let inner = &self.inner;
        let payload = inner
            .transport
            .capture_snapshot(&inner.delegation_id, &inner.work_path)
            .await
            .map_err(|e| TaskRunError::new(e.to_string()))?;
        let Some(payload) = payload else {
            return Ok(None);
        };

        let snapshot_id = new_snapshot_id();
        inner.hub.publish(
            &inner.delegation_id,
            ExecutorEvent::Snapshot {
                snapshot_id: snapshot_id.clone(),
                summary: summary.into(),
                highlights,
                payload: payload.clone(),
                recommended,
            },
        );
        inner
            .emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(snapshot_id.clone());
        *inner
            .last_payload
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(payload);
        Ok(Some(snapshot_id))
    }

    /// Ids emitted so far, in order.
    #[must_use]
    pub fn emitted(&self) -> Vec<String> {
        self.inner
            .emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The most recently captured payload, retained for result recovery.
    #[must_use]
    pub fn last_payload(&self) -> Option<awcp_core::SnapshotPayload> {
        self.inner
            .last_payload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for SnapshotSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotSink")
            .field("delegation_id", &self.inner.delegation_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Stock runners
// ---------------------------------------------------------------------------

/// Placeholder runner for deployments that wire the real task execution
/// in separately: reports the task description back as the summary and
/// touches nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoTaskExecutor;

#[async_trait]
impl TaskExecutor for EchoTaskExecutor {
    async fn run(&self, request: TaskRequest) -> Result<TaskReport, TaskRunError> {
        request.status.status("echoing task", Some("running"));
        Ok(TaskReport {
            summary: format!("echo: {}", request.task.description),
            highlights: Vec::new(),
        })
    }
}

type BoxedRun = dyn Fn(TaskRequest) -> Pin<Box<dyn Future<Output = Result<TaskReport, TaskRunError>> + Send>>
    + Send
    + Sync;

/// Adapter turning a closure into a [`TaskExecutor`]; handy for embedding
/// and for tests.
pub struct FnTaskExecutor {
    run: Box<BoxedRun>,
}

impl FnTaskExecutor {
    /// Wrap a closure returning a boxed future.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskReport, TaskRunError>> + Send + 'static,
    {
        Self {
            run: Box::new(move |req| Box::pin(f(req))),
        }
    }
}

#[async_trait]
impl TaskExecutor for FnTaskExecutor {
    async fn run(&self, request: TaskRequest) -> Result<TaskReport, TaskRunError> {
        (self.run)(request).await
    }
}

impl std::fmt::Debug for FnTaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTaskExecutor").finish_non_exhaustive()
    }
}
