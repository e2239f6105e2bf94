// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Executor protocol engine.
//!
//! One instance serves many delegations. Three maps — `pending`, `active`,
//! `completed` — carry a delegation through
//! `pendingAdmission → accepted → starting → running → terminal`; the
//! admission gate fills `pending`, START moves it to `active` and spawns
//! the run pipeline, and both terminals land in `completed` for the
//! retention window.

use crate::runner::{StatusSink, TaskExecutor, TaskRequest};
use awcp_bus::{CancelReason, CancelToken, EventHub, Subscription};
use awcp_config::AwcpConfig;
use awcp_core::{
    AcceptMessage, AccessMode, Ack, ErrorCode, ErrorMessage, ExecutorConstraints, ExecutorEvent,
    ExecutorState, InviteMessage, Lease, ProtocolError, ProtocolMessage, ResultResponse,
    ResultStatus, SandboxProfile, SnapshotPayload, StartMessage, TaskSpec, TransportHandle,
    WorkDirInfo, new_snapshot_id, validate_environment, PROTOCOL_VERSION,
};
use awcp_transport::ExecutorTransport;
use awcp_workspace::WorkspaceManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long the engine waits for the runner after cancellation before
/// abandoning it and releasing resources anyway.
const RUNNER_GRACE: Duration = Duration::from_secs(2);

/// Tolerated clock skew when the Executor re-reads its own clock against
/// a Delegator-issued lease.
const LEASE_SKEW_GRACE_SECONDS: i64 = 30;

/// Optional user gate consulted after every built-in admission check; a
/// returned message declines the INVITE.
pub type AdmissionHook = Arc<dyn Fn(&InviteMessage) -> Result<(), String> + Send + Sync>;

/// Reply to a `POST /` protocol message.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageReply {
    /// INVITE accepted, or a refusal/cancellation ERROR.
    Message(ProtocolMessage),
    /// START / ERROR acknowledged.
    Ack(Ack),
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Admitted, not yet started.
    pub pending: usize,
    /// Currently executing.
    pub active: usize,
    /// Terminal, within the retention window.
    pub completed: usize,
    /// Configured concurrency cap.
    pub max_concurrent: usize,
    /// Seconds since engine start.
    pub uptime_seconds: u64,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct PendingDelegation {
    invite: InviteMessage,
    work_path: PathBuf,
    accepted_mode: AccessMode,
}

struct ActiveDelegation {
    state: ExecutorState,
    cancel: CancelToken,
    work_path: PathBuf,
}

enum CompletionOutcome {
    Success {
        summary: String,
        highlights: Vec<String>,
        snapshot_ids: Vec<String>,
        payload: Option<SnapshotPayload>,
    },
    Failure(ProtocolError),
}

struct CompletedDelegation {
    outcome: CompletionOutcome,
    completed_at: DateTime<Utc>,
}

#[derive(Default)]
struct EngineMaps {
    pending: HashMap<String, PendingDelegation>,
    active: HashMap<String, ActiveDelegation>,
    completed: HashMap<String, CompletedDelegation>,
}

struct Inner {
    config: AwcpConfig,
    workspace: WorkspaceManager,
    transport: Arc<dyn ExecutorTransport>,
    runner: Arc<dyn TaskExecutor>,
    hub: Arc<EventHub>,
    hook: Option<AdmissionHook>,
    maps: Mutex<EngineMaps>,
    started_at: Instant,
}

impl Inner {
    fn maps(&self) -> std::sync::MutexGuard<'_, EngineMaps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweep_completed(&self, maps: &mut EngineMaps) {
        let retention =
            chrono::Duration::milliseconds(self.config.executor.result_retention_ms as i64);
        let cutoff = Utc::now() - retention;
        maps.completed.retain(|_, rec| rec.completed_at > cutoff);
    }
}

/// The Executor engine; cheap to clone, shared with the HTTP layer.
#[derive(Clone)]
pub struct ExecutorEngine {
    inner: Arc<Inner>,
}

impl ExecutorEngine {
    /// Build an engine: creates the work root, optionally sweeps stale
    /// directories, and initializes the transport adapter.
    ///
    /// # Errors
    ///
    /// Workspace creation or transport initialization failures.
    pub async fn new(
        config: AwcpConfig,
        work_root: impl Into<PathBuf>,
        transport: Arc<dyn ExecutorTransport>,
        runner: Arc<dyn TaskExecutor>,
    ) -> anyhow::Result<Self> {
        let workspace = WorkspaceManager::new(work_root)?;
        if config.lifecycle.cleanup_stale_on_startup {
            let removed = workspace.cleanup_stale()?;
            if removed > 0 {
                info!(target: "awcp.executor", removed, "swept stale work paths at startup");
            }
        }
        transport
            .initialize(workspace.root())
            .await
            .map_err(|e| anyhow::anyhow!("transport initialize: {e}"))?;

        let hub = Arc::new(EventHub::new(
            awcp_bus::DEFAULT_SUBSCRIBER_WATERMARK,
            config.executor.result_retention_ms,
        ));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                workspace,
                transport,
                runner,
                hub,
                hook: None,
                maps: Mutex::new(EngineMaps::default()),
                started_at: Instant::now(),
            }),
        })
    }

    /// Install a user admission hook. Must be called before serving.
    ///
    /// # Panics
    ///
    /// Panics if the engine has already been shared.
    #[must_use]
    pub fn with_admission_hook(mut self, hook: AdmissionHook) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_admission_hook must be called before the engine is shared");
        inner.hook = Some(hook);
        self
    }

    /// The event hub (for the SSE layer and embedded runners).
    #[must_use]
    pub fn hub(&self) -> Arc<EventHub> {
        Arc::clone(&self.inner.hub)
    }

    // -----------------------------------------------------------------------
    // Message dispatch
    // -----------------------------------------------------------------------

    /// Handle one protocol message, producing the synchronous reply.
    pub async fn handle_message(&self, message: ProtocolMessage) -> MessageReply {
        let delegation_id = message.delegation_id().to_string();
        if let Err(err) = message.check_version() {
            return self.error_reply(&delegation_id, err);
        }
        match message {
            ProtocolMessage::Invite(invite) => match self.handle_invite(invite).await {
                Ok(accept) => MessageReply::Message(ProtocolMessage::Accept(accept)),
                Err(err) => self.error_reply(&delegation_id, err),
            },
            ProtocolMessage::Start(start) => match self.handle_start(start) {
                Ok(ack) => MessageReply::Ack(ack),
                Err(err) => self.error_reply(&delegation_id, err),
            },
            ProtocolMessage::Error(error) => match self.handle_peer_error(&error) {
                Ok(ack) => MessageReply::Ack(ack),
                Err(err) => self.error_reply(&delegation_id, err),
            },
            ProtocolMessage::Accept(_) => self.error_reply(
                &delegation_id,
                ProtocolError::declined("ACCEPT is not valid on this endpoint"),
            ),
        }
    }

    fn error_reply(&self, delegation_id: &str, err: ProtocolError) -> MessageReply {
        MessageReply::Message(ProtocolMessage::Error(ErrorMessage::from_protocol_error(
            delegation_id,
            err,
        )))
    }

    // -----------------------------------------------------------------------
    // INVITE
    // -----------------------------------------------------------------------

    async fn handle_invite(&self, invite: InviteMessage) -> Result<AcceptMessage, ProtocolError> {
        let inner = &self.inner;
        let id = invite.delegation_id.clone();

        validate_environment(&invite.environment.resources)?;

        if invite.transport.kind != inner.transport.kind() {
            return Err(ProtocolError::declined(format!(
                "unsupported transport: {}",
                invite.transport.kind
            )));
        }

        let accepted_mode = self.accept_mode(invite.lease.access_mode)?;

        let dep = inner.transport.check_dependency();
        if !dep.available {
            let mut err =
                ProtocolError::new(ErrorCode::DepMissing, "transport dependency unavailable");
            if let Some(hint) = dep.hint {
                err = err.with_hint(hint);
            }
            return Err(err);
        }

        if let Some(hook) = &inner.hook {
            if let Err(reason) = hook(&invite) {
                return Err(ProtocolError::declined(reason));
            }
        }

        // Capacity and duplicate checks and the pending insert happen under
        // one lock so racing INVITEs cannot both squeeze past the cap.
        let work_path = {
            let mut maps = inner.maps();
            inner.sweep_completed(&mut maps);

            if maps.pending.contains_key(&id)
                || maps.active.contains_key(&id)
                || maps.completed.contains_key(&id)
            {
                return Err(ProtocolError::declined(format!(
                    "delegation id already known: {id}"
                )));
            }
            let in_flight = maps.pending.len() + maps.active.len();
            if in_flight >= inner.config.executor.max_concurrent_delegations {
                return Err(ProtocolError::declined(format!(
                    "executor at capacity ({in_flight} delegations in flight)"
                )));
            }

            let work_path = inner.workspace.allocate(&id).map_err(|e| {
                ProtocolError::new(ErrorCode::WorkdirDenied, e.to_string())
            })?;

            maps.pending.insert(
                id.clone(),
                PendingDelegation {
                    invite: invite.clone(),
                    work_path: work_path.clone(),
                    accepted_mode,
                },
            );
            work_path
        };

        inner.hub.register(&id);
        info!(
            target: "awcp.executor",
            delegation = %id,
            mode = %accepted_mode,
            work_path = %work_path.display(),
            "admitted delegation"
        );

        Ok(AcceptMessage {
            version: PROTOCOL_VERSION.into(),
            delegation_id: id,
            executor_work_dir: WorkDirInfo {
                path: work_path.display().to_string(),
            },
            executor_constraints: ExecutorConstraints {
                accepted_access_mode: accepted_mode,
                max_ttl_seconds: inner.config.executor.max_ttl_seconds,
                sandbox_profile: SandboxProfile::default(),
            },
        })
    }

    fn accept_mode(&self, requested: AccessMode) -> Result<AccessMode, ProtocolError> {
        let allowed = &self.inner.config.executor.allowed_access_modes;
        if allowed.contains(&requested) {
            return Ok(requested);
        }
        // rw may be downgraded to ro; an ro request has nothing to fall to.
        if requested == AccessMode::Rw && allowed.contains(&AccessMode::Ro) {
            return Ok(AccessMode::Ro);
        }
        Err(ProtocolError::declined(format!(
            "access mode {requested} not allowed"
        )))
    }

    // -----------------------------------------------------------------------
    // START
    // -----------------------------------------------------------------------

    fn handle_start(&self, start: StartMessage) -> Result<Ack, ProtocolError> {
        let inner = &self.inner;
        let id = start.delegation_id.clone();

        let pending = {
            let mut maps = inner.maps();
            if maps.active.contains_key(&id) {
                return Err(ProtocolError::declined(format!(
                    "delegation already started: {id}"
                )));
            }
            maps.pending
                .remove(&id)
                .ok_or_else(|| ProtocolError::not_found(&id))?
        };

        // The lease may not exceed what admission granted.
        if start.lease.access_mode == AccessMode::Rw && pending.accepted_mode == AccessMode::Ro {
            inner.hub.discard(&id);
            inner.workspace.release(&id);
            return Err(ProtocolError::declined(
                "lease requests rw but admission granted ro",
            ));
        }

        if start
            .lease
            .is_expired_at(Utc::now(), LEASE_SKEW_GRACE_SECONDS)
        {
            inner.hub.discard(&id);
            inner.workspace.release(&id);
            return Err(ProtocolError::new(
                ErrorCode::StartExpired,
                format!("lease already expired at {}", start.lease.expires_at),
            ));
        }

        let cancel = CancelToken::new();
        {
            let mut maps = inner.maps();
            maps.active.insert(
                id.clone(),
                ActiveDelegation {
                    state: ExecutorState::Starting,
                    cancel: cancel.clone(),
                    work_path: pending.work_path.clone(),
                },
            );
        }

        let ctx = RunContext {
            delegation_id: id.clone(),
            task: pending.invite.task.clone(),
            environment: pending.invite.environment.resources.clone(),
            lease: start.lease,
            handle: start.work_dir,
            work_path: pending.work_path,
            cancel,
        };
        let inner_for_task = Arc::clone(inner);
        tokio::spawn(run_pipeline(inner_for_task, ctx));

        debug!(target: "awcp.executor", delegation = %id, "started run pipeline");
        Ok(Ack::yes())
    }

    // -----------------------------------------------------------------------
    // ERROR (peer cancellation)
    // -----------------------------------------------------------------------

    fn handle_peer_error(&self, error: &ErrorMessage) -> Result<Ack, ProtocolError> {
        let inner = &self.inner;
        let id = &error.delegation_id;

        let cancel = {
            let mut maps = inner.maps();
            if let Some(active) = maps.active.get(id) {
                Some(active.cancel.clone())
            } else if maps.pending.remove(id).is_some() {
                // Admitted but never started: drop the admission quietly.
                inner.hub.discard(id);
                inner.workspace.release(id);
                info!(target: "awcp.executor", delegation = %id, "discarded admission on peer error");
                None
            } else {
                return Err(ProtocolError::not_found(id));
            }
        };

        if let Some(cancel) = cancel {
            info!(
                target: "awcp.executor",
                delegation = %id,
                code = %error.code,
                "cancelling on peer error"
            );
            cancel.cancel(CancelReason::DelegatorRequested);
        }
        Ok(Ack::yes())
    }

    // -----------------------------------------------------------------------
    // Read surfaces
    // -----------------------------------------------------------------------

    /// Attach to a delegation's event stream.
    #[must_use]
    pub fn subscribe(&self, delegation_id: &str) -> Subscription {
        self.inner.hub.subscribe(delegation_id)
    }

    /// Post-SSE recovery: the retained terminal state, if any.
    #[must_use]
    pub fn result(&self, delegation_id: &str) -> ResultResponse {
        let inner = &self.inner;
        let mut maps = inner.maps();
        inner.sweep_completed(&mut maps);

        if maps.active.contains_key(delegation_id) {
            return ResultResponse::bare(ResultStatus::Running);
        }
        if maps.pending.contains_key(delegation_id) {
            return ResultResponse::bare(ResultStatus::NotApplicable);
        }
        match maps.completed.get(delegation_id) {
            Some(rec) => match &rec.outcome {
                CompletionOutcome::Success {
                    summary,
                    highlights,
                    payload,
                    ..
                } => ResultResponse {
                    status: ResultStatus::Completed,
                    completed_at: Some(rec.completed_at),
                    summary: Some(summary.clone()),
                    highlights: highlights.clone(),
                    snapshot_payload: payload.clone(),
                    error: None,
                },
                CompletionOutcome::Failure(err) => ResultResponse {
                    status: ResultStatus::Error,
                    completed_at: Some(rec.completed_at),
                    summary: None,
                    highlights: Vec::new(),
                    snapshot_payload: None,
                    error: Some(err.clone()),
                },
            },
            None => ResultResponse::bare(ResultStatus::NotFound),
        }
    }

    /// Aggregate counters for `GET /status`.
    #[must_use]
    pub fn status(&self) -> StatusReport {
        let inner = &self.inner;
        let mut maps = inner.maps();
        inner.sweep_completed(&mut maps);
        StatusReport {
            pending: maps.pending.len(),
            active: maps.active.len(),
            completed: maps.completed.len(),
            max_concurrent: inner.config.executor.max_concurrent_delegations,
            uptime_seconds: inner.started_at.elapsed().as_secs(),
        }
    }

    /// Cancel everything in flight and shut the transport down.
    ///
    /// Active pipelines observe their tokens and release their own
    /// resources; pending admissions are dropped immediately.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.config.lifecycle.cleanup_on_shutdown {
            let (pending_ids, tokens) = {
                let mut maps = inner.maps();
                let pending_ids: Vec<String> = maps.pending.keys().cloned().collect();
                for id in &pending_ids {
                    maps.pending.remove(id);
                }
                let tokens: Vec<CancelToken> =
                    maps.active.values().map(|a| a.cancel.clone()).collect();
                (pending_ids, tokens)
            };
            for id in &pending_ids {
                inner.hub.discard(id);
                inner.workspace.release(id);
            }
            for token in tokens {
                token.cancel(CancelReason::Shutdown);
            }
        }
        if let Err(err) = inner.transport.shutdown().await {
            warn!(target: "awcp.executor", error = %err, "transport shutdown failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Run pipeline
// ---------------------------------------------------------------------------

struct RunContext {
    delegation_id: String,
    task: TaskSpec,
    environment: Vec<awcp_core::Resource>,
    lease: Lease,
    handle: TransportHandle,
    work_path: PathBuf,
    cancel: CancelToken,
}

enum RunEnd {
    Report(Result<crate::runner::TaskReport, crate::runner::TaskRunError>),
    Cancelled,
    Expired,
}

async fn run_pipeline(inner: Arc<Inner>, ctx: RunContext) {
    let id = ctx.delegation_id.clone();

    let actual_path = match setup_workspace(&inner, &ctx).await {
        Ok(path) => path,
        Err(err) => {
            finish(&inner, &id, &ctx.work_path, CompletionOutcome::Failure(err)).await;
            return;
        }
    };

    set_active_state(&inner, &id, ExecutorState::Running);
    inner.hub.publish(
        &id,
        ExecutorEvent::Status {
            message: "task running".into(),
            substate: Some("running".into()),
        },
    );

    let snapshot_sink = crate::runner::SnapshotSink::new(
        Arc::clone(&inner.hub),
        Arc::clone(&inner.transport),
        id.clone(),
        actual_path.clone(),
    );
    let request = TaskRequest {
        delegation_id: id.clone(),
        work_path: actual_path.clone(),
        task: ctx.task.clone(),
        environment: ctx.environment.clone(),
        status: StatusSink::new(Arc::clone(&inner.hub), id.clone()),
        snapshots: snapshot_sink.clone(),
        cancel: ctx.cancel.clone(),
    };
    let runner = Arc::clone(&inner.runner);
    let mut task = tokio::spawn(async move { runner.run(request).await });

    let deadline = deadline_from(ctx.lease.expires_at);
    let end = tokio::select! {
        res = &mut task => RunEnd::Report(res.unwrap_or_else(|e| {
            Err(crate::runner::TaskRunError::new(format!("task panicked: {e}")))
        })),
        () = ctx.cancel.cancelled() => {
            let _ = tokio::time::timeout(RUNNER_GRACE, &mut task).await;
            task.abort();
            match ctx.cancel.reason() {
                Some(CancelReason::LeaseExpired) => RunEnd::Expired,
                _ => RunEnd::Cancelled,
            }
        }
        () = tokio::time::sleep(deadline) => {
            ctx.cancel.cancel(CancelReason::LeaseExpired);
            let _ = tokio::time::timeout(RUNNER_GRACE, &mut task).await;
            task.abort();
            RunEnd::Expired
        }
    };

    let outcome = match end {
        RunEnd::Report(Ok(report)) => {
            let emitted = snapshot_sink.emitted();
            if emitted.is_empty() {
                // End-of-run capture, unless the runner snapshotted itself.
                match inner.transport.capture_snapshot(&id, &actual_path).await {
                    Ok(Some(payload)) => {
                        let snapshot_id = new_snapshot_id();
                        inner.hub.publish(
                            &id,
                            ExecutorEvent::Snapshot {
                                snapshot_id: snapshot_id.clone(),
                                summary: report.summary.clone(),
                                highlights: report.highlights.clone(),
                                payload: payload.clone(),
                                recommended: true,
                            },
                        );
                        CompletionOutcome::Success {
                            summary: report.summary,
                            highlights: report.highlights,
                            snapshot_ids: vec![snapshot_id],
                            payload: Some(payload),
                        }
                    }
                    Ok(None) => CompletionOutcome::Success {
                        summary: report.summary,
                        highlights: report.highlights,
                        snapshot_ids: Vec::new(),
                        payload: None,
                    },
                    Err(err) => CompletionOutcome::Failure(err.to_protocol_error()),
                }
            } else {
                CompletionOutcome::Success {
                    summary: report.summary,
                    highlights: report.highlights,
                    snapshot_ids: emitted,
                    payload: snapshot_sink.last_payload(),
                }
            }
        }
        RunEnd::Report(Err(err)) => {
            CompletionOutcome::Failure(ProtocolError::task_failed(err.message))
        }
        RunEnd::Cancelled => {
            CompletionOutcome::Failure(ProtocolError::cancelled("cancelled by delegator"))
        }
        RunEnd::Expired => CompletionOutcome::Failure(ProtocolError::new(
            ErrorCode::Expired,
            "lease expired during execution",
        )),
    };

    finish(&inner, &id, &actual_path, outcome).await;
}

async fn setup_workspace(inner: &Inner, ctx: &RunContext) -> Result<PathBuf, ProtocolError> {
    inner
        .workspace
        .prepare(&ctx.work_path)
        .map_err(|e| ProtocolError::setup_failed(e.to_string()))?;

    let actual = inner
        .transport
        .setup(&ctx.delegation_id, &ctx.handle, &ctx.work_path)
        .await
        .map_err(|e| e.to_protocol_error())?;

    // The materialized tree must carry a manifest from a compatible peer.
    let manifest = awcp_materialize::read_manifest(&actual)
        .map_err(|e| ProtocolError::setup_failed(e.to_string()))?;
    if manifest.protocol_version != PROTOCOL_VERSION {
        return Err(ProtocolError::setup_failed(format!(
            "export manifest version {} does not match {}",
            manifest.protocol_version, PROTOCOL_VERSION
        )));
    }

    Ok(actual)
}

fn set_active_state(inner: &Inner, id: &str, state: ExecutorState) {
    let mut maps = inner.maps();
    if let Some(active) = maps.active.get_mut(id) {
        if active.state.can_transition_to(state) {
            active.state = state;
        }
    }
}

fn deadline_from(expires_at: DateTime<Utc>) -> Duration {
    let grace = chrono::Duration::seconds(LEASE_SKEW_GRACE_SECONDS);
    (expires_at + grace - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Both terminals funnel here: release transport and workspace (failures
/// logged, never masking the outcome), move the record to `completed`,
/// and publish the terminal event.
async fn finish(inner: &Inner, id: &str, work_path: &std::path::Path, outcome: CompletionOutcome) {
    if let Err(err) = inner.transport.release(id, work_path).await {
        warn!(target: "awcp.executor", delegation = %id, error = %err, "transport release failed");
    }
    inner.workspace.release(id);

    let (terminal, final_state) = match &outcome {
        CompletionOutcome::Success {
            summary,
            highlights,
            snapshot_ids,
            ..
        } => (
            ExecutorEvent::Done {
                summary: summary.clone(),
                highlights: highlights.clone(),
                snapshot_ids: snapshot_ids.clone(),
                recommended_snapshot_id: snapshot_ids.last().cloned(),
            },
            ExecutorState::Completed,
        ),
        CompletionOutcome::Failure(err) => {
            let state = match err.code {
                ErrorCode::Cancelled | ErrorCode::Expired => ExecutorState::Cancelled,
                _ => ExecutorState::Failed,
            };
            (ExecutorEvent::from_error(err.clone()), state)
        }
    };

    {
        let mut maps = inner.maps();
        maps.active.remove(id);
        maps.completed.insert(
            id.to_string(),
            CompletedDelegation {
                outcome,
                completed_at: Utc::now(),
            },
        );
    }

    info!(target: "awcp.executor", delegation = %id, state = %final_state, "delegation finished");
    inner.hub.publish(id, terminal);
}
