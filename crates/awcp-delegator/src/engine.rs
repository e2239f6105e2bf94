// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Delegator protocol engine.
//!
//! `create` admits and materializes; `delegate` runs the INVITE/START
//! handshake and leaves two background tasks per delegation: the SSE
//! subscription (with linear-backoff reconnect) and the lease watchdog.
//! Every record mutation is persisted before the next protocol step; the
//! per-record async lock is the only per-delegation serialization point.

use crate::client::{EventStream, PeerClient, PeerReply};
use crate::observer::{DelegationObserver, NoopObserver};
use awcp_admission::AdmissionPolicy;
use awcp_bus::{CancelReason, CancelToken};
use awcp_config::AwcpConfig;
use awcp_core::{
    Delegation, DelegatorState, EnvironmentSpec, ErrorCode, ErrorMessage, ExecutorEvent,
    InviteMessage, Lease, LeaseRequest, ProtocolError, ProtocolMessage, Resource, ResultStatus,
    SnapshotPolicy, SnapshotPayload, StartMessage, TaskSpec, TransportDescriptor,
    new_delegation_id, new_snapshot_id, validate_environment, PROTOCOL_VERSION,
};
use awcp_glob::SensitiveMatcher;
use awcp_snapshot::{Disposition, ReceivedSnapshot, SnapshotError, SnapshotStore};
use awcp_store::DelegationStore;
use awcp_transport::DelegatorTransport;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Parameters for creating a delegation; unset fields take the
/// configured defaults.
#[derive(Debug, Clone)]
pub struct CreateDelegation {
    /// Executor base URL.
    pub peer_url: String,
    /// The task to delegate.
    pub task: TaskSpec,
    /// Resources to hand over.
    pub environment: Vec<Resource>,
    /// Lease request; defaults from configuration.
    pub lease: Option<LeaseRequest>,
    /// Snapshot policy; defaults from configuration.
    pub snapshot_policy: Option<SnapshotPolicy>,
}

#[derive(Clone)]
struct DelegationEntry {
    record: Arc<Mutex<Delegation>>,
    cancel: CancelToken,
}

struct Inner {
    config: AwcpConfig,
    base_dir: PathBuf,
    store: DelegationStore,
    snapshots: SnapshotStore,
    transport: Arc<dyn DelegatorTransport>,
    client: PeerClient,
    observer: Arc<dyn DelegationObserver>,
    entries: StdMutex<HashMap<String, DelegationEntry>>,
}

impl Inner {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, DelegationEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, id: &str) -> Result<DelegationEntry, ProtocolError> {
        self.entries()
            .get(id)
            .cloned()
            .ok_or_else(|| ProtocolError::not_found(id))
    }

    fn persist(&self, record: &Delegation) {
        if let Err(err) = self.store.save(record) {
            warn!(target: "awcp.delegator", delegation = %record.id, error = %err, "failed to persist delegation record");
        }
    }

    fn export_root(&self, id: &str) -> PathBuf {
        self.base_dir.join("environments").join(id)
    }

    fn admission_policy(&self) -> Result<AdmissionPolicy, ProtocolError> {
        let sensitive = SensitiveMatcher::compile(&self.config.admission.sensitive_patterns)
            .map_err(|e| ProtocolError::declined(format!("sensitive patterns: {e}")))?;
        Ok(AdmissionPolicy {
            max_total_bytes: self.config.admission.max_total_bytes,
            max_file_count: self.config.admission.max_file_count,
            max_single_file_bytes: self.config.admission.max_single_file_bytes,
            sensitive,
            skip_sensitive_check: self.config.admission.skip_sensitive_check,
        })
    }

    async fn release_transport(&self, id: &str) {
        if let Err(err) = self.transport.release(id).await {
            warn!(target: "awcp.delegator", delegation = %id, error = %err, "transport release failed");
        }
    }
}

/// The Delegator engine; cheap to clone, shared with the control plane.
#[derive(Clone)]
pub struct DelegatorEngine {
    inner: Arc<Inner>,
}

impl DelegatorEngine {
    /// Build an engine over `base_dir` (records, exports, and staged
    /// snapshots live underneath), re-loading persisted records and
    /// sweeping stale snapshot directories.
    ///
    /// # Errors
    ///
    /// Store/transport initialization failures.
    pub async fn new(
        config: AwcpConfig,
        base_dir: impl Into<PathBuf>,
        transport: Arc<dyn DelegatorTransport>,
    ) -> anyhow::Result<Self> {
        let base_dir = base_dir.into();
        let store = DelegationStore::open(&base_dir)?;
        let snapshots = SnapshotStore::open(&base_dir)?;
        let client = PeerClient::new(Duration::from_millis(
            config.delegation.request_timeout_ms,
        ))
        .map_err(|e| anyhow::anyhow!("build http client: {e}"))?;

        transport
            .initialize()
            .await
            .map_err(|e| anyhow::anyhow!("transport initialize: {e}"))?;

        let mut entries = HashMap::new();
        for record in store.load_all()? {
            entries.insert(
                record.id.clone(),
                DelegationEntry {
                    record: Arc::new(Mutex::new(record)),
                    cancel: CancelToken::new(),
                },
            );
        }
        if !entries.is_empty() {
            info!(target: "awcp.delegator", count = entries.len(), "re-loaded delegation records");
        }

        if config.lifecycle.cleanup_stale_on_startup {
            let live: Vec<String> = entries.keys().cloned().collect();
            let removed = snapshots.sweep_stale(&live)?;
            if removed > 0 {
                info!(target: "awcp.delegator", removed, "swept stale snapshot dirs");
            }
        }

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                base_dir,
                store,
                snapshots,
                transport,
                client,
                observer: Arc::new(NoopObserver),
                entries: StdMutex::new(entries),
            }),
        })
    }

    /// Install an observer. Must be called before the engine is shared.
    ///
    /// # Panics
    ///
    /// Panics if the engine has already been cloned.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn DelegationObserver>) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_observer must be called before the engine is shared");
        inner.observer = observer;
        self
    }

    // -----------------------------------------------------------------------
    // create
    // -----------------------------------------------------------------------

    /// Create a delegation: validate, persist, admit, materialize.
    ///
    /// A refusal leaves the record in `error` with nothing materialized.
    ///
    /// # Errors
    ///
    /// Admission refusals (`WORKSPACE_TOO_LARGE`, `DECLINED`) and
    /// materialization failures.
    pub async fn create(&self, params: CreateDelegation) -> Result<Delegation, ProtocolError> {
        let inner = &self.inner;
        validate_environment(&params.environment)?;

        let id = new_delegation_id();
        let lease = params.lease.unwrap_or(LeaseRequest {
            ttl_seconds: inner.config.delegation.ttl_seconds,
            access_mode: inner.config.delegation.access_mode,
        });
        let policy = params
            .snapshot_policy
            .unwrap_or(inner.config.delegation.snapshot_mode);

        let mut record = Delegation::new(
            id.clone(),
            params.peer_url,
            params.task,
            params.environment,
            lease,
            policy,
        );
        inner.persist(&record);
        let entry = DelegationEntry {
            record: Arc::new(Mutex::new(record.clone())),
            cancel: CancelToken::new(),
        };
        inner.entries().insert(id.clone(), entry.clone());

        // Admission walks the sources; a refusal materializes nothing.
        let admission = inner.admission_policy()?;
        let report = match awcp_admission::scan(&record.environment, &admission) {
            Ok(report) => report,
            Err(err) => {
                let proto = err.to_protocol_error();
                let mut guard = entry.record.lock().await;
                guard.error = Some(proto.clone());
                let _ = guard.transition(DelegatorState::Error);
                inner.persist(&guard);
                return Err(proto);
            }
        };

        let export_root = inner.export_root(&id);
        if let Err(err) =
            awcp_materialize::materialize_export(&id, &record.environment, &export_root)
        {
            let proto = ProtocolError::setup_failed(err.to_string());
            let mut guard = entry.record.lock().await;
            guard.error = Some(proto.clone());
            let _ = guard.transition(DelegatorState::Error);
            inner.persist(&guard);
            return Err(proto);
        }

        {
            let mut guard = entry.record.lock().await;
            guard.admission = Some(report);
            guard.export_path = Some(export_root);
            guard.touch();
            inner.persist(&guard);
            record = guard.clone();
        }

        info!(
            target: "awcp.delegator",
            delegation = %id,
            files = report.file_count,
            bytes = report.total_bytes,
            "delegation created"
        );
        inner.observer.on_created(&record);
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // delegate
    // -----------------------------------------------------------------------

    /// Drive the handshake: INVITE → ACCEPT merge → prepare → START, then
    /// spawn the SSE subscription and the lease watchdog.
    ///
    /// # Errors
    ///
    /// Executor refusals and transport failures; the record carries the
    /// same error.
    pub async fn delegate(&self, delegation_id: &str) -> Result<(), ProtocolError> {
        let inner = &self.inner;
        let entry = inner.entry(delegation_id)?;
        let mut record = entry.record.lock().await;

        if record.state != DelegatorState::Created {
            return Err(ProtocolError::conflict(format!(
                "delegation is {}, expected created",
                record.state
            )));
        }
        let export_path = record
            .export_path
            .clone()
            .ok_or_else(|| ProtocolError::setup_failed("no export materialized"))?;

        let invite = ProtocolMessage::Invite(InviteMessage {
            version: PROTOCOL_VERSION.into(),
            delegation_id: record.id.clone(),
            task: record.task.clone(),
            lease: record.lease_requested,
            environment: EnvironmentSpec {
                resources: record.environment.clone(),
            },
            transport: TransportDescriptor::new(inner.transport.kind()),
        });
        record.transition(DelegatorState::Invited)?;
        inner.persist(&record);

        let reply = match inner.client.send(&record.peer_url, &invite).await {
            Ok(reply) => reply,
            Err(err) => {
                let proto = ProtocolError::setup_failed(format!("INVITE failed: {err}"));
                return Err(self.fail_locked(&mut record, proto, true).await);
            }
        };

        let accept = match reply {
            PeerReply::Message(ProtocolMessage::Accept(accept)) => accept,
            PeerReply::Message(ProtocolMessage::Error(err_msg)) => {
                let proto = err_msg.to_protocol_error();
                return Err(self.fail_locked(&mut record, proto, true).await);
            }
            other => {
                let proto = ProtocolError::setup_failed(format!(
                    "unexpected INVITE reply: {other:?}"
                ));
                return Err(self.fail_locked(&mut record, proto, true).await);
            }
        };

        // Merge executor constraints: clamp the TTL down, adopt the
        // granted access mode even when downgraded.
        let ttl = record
            .lease_requested
            .ttl_seconds
            .min(accept.executor_constraints.max_ttl_seconds);
        let mode = accept.executor_constraints.accepted_access_mode;
        record.transition(DelegatorState::Accepted)?;
        inner.persist(&record);
        debug!(
            target: "awcp.delegator",
            delegation = %record.id,
            ttl,
            mode = %mode,
            executor_work_dir = %accept.executor_work_dir.path,
            "executor accepted"
        );

        let handle = match inner
            .transport
            .prepare(&record.id, &export_path, ttl)
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                let proto = err.to_protocol_error();
                return Err(self.fail_locked(&mut record, proto, true).await);
            }
        };

        let lease = Lease {
            expires_at: Utc::now() + chrono::Duration::seconds(ttl as i64),
            access_mode: mode,
        };
        record.transport_handle = Some(handle.clone());
        record.lease_active = Some(lease);
        inner.persist(&record);

        // Attach to the event stream before START: the Executor's bus has
        // existed since admission, so a subscription opened now can never
        // miss an event the run publishes.
        let initial_stream = match inner.client.events(&record.peer_url, &record.id).await {
            Ok(stream) => Some(stream),
            Err(err) => {
                warn!(target: "awcp.delegator", delegation = %record.id, error = %err, "pre-START event subscribe failed");
                None
            }
        };

        let start = ProtocolMessage::Start(StartMessage {
            version: PROTOCOL_VERSION.into(),
            delegation_id: record.id.clone(),
            lease,
            work_dir: handle,
        });
        match inner.client.send(&record.peer_url, &start).await {
            Ok(PeerReply::Ack(ack)) if ack.ok => {}
            Ok(PeerReply::Message(ProtocolMessage::Error(err_msg))) => {
                let proto = err_msg.to_protocol_error();
                inner.release_transport(&record.id).await;
                return Err(self.fail_locked(&mut record, proto, true).await);
            }
            Ok(other) => {
                let proto =
                    ProtocolError::setup_failed(format!("unexpected START reply: {other:?}"));
                inner.release_transport(&record.id).await;
                return Err(self.fail_locked(&mut record, proto, true).await);
            }
            Err(err) => {
                let proto = ProtocolError::setup_failed(format!("START failed: {err}"));
                inner.release_transport(&record.id).await;
                return Err(self.fail_locked(&mut record, proto, true).await);
            }
        }

        record.transition(DelegatorState::Started)?;
        inner.persist(&record);
        inner
            .observer
            .on_state_changed(&record.id, DelegatorState::Started);

        let id = record.id.clone();
        let peer_url = record.peer_url.clone();
        drop(record);

        tokio::spawn(subscription_loop(
            Arc::clone(&self.inner),
            id.clone(),
            peer_url,
            entry.cancel.clone(),
            initial_stream,
        ));
        tokio::spawn(lease_watchdog(
            Arc::clone(&self.inner),
            id,
            lease.expires_at,
            entry.cancel.clone(),
        ));
        Ok(())
    }

    /// `create` followed by `delegate`; returns the delegation id.
    ///
    /// # Errors
    ///
    /// Propagates either step's failure.
    pub async fn run(&self, params: CreateDelegation) -> Result<String, ProtocolError> {
        let record = self.create(params).await?;
        self.delegate(&record.id).await?;
        Ok(record.id)
    }

    /// Record a failure on a locked record; removes the export when
    /// `drop_export` (pre-START failures leave nothing behind).
    async fn fail_locked(
        &self,
        record: &mut Delegation,
        err: ProtocolError,
        drop_export: bool,
    ) -> ProtocolError {
        record.error = Some(err.clone());
        let _ = record.transition(DelegatorState::Error);
        if drop_export {
            if let Some(export) = record.export_path.take() {
                awcp_materialize::remove_export(&export);
            }
        }
        self.inner.persist(record);
        self.inner.observer.on_terminal(record);
        err
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Current record snapshot.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` for unknown ids.
    pub async fn get(&self, delegation_id: &str) -> Result<Delegation, ProtocolError> {
        let entry = self.inner.entry(delegation_id)?;
        let record = entry.record.lock().await;
        Ok(record.clone())
    }

    /// All records, unordered.
    pub async fn list(&self) -> Vec<Delegation> {
        let entries: Vec<DelegationEntry> = self.inner.entries().values().cloned().collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.record.lock().await.clone());
        }
        out
    }

    /// Poll until the delegation reaches a terminal state.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` for unknown ids; `SSE_FAILED`-style timeout as
    /// `DECLINED` when `timeout` elapses first.
    pub async fn wait_terminal(
        &self,
        delegation_id: &str,
        timeout: Duration,
    ) -> Result<Delegation, ProtocolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = self.get(delegation_id).await?;
            if record.state.is_terminal() {
                return Ok(record);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProtocolError::declined(format!(
                    "delegation still {} after {timeout:?}",
                    record.state
                )));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Apply a staged (pending) snapshot.
    ///
    /// # Errors
    ///
    /// Unknown ids, non-pending snapshots, an occupied applied slot, or
    /// transport failures.
    pub async fn apply_snapshot(
        &self,
        delegation_id: &str,
        snapshot_id: &str,
    ) -> Result<Delegation, ProtocolError> {
        let inner = &self.inner;
        let entry = inner.entry(delegation_id)?;
        let mut record = entry.record.lock().await;

        awcp_snapshot::check_apply(&record, snapshot_id).map_err(map_snapshot_error)?;
        let payload = inner
            .snapshots
            .load_payload(delegation_id, snapshot_id)
            .map_err(map_snapshot_error)?;

        apply_into_export(inner, &mut record, snapshot_id, &payload).await?;
        inner.persist(&record);
        inner
            .observer
            .on_snapshot_applied(delegation_id, snapshot_id);
        Ok(record.clone())
    }

    /// Discard a pending snapshot, deleting its staged payload.
    ///
    /// # Errors
    ///
    /// Unknown ids or non-pending snapshots.
    pub async fn discard_snapshot(
        &self,
        delegation_id: &str,
        snapshot_id: &str,
    ) -> Result<Delegation, ProtocolError> {
        let inner = &self.inner;
        let entry = inner.entry(delegation_id)?;
        let mut record = entry.record.lock().await;
        awcp_snapshot::discard(&mut record, &inner.snapshots, snapshot_id)
            .map_err(map_snapshot_error)?;
        inner.persist(&record);
        Ok(record.clone())
    }

    // -----------------------------------------------------------------------
    // cancel / recover / release
    // -----------------------------------------------------------------------

    /// Unilateral cancellation: notify the Executor (best effort), record
    /// `CANCELLED`, release transport state.
    ///
    /// # Errors
    ///
    /// Unknown ids; cancelling a terminal delegation is refused.
    pub async fn cancel(&self, delegation_id: &str) -> Result<Delegation, ProtocolError> {
        let inner = &self.inner;
        let entry = inner.entry(delegation_id)?;
        let mut record = entry.record.lock().await;

        if record.state.is_terminal() {
            return Err(ProtocolError::conflict(format!(
                "delegation already {}",
                record.state
            )));
        }

        // Past created, the Executor knows about us and must be told.
        if record.state != DelegatorState::Created {
            let message = ProtocolMessage::Error(ErrorMessage::from_protocol_error(
                delegation_id,
                ProtocolError::cancelled("cancelled by delegator"),
            ));
            if let Err(err) = inner.client.send(&record.peer_url, &message).await {
                warn!(target: "awcp.delegator", delegation = %delegation_id, error = %err, "cancel notification failed");
            }
        }

        record.error = Some(ProtocolError::cancelled("cancelled by delegator"));
        let _ = record.transition(DelegatorState::Cancelled);
        inner.persist(&record);
        entry.cancel.cancel(CancelReason::DelegatorRequested);
        inner.release_transport(delegation_id).await;
        inner.observer.on_terminal(&record);
        info!(target: "awcp.delegator", delegation = %delegation_id, "delegation cancelled");
        Ok(record.clone())
    }

    /// Fetch the Executor's cached terminal result after `SSE_FAILED` and
    /// fold it into the record.
    ///
    /// # Errors
    ///
    /// Only legal from `error` with code `SSE_FAILED`; `NOT_FOUND` when
    /// the Executor no longer retains the result.
    pub async fn recover(&self, delegation_id: &str) -> Result<Delegation, ProtocolError> {
        let inner = &self.inner;
        let entry = inner.entry(delegation_id)?;
        let mut record = entry.record.lock().await;

        let recoverable = record.state == DelegatorState::Error
            && record.error.as_ref().is_some_and(|e| e.code == ErrorCode::SseFailed);
        if !recoverable {
            return Err(ProtocolError::conflict(
                "recover is only legal after SSE_FAILED",
            ));
        }

        let result = inner
            .client
            .fetch_result(&record.peer_url, delegation_id)
            .await
            .map_err(|e| ProtocolError::setup_failed(format!("result fetch failed: {e}")))?;

        match result.status {
            ResultStatus::Completed => {
                if let Some(payload) = &result.snapshot_payload {
                    let snapshot_id = new_snapshot_id();
                    self.receive_snapshot_locked(
                        &mut record,
                        ReceivedSnapshot {
                            snapshot_id: &snapshot_id,
                            summary: result.summary.as_deref().unwrap_or("recovered snapshot"),
                            highlights: &result.highlights,
                            recommended: true,
                            payload,
                        },
                    )
                    .await;
                }
                record.result = Some(awcp_core::TaskOutcome {
                    summary: result.summary.unwrap_or_else(|| "recovered".into()),
                    highlights: result.highlights,
                    notes: None,
                });
                record.error = None;
                // SSE_FAILED is the one sanctioned exit from a terminal
                // state: the true outcome replaces the provisional error.
                record.state = DelegatorState::Completed;
                record.touch();
                inner.persist(&record);
                inner.release_transport(delegation_id).await;
                inner.observer.on_terminal(&record);
                Ok(record.clone())
            }
            ResultStatus::Error => {
                record.error = result
                    .error
                    .or_else(|| Some(ProtocolError::task_failed("executor reported failure")));
                record.touch();
                inner.persist(&record);
                inner.release_transport(delegation_id).await;
                Ok(record.clone())
            }
            ResultStatus::Running => Err(ProtocolError::conflict(
                "executor still reports the delegation running",
            )),
            ResultStatus::NotFound | ResultStatus::NotApplicable => {
                Err(ProtocolError::not_found(delegation_id))
            }
        }
    }

    /// Owner release: delete the export tree, staged snapshots, the
    /// durable record, and the in-memory entry.
    ///
    /// # Errors
    ///
    /// Unknown ids; non-terminal delegations must be cancelled first.
    pub async fn release(&self, delegation_id: &str) -> Result<(), ProtocolError> {
        let inner = &self.inner;
        let entry = inner.entry(delegation_id)?;
        {
            let record = entry.record.lock().await;
            if !record.state.is_terminal() && record.state != DelegatorState::Created {
                return Err(ProtocolError::conflict(format!(
                    "cancel the delegation first (state {})",
                    record.state
                )));
            }
            if let Some(export) = &record.export_path {
                awcp_materialize::remove_export(export);
            }
        }
        inner.snapshots.remove_delegation(delegation_id);
        if let Err(err) = inner.store.delete(delegation_id) {
            warn!(target: "awcp.delegator", delegation = %delegation_id, error = %err, "record delete failed");
        }
        inner.entries().remove(delegation_id);
        info!(target: "awcp.delegator", delegation = %delegation_id, "delegation released");
        Ok(())
    }

    /// Cancel every in-flight delegation (when configured) at shutdown.
    pub async fn shutdown(&self) {
        if !self.inner.config.lifecycle.cleanup_on_shutdown {
            return;
        }
        let ids: Vec<String> = self.inner.entries().keys().cloned().collect();
        for id in ids {
            let Ok(record) = self.get(&id).await else {
                continue;
            };
            if !record.state.is_terminal() {
                if let Err(err) = self.cancel(&id).await {
                    warn!(target: "awcp.delegator", delegation = %id, error = %err, "shutdown cancel failed");
                }
            }
        }
    }

    async fn receive_snapshot_locked(
        &self,
        record: &mut Delegation,
        snap: ReceivedSnapshot<'_>,
    ) {
        receive_snapshot(&self.inner, record, snap).await;
    }
}

fn map_snapshot_error(err: SnapshotError) -> ProtocolError {
    match err {
        SnapshotError::NotFound { snapshot_id } => ProtocolError::new(
            ErrorCode::NotFound,
            format!("unknown snapshot: {snapshot_id}"),
        ),
        SnapshotError::AlreadyApplied { applied_id } => {
            ProtocolError::conflict("delegation already has an applied snapshot")
                .with_hint(format!("applied: {applied_id}"))
        }
        SnapshotError::NotPending {
            snapshot_id,
            status,
        } => ProtocolError::conflict(format!("snapshot {snapshot_id} is {status:?}")),
        other => ProtocolError::setup_failed(other.to_string()),
    }
}

/// Apply a payload into the export tree and fold rw changes back into the
/// resource sources, then take the applied slot.
async fn apply_into_export(
    inner: &Inner,
    record: &mut Delegation,
    snapshot_id: &str,
    payload: &SnapshotPayload,
) -> Result<(), ProtocolError> {
    // Bookkeeping gate first: a refused apply must not have touched the
    // export tree at all.
    awcp_snapshot::check_apply(record, snapshot_id).map_err(map_snapshot_error)?;
    let export = record
        .export_path
        .clone()
        .ok_or_else(|| ProtocolError::setup_failed("delegation has no export tree"))?;
    let rw = record.rw_resources();

    inner
        .transport
        .apply_snapshot(&record.id, payload, &rw, &export)
        .await
        .map_err(|e| e.to_protocol_error())?;
    awcp_materialize::sync_back(&export, &rw)
        .map_err(|e| ProtocolError::setup_failed(e.to_string()))?;
    awcp_snapshot::mark_applied(record, snapshot_id).map_err(map_snapshot_error)?;

    info!(
        target: "awcp.delegator",
        delegation = %record.id,
        snapshot = %snapshot_id,
        "snapshot applied"
    );
    Ok(())
}

/// Policy-dispatch one received snapshot on a locked record.
async fn receive_snapshot(inner: &Inner, record: &mut Delegation, snap: ReceivedSnapshot<'_>) {
    if inner.transport.capabilities().live_sync {
        debug!(
            target: "awcp.delegator",
            delegation = %record.id,
            "live-sync transport, skipping snapshot reception"
        );
        return;
    }

    let snapshot_id = snap.snapshot_id.to_string();
    let payload = snap.payload.clone();
    let disposition = match awcp_snapshot::receive(
        record,
        &inner.snapshots,
        inner.config.delegation.max_snapshots,
        snap,
    ) {
        Ok(d) => d,
        Err(err) => {
            warn!(target: "awcp.delegator", delegation = %record.id, error = %err, "snapshot staging failed");
            return;
        }
    };

    match disposition {
        Disposition::ApplyNow => {
            if let Err(err) = apply_into_export(inner, record, &snapshot_id, &payload).await {
                // The snapshot stays pending; the record keeps running so
                // the terminal event still decides the outcome.
                warn!(target: "awcp.delegator", delegation = %record.id, error = %err, "auto-apply failed");
            } else {
                inner.observer.on_snapshot_applied(&record.id, &snapshot_id);
            }
        }
        Disposition::Staged(_) | Disposition::Discarded => {
            if let Some(snapshot) = record.snapshot(&snapshot_id) {
                inner.observer.on_snapshot_received(&record.id, snapshot);
            }
        }
        Disposition::Duplicate | Disposition::Overflow => {}
    }
    inner.persist(record);
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Consume the Executor's SSE stream, reconnecting with linear backoff;
/// exhaustion surfaces `SSE_FAILED` without releasing transport state.
async fn subscription_loop(
    inner: Arc<Inner>,
    delegation_id: String,
    peer_url: String,
    cancel: CancelToken,
    mut initial: Option<EventStream>,
) {
    let max_retries = inner.config.delegation.sse_max_retries;
    let delay_ms = inner.config.delegation.sse_retry_delay_ms;
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let connection = match initial.take() {
            Some(stream) => Ok(stream),
            None => inner.client.events(&peer_url, &delegation_id).await,
        };
        match connection {
            Ok(mut stream) => loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => return,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(event)) => {
                        attempt = 0;
                        if dispatch_event(&inner, &delegation_id, event).await {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(target: "awcp.delegator", delegation = %delegation_id, error = %err, "event stream error");
                        break;
                    }
                    None => {
                        debug!(target: "awcp.delegator", delegation = %delegation_id, "event stream ended without terminal");
                        break;
                    }
                }
            },
            Err(err) => {
                warn!(target: "awcp.delegator", delegation = %delegation_id, error = %err, "event stream connect failed");
            }
        }

        attempt += 1;
        if attempt > max_retries {
            sse_failed(&inner, &delegation_id, &cancel).await;
            return;
        }
        let delay = Duration::from_millis(delay_ms * u64::from(attempt));
        debug!(
            target: "awcp.delegator",
            delegation = %delegation_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnecting event stream"
        );
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Returns `true` once a terminal event has been folded into the record.
async fn dispatch_event(inner: &Arc<Inner>, delegation_id: &str, event: ExecutorEvent) -> bool {
    let Ok(entry) = inner.entry(delegation_id) else {
        return true;
    };
    let mut record = entry.record.lock().await;
    if record.state.is_terminal() {
        return true;
    }

    match event {
        ExecutorEvent::Status { message, substate } => {
            debug!(
                target: "awcp.delegator",
                delegation = %delegation_id,
                substate = substate.as_deref().unwrap_or(""),
                "{message}"
            );
            if record.state == DelegatorState::Started {
                let _ = record.transition(DelegatorState::Running);
                inner.persist(&record);
                inner
                    .observer
                    .on_state_changed(delegation_id, DelegatorState::Running);
            }
            false
        }
        ExecutorEvent::Snapshot {
            snapshot_id,
            summary,
            highlights,
            payload,
            recommended,
        } => {
            receive_snapshot(
                inner,
                &mut record,
                ReceivedSnapshot {
                    snapshot_id: &snapshot_id,
                    summary: &summary,
                    highlights: &highlights,
                    recommended,
                    payload: &payload,
                },
            )
            .await;
            false
        }
        ExecutorEvent::Done {
            summary,
            highlights,
            ..
        } => {
            record.result = Some(awcp_core::TaskOutcome {
                summary,
                highlights,
                notes: None,
            });
            let _ = record.transition(DelegatorState::Completed);
            inner.persist(&record);
            inner.release_transport(delegation_id).await;
            inner.observer.on_terminal(&record);
            cancel_quiet(&entry.cancel);
            info!(target: "awcp.delegator", delegation = %delegation_id, "delegation completed");
            true
        }
        ExecutorEvent::Error {
            code,
            message,
            hint,
        } => {
            let err = match hint {
                Some(hint) => ProtocolError::new(code, message).with_hint(hint),
                None => ProtocolError::new(code, message),
            };
            let next = match code {
                ErrorCode::Expired => DelegatorState::Expired,
                ErrorCode::Cancelled => DelegatorState::Cancelled,
                _ => DelegatorState::Error,
            };
            record.error = Some(err);
            let _ = record.transition(next);
            inner.persist(&record);
            inner.release_transport(delegation_id).await;
            inner.observer.on_terminal(&record);
            cancel_quiet(&entry.cancel);
            info!(target: "awcp.delegator", delegation = %delegation_id, state = %next, "delegation failed");
            true
        }
    }
}

fn cancel_quiet(token: &CancelToken) {
    token.cancel(CancelReason::DelegatorRequested);
}

/// Mark the delegation `SSE_FAILED`; the Executor record is left intact
/// for [`DelegatorEngine::recover`].
async fn sse_failed(inner: &Arc<Inner>, delegation_id: &str, cancel: &CancelToken) {
    let Ok(entry) = inner.entry(delegation_id) else {
        return;
    };
    let mut record = entry.record.lock().await;
    if record.state.is_terminal() {
        return;
    }
    record.error = Some(
        ProtocolError::new(ErrorCode::SseFailed, "event stream retries exhausted")
            .with_hint("recover(id) can fetch the cached terminal result"),
    );
    let _ = record.transition(DelegatorState::Error);
    inner.persist(&record);
    inner.observer.on_terminal(&record);
    cancel_quiet(cancel);
    warn!(target: "awcp.delegator", delegation = %delegation_id, "SSE retries exhausted");
}

/// Fire expiry at the lease deadline if the delegation has not finished.
async fn lease_watchdog(
    inner: Arc<Inner>,
    delegation_id: String,
    expires_at: chrono::DateTime<Utc>,
    cancel: CancelToken,
) {
    let delay = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    tokio::select! {
        () = cancel.cancelled() => return,
        () = tokio::time::sleep(delay) => {}
    }

    let Ok(entry) = inner.entry(&delegation_id) else {
        return;
    };
    let mut record = entry.record.lock().await;
    if record.state.is_terminal() {
        return;
    }

    let message = ProtocolMessage::Error(ErrorMessage::from_protocol_error(
        &delegation_id,
        ProtocolError::new(ErrorCode::Expired, "lease expired"),
    ));
    if let Err(err) = inner.client.send(&record.peer_url, &message).await {
        warn!(target: "awcp.delegator", delegation = %delegation_id, error = %err, "expiry notification failed");
    }

    record.error = Some(ProtocolError::new(ErrorCode::Expired, "lease expired"));
    let _ = record.transition(DelegatorState::Expired);
    inner.persist(&record);
    cancel.cancel(CancelReason::LeaseExpired);
    inner.release_transport(&delegation_id).await;
    inner.observer.on_terminal(&record);
    info!(target: "awcp.delegator", delegation = %delegation_id, "lease expired");
}
