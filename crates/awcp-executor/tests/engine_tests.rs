// SPDX-License-Identifier: MIT OR Apache-2.0
//! Engine-level tests driving the Executor through the full admission /
//! start / run / terminal flow with the inline transport and scripted
//! task runners.

use awcp_bus::Subscription;
use awcp_config::AwcpConfig;
use awcp_core::{
    AccessMode, EnvironmentSpec, ErrorCode, ErrorMessage, ExecutorEvent, InviteMessage, Lease,
    LeaseRequest, ProtocolMessage, Resource, StartMessage, TaskSpec, TransportDescriptor,
    PROTOCOL_VERSION,
};
use awcp_executor::{
    EchoTaskExecutor, ExecutorEngine, FnTaskExecutor, MessageReply, ResultStatus, TaskExecutor,
    TaskReport, TaskRunError,
};
use awcp_transport::{DelegatorTransport, InlineTransport};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn invite(id: &str, resources: Vec<Resource>) -> ProtocolMessage {
    ProtocolMessage::Invite(InviteMessage {
        version: PROTOCOL_VERSION.into(),
        delegation_id: id.into(),
        task: TaskSpec {
            description: "test task".into(),
            prompt: "do the thing".into(),
        },
        lease: LeaseRequest {
            ttl_seconds: 600,
            access_mode: AccessMode::Rw,
        },
        environment: EnvironmentSpec { resources },
        transport: TransportDescriptor::new("inline"),
    })
}

/// Materialize a one-resource export tree and produce an inline handle.
async fn prepared_start(id: &str, tmp: &Path, ttl_seconds: i64) -> ProtocolMessage {
    let src = tmp.join(format!("src-{id}"));
    write(&src.join("greeting.txt"), "hello\n");
    let export = tmp.join(format!("export-{id}"));
    let resources = vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)];
    awcp_materialize::materialize_export(id, &resources, &export).unwrap();

    let handle = DelegatorTransport::prepare(&InlineTransport::new(), id, &export, 600)
        .await
        .unwrap();

    ProtocolMessage::Start(StartMessage {
        version: PROTOCOL_VERSION.into(),
        delegation_id: id.into(),
        lease: Lease {
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_seconds),
            access_mode: AccessMode::Rw,
        },
        work_dir: handle,
    })
}

async fn engine_with(
    tmp: &Path,
    config: AwcpConfig,
    runner: Arc<dyn TaskExecutor>,
) -> ExecutorEngine {
    ExecutorEngine::new(
        config,
        tmp.join("work"),
        Arc::new(InlineTransport::new()),
        runner,
    )
    .await
    .unwrap()
}

/// Subscribe while the delegation is pending so no event can be missed.
fn live_rx(engine: &ExecutorEngine, id: &str) -> tokio::sync::mpsc::Receiver<ExecutorEvent> {
    match engine.subscribe(id) {
        Subscription::Live(rx) => rx,
        other => panic!("expected live subscription for {id}, got {other:?}"),
    }
}

async fn drain_to_terminal(
    rx: &mut tokio::sync::mpsc::Receiver<ExecutorEvent>,
) -> Vec<ExecutorEvent> {
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        let terminal = ev.is_terminal();
        events.push(ev);
        if terminal {
            break;
        }
    }
    events
}

fn demo_resource() -> Resource {
    Resource::fs("ws", "/ignored", AccessMode::Rw)
}

#[tokio::test]
async fn invite_is_accepted_with_constraints() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with(tmp.path(), AwcpConfig::default(), Arc::new(EchoTaskExecutor)).await;

    let reply = engine.handle_message(invite("d-1", vec![demo_resource()])).await;
    let MessageReply::Message(ProtocolMessage::Accept(accept)) = reply else {
        panic!("expected ACCEPT, got {reply:?}");
    };
    assert_eq!(accept.delegation_id, "d-1");
    assert_eq!(accept.executor_constraints.accepted_access_mode, AccessMode::Rw);
    assert_eq!(accept.executor_constraints.max_ttl_seconds, 3600);
    assert!(accept.executor_work_dir.path.ends_with("d-1"));
}

#[tokio::test]
async fn concurrency_cap_declines_not_queues() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = AwcpConfig::default();
    config.executor.max_concurrent_delegations = 1;
    let engine = engine_with(tmp.path(), config, Arc::new(EchoTaskExecutor)).await;

    let first = engine.handle_message(invite("d-1", vec![demo_resource()])).await;
    assert!(matches!(
        first,
        MessageReply::Message(ProtocolMessage::Accept(_))
    ));

    let second = engine.handle_message(invite("d-2", vec![demo_resource()])).await;
    let MessageReply::Message(ProtocolMessage::Error(err)) = second else {
        panic!("expected ERROR, got {second:?}");
    };
    assert_eq!(err.code, ErrorCode::Declined);
    assert!(err.message.contains("capacity"));
}

#[tokio::test]
async fn version_mismatch_is_declined() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with(tmp.path(), AwcpConfig::default(), Arc::new(EchoTaskExecutor)).await;

    let ProtocolMessage::Invite(mut msg) = invite("d-1", vec![demo_resource()]) else {
        unreachable!()
    };
    msg.version = "99".into();
    let reply = engine.handle_message(ProtocolMessage::Invite(msg)).await;
    let MessageReply::Message(ProtocolMessage::Error(err)) = reply else {
        panic!("expected ERROR");
    };
    assert_eq!(err.code, ErrorCode::Declined);
    assert!(err.message.contains("version"));
}

#[tokio::test]
async fn ro_only_executor_downgrades_rw_requests() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = AwcpConfig::default();
    config.executor.allowed_access_modes = vec![AccessMode::Ro];
    let engine = engine_with(tmp.path(), config, Arc::new(EchoTaskExecutor)).await;

    let reply = engine.handle_message(invite("d-1", vec![demo_resource()])).await;
    let MessageReply::Message(ProtocolMessage::Accept(accept)) = reply else {
        panic!("expected ACCEPT");
    };
    assert_eq!(accept.executor_constraints.accepted_access_mode, AccessMode::Ro);
}

#[tokio::test]
async fn admission_hook_can_decline() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with(tmp.path(), AwcpConfig::default(), Arc::new(EchoTaskExecutor))
        .await
        .with_admission_hook(Arc::new(|invite: &InviteMessage| {
            Err(format!("not taking work for {}", invite.delegation_id))
        }));

    let reply = engine.handle_message(invite("d-1", vec![demo_resource()])).await;
    let MessageReply::Message(ProtocolMessage::Error(err)) = reply else {
        panic!("expected ERROR");
    };
    assert_eq!(err.code, ErrorCode::Declined);
    assert!(err.message.contains("not taking work"));
}

#[tokio::test]
async fn unknown_transport_kind_is_declined() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with(tmp.path(), AwcpConfig::default(), Arc::new(EchoTaskExecutor)).await;

    let ProtocolMessage::Invite(mut msg) = invite("d-1", vec![demo_resource()]) else {
        unreachable!()
    };
    msg.transport = TransportDescriptor::new("carrier-pigeon");
    let reply = engine.handle_message(ProtocolMessage::Invite(msg)).await;
    let MessageReply::Message(ProtocolMessage::Error(err)) = reply else {
        panic!("expected ERROR");
    };
    assert_eq!(err.code, ErrorCode::Declined);
    assert!(err.message.contains("transport"));
}

#[tokio::test]
async fn full_run_emits_status_snapshot_done() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = FnTaskExecutor::new(|req: awcp_executor::TaskRequest| async move {
        // The canonical happy path: append to a file in the workspace.
        let file = req.work_path.join("ws/greeting.txt");
        let mut content = std::fs::read_to_string(&file).map_err(|e| TaskRunError::new(e.to_string()))?;
        content.push_str("hi\n");
        std::fs::write(&file, content).map_err(|e| TaskRunError::new(e.to_string()))?;
        Ok(TaskReport {
            summary: "appended greeting".into(),
            highlights: vec!["ws/greeting.txt".into()],
        })
    });
    let engine = engine_with(tmp.path(), AwcpConfig::default(), Arc::new(runner)).await;

    let reply = engine.handle_message(invite("d-1", vec![demo_resource()])).await;
    assert!(matches!(reply, MessageReply::Message(ProtocolMessage::Accept(_))));
    let mut rx = live_rx(&engine, "d-1");

    let start = prepared_start("d-1", tmp.path(), 600).await;
    let reply = engine.handle_message(start).await;
    assert!(matches!(reply, MessageReply::Ack(_)));

    let events = drain_to_terminal(&mut rx).await;
    let kinds: Vec<_> = events.iter().map(ExecutorEvent::kind).collect();
    assert!(kinds.contains(&"status"));
    assert!(kinds.contains(&"snapshot"));
    assert_eq!(*kinds.last().unwrap(), "done");

    // The snapshot id announced in done matches the snapshot event.
    let snapshot_id = events
        .iter()
        .find_map(|ev| match ev {
            ExecutorEvent::Snapshot { snapshot_id, .. } => Some(snapshot_id.clone()),
            _ => None,
        })
        .unwrap();
    match events.last().unwrap() {
        ExecutorEvent::Done {
            snapshot_ids,
            recommended_snapshot_id,
            ..
        } => {
            assert_eq!(snapshot_ids, &vec![snapshot_id.clone()]);
            assert_eq!(recommended_snapshot_id.as_ref(), Some(&snapshot_id));
        }
        other => panic!("unexpected terminal {other:?}"),
    }

    // Work path is released after the terminal.
    let result = engine.result("d-1");
    assert_eq!(result.status, ResultStatus::Completed);
    assert!(result.snapshot_payload.is_some());
}

#[tokio::test]
async fn failing_runner_surfaces_task_failed() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = FnTaskExecutor::new(|_req| async { Err(TaskRunError::new("exploded")) });
    let engine = engine_with(tmp.path(), AwcpConfig::default(), Arc::new(runner)).await;

    engine.handle_message(invite("d-1", vec![demo_resource()])).await;
    let mut rx = live_rx(&engine, "d-1");
    let start = prepared_start("d-1", tmp.path(), 600).await;
    engine.handle_message(start).await;

    let events = drain_to_terminal(&mut rx).await;
    match events.last().unwrap() {
        ExecutorEvent::Error { code, message, .. } => {
            assert_eq!(*code, ErrorCode::TaskFailed);
            assert!(message.contains("exploded"));
        }
        other => panic!("unexpected terminal {other:?}"),
    }
    assert_eq!(engine.result("d-1").status, ResultStatus::Error);
}

#[tokio::test]
async fn start_without_admission_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with(tmp.path(), AwcpConfig::default(), Arc::new(EchoTaskExecutor)).await;

    let start = prepared_start("ghost", tmp.path(), 600).await;
    let reply = engine.handle_message(start).await;
    let MessageReply::Message(ProtocolMessage::Error(err)) = reply else {
        panic!("expected ERROR");
    };
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn start_with_expired_lease_is_start_expired() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with(tmp.path(), AwcpConfig::default(), Arc::new(EchoTaskExecutor)).await;

    engine.handle_message(invite("d-1", vec![demo_resource()])).await;
    // A lease from well past the skew grace.
    let start = prepared_start("d-1", tmp.path(), -600).await;
    let reply = engine.handle_message(start).await;
    let MessageReply::Message(ProtocolMessage::Error(err)) = reply else {
        panic!("expected ERROR");
    };
    assert_eq!(err.code, ErrorCode::StartExpired);

    // The admission is gone; a fresh INVITE for the same id is admitted.
    let reply = engine.handle_message(invite("d-1", vec![demo_resource()])).await;
    assert!(matches!(reply, MessageReply::Message(ProtocolMessage::Accept(_))));
}

#[tokio::test]
async fn peer_error_cancels_running_delegation() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = FnTaskExecutor::new(|req: awcp_executor::TaskRequest| async move {
        req.cancel.cancelled().await;
        Err(TaskRunError::new("interrupted"))
    });
    let engine = engine_with(tmp.path(), AwcpConfig::default(), Arc::new(runner)).await;

    engine.handle_message(invite("d-1", vec![demo_resource()])).await;
    let mut rx = live_rx(&engine, "d-1");
    let start = prepared_start("d-1", tmp.path(), 600).await;
    engine.handle_message(start).await;

    // Wait for the running status so the cancel lands mid-run.
    loop {
        match rx.recv().await.unwrap() {
            ExecutorEvent::Status { .. } => break,
            ev => panic!("unexpected event before status: {ev:?}"),
        }
    }

    let reply = engine
        .handle_message(ProtocolMessage::Error(ErrorMessage::from_protocol_error(
            "d-1",
            awcp_core::ProtocolError::cancelled("changed my mind"),
        )))
        .await;
    assert!(matches!(reply, MessageReply::Ack(_)));

    let mut terminal = None;
    while let Some(ev) = rx.recv().await {
        if ev.is_terminal() {
            terminal = Some(ev);
            break;
        }
    }
    match terminal.unwrap() {
        ExecutorEvent::Error { code, .. } => assert_eq!(code, ErrorCode::Cancelled),
        other => panic!("unexpected terminal {other:?}"),
    }
}

#[tokio::test]
async fn peer_error_before_start_discards_admission() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with(tmp.path(), AwcpConfig::default(), Arc::new(EchoTaskExecutor)).await;

    engine.handle_message(invite("d-1", vec![demo_resource()])).await;
    let reply = engine
        .handle_message(ProtocolMessage::Error(ErrorMessage::from_protocol_error(
            "d-1",
            awcp_core::ProtocolError::cancelled("never mind"),
        )))
        .await;
    assert!(matches!(reply, MessageReply::Ack(_)));

    // Slot freed: capacity-1 executor takes the next INVITE.
    assert_eq!(engine.status().pending, 0);
    assert!(matches!(engine.subscribe("d-1"), Subscription::Unknown));
}

#[tokio::test]
async fn peer_error_for_unknown_delegation_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with(tmp.path(), AwcpConfig::default(), Arc::new(EchoTaskExecutor)).await;

    let reply = engine
        .handle_message(ProtocolMessage::Error(ErrorMessage::from_protocol_error(
            "ghost",
            awcp_core::ProtocolError::cancelled("x"),
        )))
        .await;
    let MessageReply::Message(ProtocolMessage::Error(err)) = reply else {
        panic!("expected ERROR");
    };
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn lease_expiry_mid_run_surfaces_expired() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = FnTaskExecutor::new(|req: awcp_executor::TaskRequest| async move {
        req.cancel.cancelled().await;
        Err(TaskRunError::new("interrupted"))
    });
    let engine = engine_with(tmp.path(), AwcpConfig::default(), Arc::new(runner)).await;

    engine.handle_message(invite("d-1", vec![demo_resource()])).await;
    let mut rx = live_rx(&engine, "d-1");
    // A lease 29 seconds in the past clears the START skew grace but puts
    // the pipeline deadline about a second out, firing mid-run.
    let start = prepared_start("d-1", tmp.path(), -29).await;
    engine.handle_message(start).await;

    let events = drain_to_terminal(&mut rx).await;
    match events.last().unwrap() {
        ExecutorEvent::Error { code, .. } => assert_eq!(*code, ErrorCode::Expired),
        other => panic!("unexpected terminal {other:?}"),
    }
}

#[tokio::test]
async fn completed_result_expires_after_retention() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = AwcpConfig::default();
    config.executor.result_retention_ms = 0;
    let engine = engine_with(tmp.path(), config, Arc::new(EchoTaskExecutor)).await;

    engine.handle_message(invite("d-1", vec![demo_resource()])).await;
    let mut rx = live_rx(&engine, "d-1");
    let start = prepared_start("d-1", tmp.path(), 600).await;
    engine.handle_message(start).await;
    drain_to_terminal(&mut rx).await;

    // Zero retention: swept on the next access.
    assert_eq!(engine.result("d-1").status, ResultStatus::NotFound);
    assert!(matches!(engine.subscribe("d-1"), Subscription::Unknown));
}

#[tokio::test]
async fn status_counters_track_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with(tmp.path(), AwcpConfig::default(), Arc::new(EchoTaskExecutor)).await;

    assert_eq!(engine.status().pending, 0);
    engine.handle_message(invite("d-1", vec![demo_resource()])).await;
    let report = engine.status();
    assert_eq!(report.pending, 1);
    assert_eq!(report.max_concurrent, 5);

    let mut rx = live_rx(&engine, "d-1");
    let start = prepared_start("d-1", tmp.path(), 600).await;
    engine.handle_message(start).await;
    drain_to_terminal(&mut rx).await;
    let report = engine.status();
    assert_eq!(report.pending, 0);
    assert_eq!(report.active, 0);
    assert_eq!(report.completed, 1);
}
