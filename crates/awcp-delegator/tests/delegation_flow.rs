// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end delegation flows against a live Executor on loopback:
//! the happy path, read-only protection, staged review, expiry,
//! cancellation, and SSE-failure recovery.

use awcp_config::AwcpConfig;
use awcp_core::{
    AccessMode, DelegatorState, ErrorCode, LeaseRequest, Resource, SnapshotPolicy,
    SnapshotStatus, TaskSpec,
};
use awcp_delegator::{CreateDelegation, DelegatorEngine};
use awcp_executor::{
    build_router as executor_router, ExecutorEngine, FnTaskExecutor, TaskExecutor, TaskReport,
    TaskRequest, TaskRunError,
};
use awcp_transport::InlineTransport;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

async fn spawn_executor(tmp: &Path, config: AwcpConfig, runner: Arc<dyn TaskExecutor>) -> String {
    let engine = ExecutorEngine::new(
        config,
        tmp.join("executor-work"),
        Arc::new(InlineTransport::new()),
        runner,
    )
    .await
    .unwrap();
    spawn_executor_app(executor_router(engine)).await
}

async fn spawn_executor_app(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn delegator(tmp: &Path, config: AwcpConfig) -> DelegatorEngine {
    DelegatorEngine::new(config, tmp.join("delegator"), Arc::new(InlineTransport::new()))
        .await
        .unwrap()
}

fn append_runner() -> Arc<dyn TaskExecutor> {
    Arc::new(FnTaskExecutor::new(|req: TaskRequest| async move {
        let file = req.work_path.join("ws/greeting.txt");
        let mut content =
            std::fs::read_to_string(&file).map_err(|e| TaskRunError::new(e.to_string()))?;
        content.push_str("hi\n");
        std::fs::write(&file, content).map_err(|e| TaskRunError::new(e.to_string()))?;
        Ok(TaskReport {
            summary: "appended greeting".into(),
            highlights: vec!["ws/greeting.txt".into()],
        })
    }))
}

fn task() -> TaskSpec {
    TaskSpec {
        description: "append hi".into(),
        prompt: "append hi to ws/greeting.txt".into(),
    }
}

#[tokio::test]
async fn scenario_auto_apply_round_trips_to_source() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src-proj");
    write(&src.join("greeting.txt"), "hello\n");

    let peer_url = spawn_executor(tmp.path(), AwcpConfig::default(), append_runner()).await;
    let engine = delegator(tmp.path(), AwcpConfig::default()).await;

    let id = engine
        .run(CreateDelegation {
            peer_url,
            task: task(),
            environment: vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)],
            lease: None,
            snapshot_policy: Some(SnapshotPolicy::Auto),
        })
        .await
        .unwrap();

    let record = engine
        .wait_terminal(&id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(record.state, DelegatorState::Completed);
    assert!(record.applied_snapshot_id.is_some());
    assert_eq!(record.result.as_ref().unwrap().summary, "appended greeting");

    // The change flowed all the way back to the delegator's source tree.
    assert_eq!(
        std::fs::read_to_string(src.join("greeting.txt")).unwrap(),
        "hello\nhi\n"
    );
    assert!(record.terminal_invariant_holds());
}

#[tokio::test]
async fn read_only_resources_survive_apply_untouched() {
    let tmp = tempfile::tempdir().unwrap();
    let code = tmp.path().join("a");
    let data = tmp.path().join("b");
    write(&code.join("lib.rs"), "original code");
    write(&data.join("corpus.txt"), "original data");

    // The runner tampers with both resources; only rw flows back.
    let runner = Arc::new(FnTaskExecutor::new(|req: TaskRequest| async move {
        std::fs::write(req.work_path.join("code/lib.rs"), "changed code")
            .map_err(|e| TaskRunError::new(e.to_string()))?;
        std::fs::write(req.work_path.join("data/corpus.txt"), "tampered data")
            .map_err(|e| TaskRunError::new(e.to_string()))?;
        Ok(TaskReport {
            summary: "edited both".into(),
            highlights: vec![],
        })
    }));
    let peer_url = spawn_executor(tmp.path(), AwcpConfig::default(), runner).await;
    let engine = delegator(tmp.path(), AwcpConfig::default()).await;

    let id = engine
        .run(CreateDelegation {
            peer_url,
            task: task(),
            environment: vec![
                Resource::fs("code", code.display().to_string(), AccessMode::Rw),
                Resource::fs("data", data.display().to_string(), AccessMode::Ro),
            ],
            lease: None,
            snapshot_policy: Some(SnapshotPolicy::Auto),
        })
        .await
        .unwrap();
    engine
        .wait_terminal(&id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(code.join("lib.rs")).unwrap(),
        "changed code"
    );
    assert_eq!(
        std::fs::read_to_string(data.join("corpus.txt")).unwrap(),
        "original data",
        "ro resource bytes must be unchanged"
    );
}

#[tokio::test]
async fn staged_review_applies_exactly_one() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src-proj");
    write(&src.join("greeting.txt"), "hello\n");

    // Two explicit snapshots, then done.
    let runner = Arc::new(FnTaskExecutor::new(|req: TaskRequest| async move {
        let file = req.work_path.join("ws/greeting.txt");
        std::fs::write(&file, "hello\nfirst\n").map_err(|e| TaskRunError::new(e.to_string()))?;
        req.snapshots
            .capture("first", vec![], false)
            .await?
            .ok_or_else(|| TaskRunError::new("no payload"))?;
        std::fs::write(&file, "hello\nsecond\n").map_err(|e| TaskRunError::new(e.to_string()))?;
        req.snapshots
            .capture("second", vec![], true)
            .await?
            .ok_or_else(|| TaskRunError::new("no payload"))?;
        Ok(TaskReport {
            summary: "two drafts".into(),
            highlights: vec![],
        })
    }));
    let peer_url = spawn_executor(tmp.path(), AwcpConfig::default(), runner).await;
    let engine = delegator(tmp.path(), AwcpConfig::default()).await;

    let id = engine
        .run(CreateDelegation {
            peer_url,
            task: task(),
            environment: vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)],
            lease: None,
            snapshot_policy: Some(SnapshotPolicy::Staged),
        })
        .await
        .unwrap();
    let record = engine
        .wait_terminal(&id, Duration::from_secs(10))
        .await
        .unwrap();

    // Both snapshots pending, nothing applied yet, source untouched.
    assert_eq!(record.state, DelegatorState::Completed);
    assert_eq!(record.snapshots.len(), 2);
    assert!(record
        .snapshots
        .iter()
        .all(|s| s.status == SnapshotStatus::Pending));
    assert!(record.applied_snapshot_id.is_none());
    assert_eq!(
        std::fs::read_to_string(src.join("greeting.txt")).unwrap(),
        "hello\n"
    );

    let second_id = record
        .snapshots
        .iter()
        .find(|s| s.summary == "second")
        .unwrap()
        .id
        .clone();
    let first_id = record
        .snapshots
        .iter()
        .find(|s| s.summary == "first")
        .unwrap()
        .id
        .clone();

    let record = engine.apply_snapshot(&id, &second_id).await.unwrap();
    assert_eq!(record.applied_snapshot_id.as_deref(), Some(second_id.as_str()));
    assert_eq!(
        record.snapshot(&first_id).unwrap().status,
        SnapshotStatus::Pending
    );
    assert_eq!(
        std::fs::read_to_string(src.join("greeting.txt")).unwrap(),
        "hello\nsecond\n"
    );

    // One applied snapshot per delegation; the second apply is refused.
    let err = engine.apply_snapshot(&id, &first_id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Declined);
    assert!(err.hint.unwrap().contains(&second_id));

    // The loser can still be discarded.
    let record = engine.discard_snapshot(&id, &first_id).await.unwrap();
    assert_eq!(
        record.snapshot(&first_id).unwrap().status,
        SnapshotStatus::Discarded
    );
}

#[tokio::test]
async fn executor_refusal_fails_the_delegation() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src-proj");
    write(&src.join("f.txt"), "x");

    let mut exec_config = AwcpConfig::default();
    exec_config.executor.max_concurrent_delegations = 0;
    let peer_url = spawn_executor(tmp.path(), exec_config, append_runner()).await;
    let engine = delegator(tmp.path(), AwcpConfig::default()).await;

    let record = engine
        .create(CreateDelegation {
            peer_url,
            task: task(),
            environment: vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)],
            lease: None,
            snapshot_policy: None,
        })
        .await
        .unwrap();
    let err = engine.delegate(&record.id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Declined);

    let record = engine.get(&record.id).await.unwrap();
    assert_eq!(record.state, DelegatorState::Error);
    assert_eq!(record.error.unwrap().code, ErrorCode::Declined);
}

#[tokio::test]
async fn cancel_mid_run_lands_cancelled_on_both_sides() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src-proj");
    write(&src.join("f.txt"), "x");

    let runner = Arc::new(FnTaskExecutor::new(|req: TaskRequest| async move {
        req.cancel.cancelled().await;
        Err(TaskRunError::new("interrupted"))
    }));
    let peer_url = spawn_executor(tmp.path(), AwcpConfig::default(), runner).await;
    let engine = delegator(tmp.path(), AwcpConfig::default()).await;

    let id = engine
        .run(CreateDelegation {
            peer_url,
            task: task(),
            environment: vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)],
            lease: None,
            snapshot_policy: None,
        })
        .await
        .unwrap();

    // Give the executor a moment to enter the run.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = engine.cancel(&id).await.unwrap();
    assert_eq!(record.state, DelegatorState::Cancelled);
    assert_eq!(record.error.unwrap().code, ErrorCode::Cancelled);

    // Cancelling again is refused.
    assert!(engine.cancel(&id).await.is_err());
}

#[tokio::test]
async fn short_lease_expires_the_delegation() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src-proj");
    write(&src.join("f.txt"), "x");

    let runner = Arc::new(FnTaskExecutor::new(|req: TaskRequest| async move {
        req.cancel.cancelled().await;
        Err(TaskRunError::new("interrupted"))
    }));
    let peer_url = spawn_executor(tmp.path(), AwcpConfig::default(), runner).await;
    let engine = delegator(tmp.path(), AwcpConfig::default()).await;

    let id = engine
        .run(CreateDelegation {
            peer_url,
            task: task(),
            environment: vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)],
            lease: Some(LeaseRequest {
                ttl_seconds: 1,
                access_mode: AccessMode::Rw,
            }),
            snapshot_policy: None,
        })
        .await
        .unwrap();

    let record = engine
        .wait_terminal(&id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(record.state, DelegatorState::Expired);
    assert_eq!(record.error.unwrap().code, ErrorCode::Expired);
}

#[tokio::test]
async fn ttl_is_clamped_to_executor_maximum() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src-proj");
    write(&src.join("greeting.txt"), "hello\n");

    let mut exec_config = AwcpConfig::default();
    exec_config.executor.max_ttl_seconds = 120;
    let peer_url = spawn_executor(tmp.path(), exec_config, append_runner()).await;
    let engine = delegator(tmp.path(), AwcpConfig::default()).await;

    let id = engine
        .run(CreateDelegation {
            peer_url,
            task: task(),
            environment: vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)],
            lease: Some(LeaseRequest {
                ttl_seconds: 3600,
                access_mode: AccessMode::Rw,
            }),
            snapshot_policy: None,
        })
        .await
        .unwrap();

    let record = engine.get(&id).await.unwrap();
    let lease = record.lease_active.unwrap();
    let granted = (lease.expires_at - chrono::Utc::now()).num_seconds();
    assert!(
        granted <= 121,
        "TTL must be clamped to the executor max, got {granted}s"
    );
    engine
        .wait_terminal(&id, Duration::from_secs(10))
        .await
        .unwrap();
}

#[tokio::test]
async fn sse_failure_leaves_record_recoverable() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src-proj");
    write(&src.join("greeting.txt"), "hello\n");

    // An executor whose SSE endpoint is broken: the delegation still runs
    // to completion, but the delegator can only learn the outcome via the
    // result endpoint.
    let exec_engine = ExecutorEngine::new(
        AwcpConfig::default(),
        tmp.path().join("executor-work"),
        Arc::new(InlineTransport::new()),
        append_runner(),
    )
    .await
    .unwrap();
    let post_engine = exec_engine.clone();
    let result_engine = exec_engine.clone();
    let app = axum::Router::new()
        .route(
            "/",
            axum::routing::post(move |axum::Json(msg): axum::Json<awcp_core::ProtocolMessage>| {
                let engine = post_engine.clone();
                async move { axum::Json(engine.handle_message(msg).await) }
            }),
        )
        .route(
            "/tasks/{id}/events",
            axum::routing::get(|| async { axum::http::StatusCode::INTERNAL_SERVER_ERROR }),
        )
        .route(
            "/tasks/{id}/result",
            axum::routing::get(
                move |axum::extract::Path(id): axum::extract::Path<String>| {
                    let engine = result_engine.clone();
                    async move { axum::Json(engine.result(&id)) }
                },
            ),
        );
    let peer_url = spawn_executor_app(app).await;

    let mut config = AwcpConfig::default();
    config.delegation.sse_max_retries = 1;
    config.delegation.sse_retry_delay_ms = 20;
    let engine = delegator(tmp.path(), config).await;

    let id = engine
        .run(CreateDelegation {
            peer_url,
            task: task(),
            environment: vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)],
            lease: None,
            snapshot_policy: Some(SnapshotPolicy::Auto),
        })
        .await
        .unwrap();

    let record = engine
        .wait_terminal(&id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(record.state, DelegatorState::Error);
    assert_eq!(record.error.as_ref().unwrap().code, ErrorCode::SseFailed);

    // Recover once the executor has finished; retry while it still runs.
    let mut recovered = None;
    for _ in 0..100 {
        match engine.recover(&id).await {
            Ok(record) => {
                recovered = Some(record);
                break;
            }
            Err(err) if err.message.contains("still") => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(err) => panic!("unexpected recover failure: {err}"),
        }
    }
    let record = recovered.expect("recover never succeeded");
    assert_eq!(record.state, DelegatorState::Completed);
    assert_eq!(record.result.unwrap().summary, "appended greeting");
    assert!(record.applied_snapshot_id.is_some());
    assert_eq!(
        std::fs::read_to_string(src.join("greeting.txt")).unwrap(),
        "hello\nhi\n"
    );
}

#[tokio::test]
async fn recover_is_refused_outside_sse_failed() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src-proj");
    write(&src.join("greeting.txt"), "hello\n");

    let peer_url = spawn_executor(tmp.path(), AwcpConfig::default(), append_runner()).await;
    let engine = delegator(tmp.path(), AwcpConfig::default()).await;

    let id = engine
        .run(CreateDelegation {
            peer_url,
            task: task(),
            environment: vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)],
            lease: None,
            snapshot_policy: None,
        })
        .await
        .unwrap();
    engine
        .wait_terminal(&id, Duration::from_secs(10))
        .await
        .unwrap();

    let err = engine.recover(&id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Declined);
}

#[tokio::test]
async fn release_removes_record_and_artifacts() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src-proj");
    write(&src.join("greeting.txt"), "hello\n");

    let peer_url = spawn_executor(tmp.path(), AwcpConfig::default(), append_runner()).await;
    let engine = delegator(tmp.path(), AwcpConfig::default()).await;

    let id = engine
        .run(CreateDelegation {
            peer_url,
            task: task(),
            environment: vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)],
            lease: None,
            snapshot_policy: None,
        })
        .await
        .unwrap();
    let record = engine
        .wait_terminal(&id, Duration::from_secs(10))
        .await
        .unwrap();
    let export = record.export_path.clone().unwrap();
    assert!(export.exists());

    engine.release(&id).await.unwrap();
    assert!(!export.exists());
    let err = engine.get(&id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn records_survive_engine_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src-proj");
    write(&src.join("greeting.txt"), "hello\n");

    let peer_url = spawn_executor(tmp.path(), AwcpConfig::default(), append_runner()).await;
    let engine = delegator(tmp.path(), AwcpConfig::default()).await;
    let id = engine
        .run(CreateDelegation {
            peer_url,
            task: task(),
            environment: vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)],
            lease: None,
            snapshot_policy: None,
        })
        .await
        .unwrap();
    engine
        .wait_terminal(&id, Duration::from_secs(10))
        .await
        .unwrap();
    drop(engine);

    let reopened = delegator(tmp.path(), AwcpConfig::default()).await;
    let record = reopened.get(&id).await.unwrap();
    assert_eq!(record.state, DelegatorState::Completed);
}
