// SPDX-License-Identifier: MIT OR Apache-2.0
//! Admission boundary behavior: size refusals surface synchronously with
//! nothing materialized and no INVITE sent.

use awcp_config::AwcpConfig;
use awcp_core::{AccessMode, DelegatorState, ErrorCode, Resource, TaskSpec};
use awcp_delegator::{build_router, CreateDelegation, DelegatorEngine};
use awcp_transport::InlineTransport;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

fn write_bytes(path: &Path, bytes: usize) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, vec![b'x'; bytes]).unwrap();
}

fn task() -> TaskSpec {
    TaskSpec {
        description: "t".into(),
        prompt: "p".into(),
    }
}

async fn engine(tmp: &Path, config: AwcpConfig) -> DelegatorEngine {
    DelegatorEngine::new(config, tmp.join("delegator"), Arc::new(InlineTransport::new()))
        .await
        .unwrap()
}

#[tokio::test]
async fn scenario_b_oversized_workspace_is_refused_before_invite() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src-proj");
    write_bytes(&src.join("big.bin"), 2048);

    let mut config = AwcpConfig::default();
    config.admission.max_total_bytes = 1024;
    let engine = engine(tmp.path(), config).await;

    // A peer URL that could never be reached: admission must fail first.
    let err = engine
        .run(CreateDelegation {
            peer_url: "http://127.0.0.1:1".into(),
            task: task(),
            environment: vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)],
            lease: None,
            snapshot_policy: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::WorkspaceTooLarge);
    assert!(err.hint.unwrap().contains("maxTotalBytes"));

    // The record is terminal with the refusal, and nothing materialized.
    let records = engine.list().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, DelegatorState::Error);
    assert!(records[0].export_path.is_none());
    let environments = tmp.path().join("delegator/environments");
    assert!(
        !environments.exists()
            || std::fs::read_dir(&environments).unwrap().next().is_none(),
        "no export tree may exist after an admission refusal"
    );
}

#[tokio::test]
async fn oversized_workspace_via_control_plane_is_bad_request() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src-proj");
    write_bytes(&src.join("big.bin"), 2048);

    let mut config = AwcpConfig::default();
    config.admission.max_total_bytes = 1024;
    let engine = engine(tmp.path(), config).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, build_router(engine)).await;
    });

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/delegate"))
        .json(&json!({
            "peerUrl": "http://127.0.0.1:1",
            "task": {"description": "t", "prompt": "p"},
            "resources": [
                {"name": "ws", "type": "fs", "source": src.display().to_string(), "mode": "rw"}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "WORKSPACE_TOO_LARGE");
}

#[tokio::test]
async fn sensitive_paths_refuse_delegation() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src-proj");
    write_bytes(&src.join(".env"), 10);
    write_bytes(&src.join("main.rs"), 10);

    let engine = engine(tmp.path(), AwcpConfig::default()).await;
    let err = engine
        .run(CreateDelegation {
            peer_url: "http://127.0.0.1:1".into(),
            task: task(),
            environment: vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)],
            lease: None,
            snapshot_policy: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Declined);
    assert!(err.hint.unwrap().contains(".env"));
}

#[tokio::test]
async fn skip_sensitive_check_lets_dotenv_through_admission() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src-proj");
    write_bytes(&src.join(".env"), 10);

    let mut config = AwcpConfig::default();
    config.admission.skip_sensitive_check = true;
    let engine = engine(tmp.path(), config).await;

    // Admission and materialization pass; the (unreachable) peer then
    // fails the handshake, which is the expected failure point.
    let record = engine
        .create(CreateDelegation {
            peer_url: "http://127.0.0.1:1".into(),
            task: task(),
            environment: vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)],
            lease: None,
            snapshot_policy: None,
        })
        .await
        .unwrap();
    assert!(record.export_path.is_some());
    assert_eq!(record.admission.unwrap().file_count, 1);
}

#[tokio::test]
async fn vcs_metadata_does_not_count_against_bounds() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src-proj");
    write_bytes(&src.join(".git/objects/pack"), 100_000);
    write_bytes(&src.join("lib.rs"), 64);

    let mut config = AwcpConfig::default();
    config.admission.max_total_bytes = 1024;
    let engine = engine(tmp.path(), config).await;

    let record = engine
        .create(CreateDelegation {
            peer_url: "http://127.0.0.1:1".into(),
            task: task(),
            environment: vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)],
            lease: None,
            snapshot_policy: None,
        })
        .await
        .unwrap();
    let report = record.admission.unwrap();
    assert_eq!(report.file_count, 1);
    assert_eq!(report.total_bytes, 64);

    // The skip also holds for the materialized tree.
    let export = record.export_path.unwrap();
    assert!(export.join("ws/lib.rs").is_file());
    assert!(!export.join("ws/.git").exists());
}

#[tokio::test]
async fn single_file_bound_names_itself_in_the_hint() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src-proj");
    write_bytes(&src.join("huge.bin"), 4096);

    let mut config = AwcpConfig::default();
    config.admission.max_single_file_bytes = 1024;
    config.admission.max_total_bytes = 1024 * 1024;
    let engine = engine(tmp.path(), config).await;

    let err = engine
        .run(CreateDelegation {
            peer_url: "http://127.0.0.1:1".into(),
            task: task(),
            environment: vec![Resource::fs("ws", src.display().to_string(), AccessMode::Rw)],
            lease: None,
            snapshot_policy: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::WorkspaceTooLarge);
    assert!(err.hint.unwrap().contains("maxSingleFileBytes"));
}
