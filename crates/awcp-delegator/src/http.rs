// SPDX-License-Identifier: MIT OR Apache-2.0
//! Control-plane HTTP surface over the Delegator engine.
//!
//! `POST /delegate` creates the delegation synchronously (admission
//! refusals surface immediately) and drives the handshake in the
//! background; everything else reads or mutates existing records.

use crate::engine::{CreateDelegation, DelegatorEngine};
use awcp_core::{
    Delegation, ErrorClass, ErrorCode, LeaseRequest, ProtocolError, Resource, Snapshot,
    SnapshotPolicy, TaskSpec,
};
use axum::{
    Json, Router,
    extract::{Path as AxPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

/// Body of `POST /delegate`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateRequest {
    /// Executor base URL.
    pub peer_url: String,
    /// The task to delegate.
    pub task: TaskSpec,
    /// Resources to hand over.
    pub resources: Vec<Resource>,
    /// Lease request; configured defaults when absent.
    #[serde(default)]
    pub lease: Option<LeaseRequest>,
    /// Snapshot policy; configured default when absent.
    #[serde(default)]
    pub snapshot_policy: Option<SnapshotPolicy>,
}

/// Typed API failure with an HTTP status derived from the error class.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    /// The protocol error as stored on the record.
    pub error: ProtocolError,
}

impl ApiError {
    fn status_for(err: &ProtocolError) -> StatusCode {
        if err.is_conflict() {
            return StatusCode::CONFLICT;
        }
        match err.code {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            _ => match err.code.class() {
                ErrorClass::Refusal => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl From<ProtocolError> for ApiError {
    fn from(error: ProtocolError) -> Self {
        Self {
            status: Self::status_for(&error),
            error,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.error }))).into_response()
    }
}

/// Build the control-plane router.
pub fn build_router(engine: DelegatorEngine) -> Router {
    Router::new()
        .route("/delegate", post(handle_delegate))
        .route("/delegation/{id}", get(handle_get).delete(handle_cancel))
        .route("/delegation/{id}/snapshots", get(handle_snapshots))
        .route(
            "/delegation/{id}/snapshots/{sid}/apply",
            post(handle_apply),
        )
        .route(
            "/delegation/{id}/snapshots/{sid}/discard",
            post(handle_discard),
        )
        .route("/delegation/{id}/recover", post(handle_recover))
        .route("/delegations", get(handle_list))
        .route("/health", get(handle_health))
        .with_state(engine)
}

async fn handle_delegate(
    State(engine): State<DelegatorEngine>,
    Json(req): Json<DelegateRequest>,
) -> Result<Json<Delegation>, ApiError> {
    let record = engine
        .create(CreateDelegation {
            peer_url: req.peer_url,
            task: req.task,
            environment: req.resources,
            lease: req.lease,
            snapshot_policy: req.snapshot_policy,
        })
        .await?;

    // The handshake and event stream run on; the caller polls the record.
    let id = record.id.clone();
    let engine_for_task = engine.clone();
    tokio::spawn(async move {
        if let Err(err) = engine_for_task.delegate(&id).await {
            warn!(target: "awcp.delegator", delegation = %id, error = %err, "delegate failed");
        }
    });

    Ok(Json(record))
}

async fn handle_get(
    AxPath(id): AxPath<String>,
    State(engine): State<DelegatorEngine>,
) -> Result<Json<Delegation>, ApiError> {
    Ok(Json(engine.get(&id).await?))
}

async fn handle_list(State(engine): State<DelegatorEngine>) -> Json<Vec<Delegation>> {
    Json(engine.list().await)
}

async fn handle_snapshots(
    AxPath(id): AxPath<String>,
    State(engine): State<DelegatorEngine>,
) -> Result<Json<Vec<Snapshot>>, ApiError> {
    Ok(Json(engine.get(&id).await?.snapshots))
}

async fn handle_apply(
    AxPath((id, sid)): AxPath<(String, String)>,
    State(engine): State<DelegatorEngine>,
) -> Result<Json<Delegation>, ApiError> {
    Ok(Json(engine.apply_snapshot(&id, &sid).await?))
}

async fn handle_discard(
    AxPath((id, sid)): AxPath<(String, String)>,
    State(engine): State<DelegatorEngine>,
) -> Result<Json<Delegation>, ApiError> {
    Ok(Json(engine.discard_snapshot(&id, &sid).await?))
}

async fn handle_cancel(
    AxPath(id): AxPath<String>,
    State(engine): State<DelegatorEngine>,
) -> Result<Json<Delegation>, ApiError> {
    Ok(Json(engine.cancel(&id).await?))
}

async fn handle_recover(
    AxPath(id): AxPath<String>,
    State(engine): State<DelegatorEngine>,
) -> Result<Json<Delegation>, ApiError> {
    Ok(Json(engine.recover(&id).await?))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "protocolVersion": awcp_core::PROTOCOL_VERSION,
    }))
}
