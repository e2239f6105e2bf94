// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP surface for the Executor engine.
//!
//! `POST /` dispatches protocol messages by `type`; INVITE answers
//! synchronously with ACCEPT or ERROR, START and ERROR answer `{ok:true}`.
//! `GET /tasks/{id}/events` is the SSE stream with terminal replay;
//! `GET /tasks/{id}/result` is the post-SSE recovery surface.

use crate::engine::{ExecutorEngine, MessageReply};
use awcp_bus::Subscription;
use awcp_core::{ErrorCode, ExecutorEvent, ProtocolError, ProtocolMessage};
use axum::{
    Json, Router,
    extract::{Path as AxPath, State},
    response::sse::{Event as SseEvent, KeepAlive, KeepAliveStream, Sse},
    routing::{get, post},
};
use futures::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use std::pin::Pin;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Build the Executor router.
pub fn build_router(engine: ExecutorEngine) -> Router {
    Router::new()
        .route("/", post(handle_post))
        .route("/tasks/{delegation_id}/events", get(handle_events))
        .route("/tasks/{delegation_id}/result", get(handle_result))
        .route("/status", get(handle_status))
        .with_state(engine)
}

async fn handle_post(
    State(engine): State<ExecutorEngine>,
    Json(message): Json<ProtocolMessage>,
) -> Json<MessageReply> {
    debug!(
        target: "awcp.executor",
        delegation = message.delegation_id(),
        "protocol message received"
    );
    Json(engine.handle_message(message).await)
}

type EventStream = Pin<Box<dyn Stream<Item = Result<SseEvent, Infallible>> + Send>>;

async fn handle_events(
    AxPath(delegation_id): AxPath<String>,
    State(engine): State<ExecutorEngine>,
) -> Sse<KeepAliveStream<EventStream>> {
    let stream: EventStream = match engine.subscribe(&delegation_id) {
        Subscription::Live(rx) => ReceiverStream::new(rx).map(to_sse).boxed(),
        Subscription::Replay(terminal) => {
            debug!(target: "awcp.executor", delegation = %delegation_id, "replaying terminal event");
            stream::iter(vec![to_sse(terminal)]).boxed()
        }
        Subscription::Unknown => {
            let ev = ExecutorEvent::from_error(ProtocolError::not_found(&delegation_id));
            stream::iter(vec![to_sse(ev)]).boxed()
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse(event: ExecutorEvent) -> Result<SseEvent, Infallible> {
    let data = serde_json::to_string(&event)
        .unwrap_or_else(|_| format!(r#"{{"type":"error","code":"{}"}}"#, ErrorCode::SetupFailed));
    Ok(SseEvent::default().event(event.kind()).data(data))
}

async fn handle_result(
    AxPath(delegation_id): AxPath<String>,
    State(engine): State<ExecutorEngine>,
) -> Json<awcp_core::ResultResponse> {
    Json(engine.result(&delegation_id))
}

async fn handle_status(State(engine): State<ExecutorEngine>) -> Json<crate::engine::StatusReport> {
    Json(engine.status())
}
