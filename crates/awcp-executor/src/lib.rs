// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! awcp-executor
#![deny(unsafe_code)]

/// The protocol engine and its state machine.
pub mod engine;
/// Axum router over the engine.
pub mod http;
/// The injected task-runner seam.
pub mod runner;

pub use awcp_core::{ResultResponse, ResultStatus};
pub use engine::{AdmissionHook, ExecutorEngine, MessageReply, StatusReport};
pub use http::build_router;
pub use runner::{
    EchoTaskExecutor, FnTaskExecutor, SnapshotSink, StatusSink, TaskExecutor, TaskReport,
    TaskRequest, TaskRunError,
};
