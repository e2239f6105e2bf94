// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! awcp-delegator
#![deny(unsafe_code)]

/// Peer HTTP client (messages, SSE, result fetch).
pub mod client;
/// The protocol engine and its background tasks.
pub mod engine;
/// Control-plane router.
pub mod http;
/// Observer seam for embedding hosts.
pub mod observer;

pub use client::{ClientError, EventStream, PeerClient, PeerReply};
pub use engine::{CreateDelegation, DelegatorEngine};
pub use http::{build_router, DelegateRequest};
pub use observer::{DelegationObserver, NoopObserver};
