// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP client for talking to an Executor: protocol message posts, the
//! SSE event stream, and the post-SSE result fetch.
//!
//! Two underlying clients: control calls carry the configured request
//! timeout; the SSE stream only bounds connection establishment, since a
//! healthy stream is expected to stay open for the delegation's lifetime.

use awcp_core::{Ack, ExecutorEvent, ProtocolMessage, ResultResponse};
use eventsource_stream::Eventsource;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// A live, decoded event stream from the Executor.
pub type EventStream = BoxStream<'static, Result<ExecutorEvent, ClientError>>;

/// Errors raised by peer communication.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connection, timeout, or protocol-level HTTP failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The peer answered with an unexpected status.
    #[error("unexpected status {status} from {url}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Requested URL.
        url: String,
    },

    /// The peer's body did not decode.
    #[error("undecodable peer response: {reason}")]
    Decode {
        /// Decode failure detail.
        reason: String,
    },

    /// The event stream ended or broke mid-delegation.
    #[error("event stream interrupted: {reason}")]
    StreamInterrupted {
        /// Failure detail.
        reason: String,
    },
}

/// Reply body of `POST /` — a protocol message or a bare ack.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PeerReply {
    /// ACCEPT or ERROR.
    Message(ProtocolMessage),
    /// `{ok:true}` for START and ERROR posts.
    Ack(Ack),
}

/// HTTP client bound to the Executor wire surface.
#[derive(Debug, Clone)]
pub struct PeerClient {
    control: reqwest::Client,
    stream: reqwest::Client,
}

impl PeerClient {
    /// Build a client with the given per-request timeout for control calls.
    ///
    /// # Errors
    ///
    /// Fails if the underlying clients cannot be constructed.
    pub fn new(request_timeout: Duration) -> Result<Self, ClientError> {
        let control = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        let stream = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()?;
        Ok(Self { control, stream })
    }

    /// Post a protocol message to the peer's root endpoint.
    ///
    /// # Errors
    ///
    /// Transport failures, non-2xx statuses, or undecodable bodies.
    pub async fn send(
        &self,
        peer_url: &str,
        message: &ProtocolMessage,
    ) -> Result<PeerReply, ClientError> {
        let url = peer_url.trim_end_matches('/').to_string();
        debug!(target: "awcp.delegator", url = %url, delegation = message.delegation_id(), "posting protocol message");
        let resp = self.control.post(&url).json(message).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                url,
            });
        }
        resp.json::<PeerReply>().await.map_err(|e| ClientError::Decode {
            reason: e.to_string(),
        })
    }

    /// Open the delegation's SSE stream, yielding decoded events.
    ///
    /// # Errors
    ///
    /// Connection failures or a non-2xx response.
    pub async fn events(
        &self,
        peer_url: &str,
        delegation_id: &str,
    ) -> Result<EventStream, ClientError> {
        let url = format!(
            "{}/tasks/{delegation_id}/events",
            peer_url.trim_end_matches('/')
        );
        let resp = self.stream.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let stream = resp.bytes_stream().eventsource().filter_map(|item| async {
            match item {
                Ok(event) => {
                    // Keep-alive comments surface as empty-data events.
                    if event.data.is_empty() {
                        return None;
                    }
                    Some(
                        serde_json::from_str::<ExecutorEvent>(&event.data).map_err(|e| {
                            ClientError::Decode {
                                reason: format!("bad event payload: {e}"),
                            }
                        }),
                    )
                }
                Err(e) => Some(Err(ClientError::StreamInterrupted {
                    reason: e.to_string(),
                })),
            }
        });
        Ok(stream.boxed())
    }

    /// Fetch the retained terminal result for recovery.
    ///
    /// # Errors
    ///
    /// Transport failures, non-2xx statuses, or undecodable bodies.
    pub async fn fetch_result(
        &self,
        peer_url: &str,
        delegation_id: &str,
    ) -> Result<ResultResponse, ClientError> {
        let url = format!(
            "{}/tasks/{delegation_id}/result",
            peer_url.trim_end_matches('/')
        );
        let resp = self.control.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                url,
            });
        }
        resp.json::<ResultResponse>()
            .await
            .map_err(|e| ClientError::Decode {
                reason: e.to_string(),
            })
    }
}
