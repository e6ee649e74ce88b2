//! Transports for the tool protocol
//!
//! Two ways to reach the same endpoint. `Transport::open` performs the
//! `initialize` handshake, so a returned transport is ready for requests.
//! A failed handshake closes whatever session the attempt created.

pub mod sse;
pub mod streamable;

use std::fmt;
use std::time::Duration;

use common::Secret;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::jsonrpc::JsonRpcRequest;
use crate::types::{InitializeResult, ServerInfo, initialize_params};

pub use sse::SseTransport;
pub use streamable::StreamableHttp;

/// Which transport a live connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// JSON-RPC over POST, responses as JSON or an event stream.
    StreamableHttp,
    /// GET event stream plus a POST message endpoint.
    Sse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::StreamableHttp => "streamable_http",
            TransportKind::Sse => "sse",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What every transport needs to reach the provider.
#[derive(Debug, Clone)]
pub struct TransportParams {
    pub http: reqwest::Client,
    pub endpoint: reqwest::Url,
    pub bearer: Secret<String>,
}

/// An initialized transport.
pub enum Transport {
    Streamable(StreamableHttp),
    Sse(SseTransport),
}

impl Transport {
    /// Open a transport of the given kind and run the handshake.
    pub async fn open(kind: TransportKind, params: TransportParams) -> Result<(Self, ServerInfo)> {
        let transport = match kind {
            TransportKind::StreamableHttp => Transport::Streamable(StreamableHttp::new(params)),
            TransportKind::Sse => Transport::Sse(SseTransport::open(params).await?),
        };

        match transport.handshake().await {
            Ok(server) => Ok((transport, server)),
            Err(e) => {
                transport.close().await;
                Err(e)
            }
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Streamable(_) => TransportKind::StreamableHttp,
            Transport::Sse(_) => TransportKind::Sse,
        }
    }

    /// Send a request and wait for its response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        match self {
            Transport::Streamable(t) => t.request(method, params).await,
            Transport::Sse(t) => t.request(method, params).await,
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        let message = JsonRpcRequest::notification(method, params);
        match self {
            Transport::Streamable(t) => t.send(&message).await,
            Transport::Sse(t) => t.send(&message).await,
        }
    }

    /// Best-effort close. Never fails.
    pub async fn close(&self) {
        match self {
            Transport::Streamable(t) => t.close().await,
            Transport::Sse(t) => t.close(),
        }
    }

    async fn handshake(&self) -> Result<ServerInfo> {
        let result = self.request("initialize", Some(initialize_params())).await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| Error::Protocol(format!("invalid initialize result: {e}")))?;

        if let Transport::Streamable(t) = self {
            t.set_protocol_version(init.protocol_version.clone());
        }
        self.notify("notifications/initialized", None).await?;

        debug!(
            transport = %self.kind(),
            server = %init.server_info.name,
            protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
            "tool protocol handshake complete"
        );
        Ok(init.server_info)
    }
}

/// Run a transport operation under a deadline.
pub(crate) async fn with_deadline<T>(
    operation: impl Into<String>,
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: operation.into(),
            secs: limit.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names() {
        assert_eq!(TransportKind::StreamableHttp.to_string(), "streamable_http");
        assert_eq!(TransportKind::Sse.as_str(), "sse");
        assert_eq!(
            serde_json::to_value(TransportKind::StreamableHttp).unwrap(),
            "streamable_http"
        );
    }

    #[tokio::test]
    async fn deadline_maps_to_timeout() {
        let err = with_deadline("tools/list", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        match err {
            Error::Timeout { operation, .. } => assert_eq!(operation, "tools/list"),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }
}
