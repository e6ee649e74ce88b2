//! Streamable HTTP transport
//!
//! Every JSON-RPC message is a POST to the endpoint. The server answers a
//! request either with a JSON body or with an event stream carrying the
//! response; notifications get `202 Accepted`. The session id returned by
//! `initialize` rides along on every later request.

use std::sync::RwLock;

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::{debug, warn};

use super::TransportParams;
use crate::error::{Error, Result};
use crate::event_stream::SseDecoder;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse, RequestIds};

pub const SESSION_HEADER: &str = "mcp-session-id";
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

pub struct StreamableHttp {
    params: TransportParams,
    ids: RequestIds,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
}

impl StreamableHttp {
    pub fn new(params: TransportParams) -> Self {
        Self {
            params,
            ids: RequestIds::new(),
            session_id: RwLock::new(None),
            protocol_version: RwLock::new(None),
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_protocol_version(&self, version: Option<String>) {
        *self
            .protocol_version
            .write()
            .unwrap_or_else(|e| e.into_inner()) = version;
    }

    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let id = self.ids.next();
        let message = JsonRpcRequest::request(id, method, params);
        let resp = self.post(&message).await?;

        let is_stream = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let response = if is_stream {
            read_streamed_response(resp, id).await?
        } else {
            resp.json::<JsonRpcResponse>()
                .await
                .map_err(|e| Error::Protocol(format!("invalid JSON-RPC response: {e}")))?
        };
        response.into_result()
    }

    /// POST a message whose response body is not needed.
    pub async fn send(&self, message: &JsonRpcRequest) -> Result<()> {
        self.post(message).await.map(drop)
    }

    /// Terminate the server-side session, if one was issued.
    pub async fn close(&self) {
        let Some(session) = self.session_id() else {
            return;
        };
        let result = self
            .params
            .http
            .delete(self.params.endpoint.clone())
            .bearer_auth(self.params.bearer.expose())
            .header(SESSION_HEADER, &session)
            .send()
            .await;
        match result {
            Ok(resp) => debug!(status = %resp.status(), "tool session closed"),
            Err(e) => debug!(error = %e, "tool session close failed, ignoring"),
        }
    }

    async fn post(&self, message: &JsonRpcRequest) -> Result<reqwest::Response> {
        let session = self.session_id();
        let mut req = self
            .params
            .http
            .post(self.params.endpoint.clone())
            .bearer_auth(self.params.bearer.expose())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(session) = &session {
            req = req.header(SESSION_HEADER, session);
        }
        let version = self
            .protocol_version
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(version) = version {
            req = req.header(PROTOCOL_VERSION_HEADER, version);
        }

        let resp = req.send().await?;
        let status = resp.status();

        if status == StatusCode::NOT_FOUND && session.is_some() {
            warn!(method = %message.method, "tool session expired");
            return Err(Error::SessionExpired);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }

        if session.is_none()
            && let Some(issued) = resp
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
        {
            debug!("tool session established");
            *self.session_id.write().unwrap_or_else(|e| e.into_inner()) = Some(issued.to_string());
        }
        Ok(resp)
    }
}

/// Read an event-stream body until the response for `id` arrives.
async fn read_streamed_response(resp: reqwest::Response, id: u64) -> Result<JsonRpcResponse> {
    let mut stream = resp.bytes_stream();
    let mut decoder = SseDecoder::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for event in decoder.push(&chunk)? {
            if event.kind() != "message" {
                continue;
            }
            match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                Ok(response) if response.answers(id) => return Ok(response),
                Ok(_) => debug!("skipping unrelated message on response stream"),
                Err(e) => debug!(error = %e, "skipping unparseable event"),
            }
        }
    }

    if let Some(event) = decoder.finish()
        && let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&event.data)
        && response.answers(id)
    {
        return Ok(response);
    }
    Err(Error::ConnectionClosed(
        "response stream ended before the reply arrived".into(),
    ))
}
