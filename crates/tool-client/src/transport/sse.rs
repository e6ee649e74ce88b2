//! Legacy SSE transport
//!
//! A long-lived GET event stream announces a message endpoint in its first
//! `endpoint` event. Requests are POSTed there and their responses come back
//! as `message` events on the stream, matched to the caller by request id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::TransportParams;
use crate::error::{Error, Result};
use crate::event_stream::{SseDecoder, SseEvent};
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse, RequestIds};

type PendingMap = HashMap<u64, oneshot::Sender<JsonRpcResponse>>;

/// State shared between callers and the stream reader task.
#[derive(Default)]
struct Shared {
    pending: Mutex<PendingMap>,
    closed: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark the stream dead and wake every waiting caller.
    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending().clear();
    }
}

/// Aborts the reader task when the transport goes away.
struct ReaderTask(JoinHandle<()>);

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Removes a request's slot if the caller gives up (timeout, error).
struct PendingSlot<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.shared.pending().remove(&self.id);
    }
}

pub struct SseTransport {
    params: TransportParams,
    message_url: reqwest::Url,
    ids: RequestIds,
    shared: Arc<Shared>,
    reader: ReaderTask,
}

impl SseTransport {
    /// Open the event stream and wait for the message endpoint.
    pub async fn open(params: TransportParams) -> Result<Self> {
        let resp = params
            .http
            .get(params.endpoint.clone())
            .bearer_auth(params.bearer.expose())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with("text/event-stream") {
            return Err(Error::Protocol(format!(
                "expected an event stream, got content-type '{content_type}'"
            )));
        }

        let shared = Arc::new(Shared::default());
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = ReaderTask(tokio::spawn(read_stream(
            resp,
            endpoint_tx,
            Arc::clone(&shared),
        )));

        let path = endpoint_rx.await.map_err(|_| {
            Error::ConnectionClosed("event stream ended before the endpoint event".into())
        })?;
        let message_url = params
            .endpoint
            .join(&path)
            .map_err(|e| Error::Protocol(format!("invalid message endpoint '{path}': {e}")))?;
        debug!(endpoint = %message_url, "SSE message endpoint received");

        Ok(Self {
            params,
            message_url,
            ids: RequestIds::new(),
            shared,
            reader,
        })
    }

    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let id = self.ids.next();
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);
        let _slot = PendingSlot {
            shared: &self.shared,
            id,
        };

        // Checked after registering so a concurrent shutdown cannot strand us.
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed("event stream ended".into()));
        }

        self.send(&JsonRpcRequest::request(id, method, params))
            .await?;

        match rx.await {
            Ok(response) => response.into_result(),
            Err(_) => Err(Error::ConnectionClosed(
                "event stream ended before the reply arrived".into(),
            )),
        }
    }

    pub async fn send(&self, message: &JsonRpcRequest) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed("event stream ended".into()));
        }
        let resp = self
            .params
            .http
            .post(self.message_url.clone())
            .bearer_auth(self.params.bearer.expose())
            .json(message)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::SessionExpired);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    pub fn close(&self) {
        self.shared.shut();
        self.reader.0.abort();
    }
}

async fn read_stream(
    resp: reqwest::Response,
    endpoint_tx: oneshot::Sender<String>,
    shared: Arc<Shared>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut stream = resp.bytes_stream();
    let mut decoder = SseDecoder::new();

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => match decoder.push(&bytes) {
                Ok(events) => {
                    for event in events {
                        dispatch(event, &mut endpoint_tx, &shared);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "dropping SSE stream");
                    break;
                }
            },
            Err(e) => {
                warn!(error = %e, "SSE stream read failed");
                break;
            }
        }
    }
    if let Some(event) = decoder.finish() {
        dispatch(event, &mut endpoint_tx, &shared);
    }

    debug!("SSE stream ended");
    shared.shut();
}

fn dispatch(event: SseEvent, endpoint_tx: &mut Option<oneshot::Sender<String>>, shared: &Shared) {
    match event.kind() {
        "endpoint" => {
            if let Some(tx) = endpoint_tx.take() {
                let _ = tx.send(event.data.trim().to_string());
            }
        }
        "message" => {
            let response = match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "skipping unparseable SSE message");
                    return;
                }
            };
            let waiter = response
                .numeric_id()
                .and_then(|id| shared.pending().remove(&id));
            match waiter {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => debug!("unsolicited SSE message"),
            }
        }
        other => debug!(event = other, "ignoring SSE event"),
    }
}
