//! In-process tool provider speaking both transports, for tests.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use common::Secret;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::TokenSource;

/// Fixed bearer token source.
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: &str) -> Self {
        Self(Some(token.to_string()))
    }

    pub fn signed_out() -> Self {
        Self(None)
    }
}

impl TokenSource for StaticToken {
    fn bearer_token(
        &self,
    ) -> Pin<Box<dyn Future<Output = tool_auth::Result<Secret<String>>> + Send + '_>> {
        Box::pin(async move {
            self.0
                .clone()
                .map(Secret::new)
                .ok_or(tool_auth::Error::NotAuthenticated)
        })
    }
}

#[derive(Debug, Clone)]
pub struct MockServerConfig {
    /// Serve JSON-RPC over POST. When false, POST answers 405.
    pub streamable: bool,
    /// Serve the legacy event stream. When false, GET answers 404.
    pub sse: bool,
    /// Answer streamable requests with an event-stream body instead of JSON.
    pub stream_responses: bool,
    /// Paginate `tools/list` with this many tools per page.
    pub page_size: Option<usize>,
    /// Answer `tools/list` with cursors that alternate between "a" and "b".
    pub cursor_cycle: bool,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            streamable: true,
            sse: true,
            stream_responses: false,
            page_size: None,
            cursor_cycle: false,
        }
    }
}

pub struct MockServer {
    pub url: String,
    inner: Arc<Inner>,
    _server: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn spawn(config: MockServerConfig) -> Self {
        let inner = Arc::new(Inner {
            config,
            next_session: AtomicUsize::new(1),
            initialize_count: AtomicUsize::new(0),
            sse_streams: AtomicUsize::new(0),
            deleted_sessions: AtomicUsize::new(0),
            live_sessions: Mutex::new(HashSet::new()),
            sse_senders: Mutex::new(HashMap::new()),
            last_authorization: Mutex::new(None),
        });

        let app = Router::new()
            .route(
                "/mcp",
                post(streamable_post)
                    .get(sse_stream)
                    .delete(streamable_delete),
            )
            .route("/mcp/messages", post(sse_message))
            .with_state(Arc::clone(&inner));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}/mcp"),
            inner,
            _server: server,
        }
    }

    pub fn initialize_count(&self) -> usize {
        self.inner.initialize_count.load(Ordering::SeqCst)
    }

    pub fn sse_streams(&self) -> usize {
        self.inner.sse_streams.load(Ordering::SeqCst)
    }

    pub fn deleted_sessions(&self) -> usize {
        self.inner.deleted_sessions.load(Ordering::SeqCst)
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.inner.last_authorization.lock().unwrap().clone()
    }

    /// Forget every session, as a restarted server would.
    pub fn expire_sessions(&self) {
        self.inner.live_sessions.lock().unwrap().clear();
    }
}

struct Inner {
    config: MockServerConfig,
    next_session: AtomicUsize,
    initialize_count: AtomicUsize,
    sse_streams: AtomicUsize,
    deleted_sessions: AtomicUsize,
    live_sessions: Mutex<HashSet<String>>,
    sse_senders: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    last_authorization: Mutex<Option<String>>,
}

impl Inner {
    fn record_auth(&self, headers: &HeaderMap) {
        let value = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        *self.last_authorization.lock().unwrap() = value;
    }

    fn new_session(&self) -> String {
        let id = format!("session-{}", self.next_session.fetch_add(1, Ordering::SeqCst));
        self.live_sessions.lock().unwrap().insert(id.clone());
        id
    }

    fn is_live(&self, session: &str) -> bool {
        self.live_sessions.lock().unwrap().contains(session)
    }

    fn tools() -> Vec<Value> {
        vec![
            json!({
                "name": "echo",
                "description": "Echo the arguments back",
                "inputSchema": {"type": "object", "properties": {"query": {"type": "string"}}}
            }),
            json!({
                "name": "explode",
                "description": "Always fails",
                "inputSchema": {"type": "object", "properties": {}}
            }),
        ]
    }

    fn tools_page(&self, cursor: Option<&str>) -> Value {
        let tools = Self::tools();
        if self.config.cursor_cycle {
            let next = if cursor == Some("a") { "b" } else { "a" };
            return json!({ "tools": tools[..1].to_vec(), "nextCursor": next });
        }
        let Some(size) = self.config.page_size else {
            return json!({ "tools": tools });
        };
        let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let end = (start + size).min(tools.len());
        let mut page = json!({ "tools": tools[start..end].to_vec() });
        if end < tools.len() {
            page["nextCursor"] = json!(end.to_string());
        }
        page
    }

    async fn call(&self, params: &Value) -> Result<Value, (i64, String)> {
        let args = params.get("arguments").cloned().unwrap_or(json!({}));
        match params["name"].as_str().unwrap_or_default() {
            "echo" => Ok(json!({
                "content": [{"type": "text", "text": args.to_string()}],
                "isError": false
            })),
            "explode" => Err((-32000, "boom".to_string())),
            "out_of_stock" => Ok(json!({
                "content": [{"type": "text", "text": "item unavailable"}],
                "isError": true
            })),
            "slow" => {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(json!({"content": []}))
            }
            other => Err((-32602, format!("unknown tool: {other}"))),
        }
    }

    /// Answer a JSON-RPC message. Notifications yield `None`.
    async fn handle(&self, msg: &Value) -> Option<Value> {
        let id = msg.get("id")?.clone();
        let result = match msg["method"].as_str().unwrap_or_default() {
            "initialize" => {
                self.initialize_count.fetch_add(1, Ordering::SeqCst);
                Ok(json!({
                    "protocolVersion": "2025-03-26",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "mock-tools", "version": "0.1.0"}
                }))
            }
            "tools/list" => Ok(self.tools_page(msg["params"]["cursor"].as_str())),
            "tools/call" => self.call(&msg["params"]).await,
            other => Err((-32601, format!("method not found: {other}"))),
        };
        Some(match result {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => {
                json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
            }
        })
    }
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

async fn streamable_post(
    State(inner): State<Arc<Inner>>,
    headers: HeaderMap,
    Json(msg): Json<Value>,
) -> Response {
    inner.record_auth(&headers);
    if !inner.config.streamable {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    if msg["method"] == "initialize" {
        let session = inner.new_session();
        let body = inner.handle(&msg).await;
        return ([("mcp-session-id", session)], Json(body)).into_response();
    }

    match session_header(&headers) {
        Some(session) if inner.is_live(&session) => {}
        _ => return StatusCode::NOT_FOUND.into_response(),
    }

    match inner.handle(&msg).await {
        None => StatusCode::ACCEPTED.into_response(),
        Some(reply) if inner.config.stream_responses => (
            [(CONTENT_TYPE, "text/event-stream")],
            format!(": ping\n\nevent: message\ndata: {reply}\n\n"),
        )
            .into_response(),
        Some(reply) => Json(reply).into_response(),
    }
}

async fn streamable_delete(State(inner): State<Arc<Inner>>, headers: HeaderMap) -> StatusCode {
    if let Some(session) = session_header(&headers)
        && inner.live_sessions.lock().unwrap().remove(&session)
    {
        inner.deleted_sessions.fetch_add(1, Ordering::SeqCst);
    }
    StatusCode::OK
}

async fn sse_stream(State(inner): State<Arc<Inner>>, headers: HeaderMap) -> Response {
    inner.record_auth(&headers);
    if !inner.config.sse {
        return StatusCode::NOT_FOUND.into_response();
    }
    inner.sse_streams.fetch_add(1, Ordering::SeqCst);

    let session = inner.new_session();
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    inner.sse_senders.lock().unwrap().insert(session.clone(), tx);

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/mcp/messages?session={session}"));
    let messages = futures_util::stream::unfold(rx, |mut rx| async move {
        let msg = rx.recv().await?;
        Some((
            Ok::<_, Infallible>(Event::default().event("message").data(msg)),
            rx,
        ))
    });
    let stream = futures_util::stream::once(async move { Ok::<_, Infallible>(endpoint) }).chain(messages);
    Sse::new(stream).into_response()
}

async fn sse_message(
    State(inner): State<Arc<Inner>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(msg): Json<Value>,
) -> StatusCode {
    inner.record_auth(&headers);
    let Some(session) = query.get("session") else {
        return StatusCode::BAD_REQUEST;
    };
    if !inner.is_live(session) {
        return StatusCode::NOT_FOUND;
    }

    if let Some(reply) = inner.handle(&msg).await {
        let sender = inner.sse_senders.lock().unwrap().get(session).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(reply.to_string());
        }
    }
    StatusCode::ACCEPTED
}
