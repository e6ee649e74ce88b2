//! Tool-protocol client with lazy, single-flight connection management

use std::collections::HashSet;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{TokenSource, ToolHealth};
use crate::error::{Error, Result};
use crate::transport::{Transport, TransportKind, TransportParams, with_deadline};
use crate::types::{ListToolsPage, ServerInfo, ToolDescriptor, content_text};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Transports in the order they are attempted.
const TRANSPORT_ORDER: [TransportKind; 2] = [TransportKind::StreamableHttp, TransportKind::Sse];

/// Where and how patiently to talk to the provider.
#[derive(Debug, Clone)]
pub struct ToolClientConfig {
    pub endpoint: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl ToolClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// A live, initialized session.
struct Connection {
    transport: Transport,
    server: ServerInfo,
}

/// Client for the remote tool provider.
///
/// Holds at most one connection. The connection mutex is held while
/// connecting, so concurrent callers wait for a single handshake; afterwards
/// the connection is cloned out and requests run in parallel.
///
/// `live` mirrors the transport of the connection in the slot and is only
/// written with the connection mutex held.
pub struct ToolClient {
    endpoint: reqwest::Url,
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    request_timeout: Duration,
    connect_timeout: Duration,
    connection: Mutex<Option<Arc<Connection>>>,
    live: std::sync::Mutex<Option<TransportKind>>,
}

impl ToolClient {
    pub fn new(
        config: ToolClientConfig,
        http: reqwest::Client,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self> {
        let endpoint = reqwest::Url::parse(&config.endpoint).map_err(|e| {
            Error::ConnectFailed(format!("invalid tool endpoint '{}': {e}", config.endpoint))
        })?;
        Ok(Self {
            endpoint,
            http,
            tokens,
            request_timeout: config.request_timeout,
            connect_timeout: config.connect_timeout,
            connection: Mutex::new(None),
            live: std::sync::Mutex::new(None),
        })
    }

    /// Establish a session if none is live. A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        self.connection().await.map(drop)
    }

    /// Every tool the provider advertises, following pagination.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let conn = self.connection().await?;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();

        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.request(&conn, "tools/list", params).await?;
            let page: ListToolsPage = serde_json::from_value(result)
                .map_err(|e| Error::Protocol(format!("invalid tools/list result: {e}")))?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => {
                    if !seen.insert(next.clone()) {
                        return Err(Error::Protocol(format!(
                            "tools/list returned cursor '{next}' more than once"
                        )));
                    }
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        info!(count = tools.len(), server = %conn.server.name, "listed tools");
        Ok(tools)
    }

    /// Invoke a tool and return the provider's result verbatim.
    ///
    /// Connection and authorization failures propagate as themselves. Anything
    /// the provider reports about the call (JSON-RPC error, transport failure,
    /// a result flagged `isError`) becomes `ToolInvocationFailed`. Timeouts stay
    /// `Timeout`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let conn = self.connection().await?;
        let params = json!({ "name": name, "arguments": arguments });

        let result = match self.request(&conn, "tools/call", Some(params)).await {
            Ok(result) => result,
            Err(e @ Error::Timeout { .. }) => return Err(e),
            Err(e) => {
                return Err(Error::ToolInvocationFailed {
                    name: name.to_string(),
                    cause: e.to_string(),
                });
            }
        };

        if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
            return Err(Error::ToolInvocationFailed {
                name: name.to_string(),
                cause: content_text(&result),
            });
        }
        Ok(result)
    }

    /// Close the session. Safe to call repeatedly or when never connected.
    pub async fn disconnect(&self) {
        let conn = {
            let mut slot = self.connection.lock().await;
            self.set_live(None);
            slot.take()
        };
        if let Some(conn) = conn {
            conn.transport.close().await;
            info!(transport = %conn.transport.kind(), "disconnected from tool provider");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport_kind().is_some()
    }

    pub fn transport_kind(&self) -> Option<TransportKind> {
        *self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connection status. Never waits on a handshake in progress.
    pub fn health(&self) -> ToolHealth {
        let transport = self.transport_kind();
        // The slot is locked for the whole handshake; a short lock with a
        // live connection is a request cloning it out.
        let connecting = transport.is_none() && self.connection.try_lock().is_err();
        ToolHealth {
            connected: transport.is_some(),
            connecting,
            transport,
        }
    }

    fn set_live(&self, kind: Option<TransportKind>) {
        *self.live.lock().unwrap_or_else(PoisonError::into_inner) = kind;
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(Arc::clone(conn));
        }
        let conn = Arc::new(self.establish().await?);
        self.set_live(Some(conn.transport.kind()));
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    async fn establish(&self) -> Result<Connection> {
        let bearer = self.tokens.bearer_token().await?;
        let mut last_error = None;

        for kind in TRANSPORT_ORDER {
            let params = TransportParams {
                http: self.http.clone(),
                endpoint: self.endpoint.clone(),
                bearer: bearer.clone(),
            };
            let attempt = with_deadline(
                format!("connect via {kind}"),
                self.connect_timeout,
                Transport::open(kind, params),
            )
            .await;

            match attempt {
                Ok((transport, server)) => {
                    metrics::counter!("tool_client_connects_total", "transport" => kind.as_str(), "outcome" => "success").increment(1);
                    info!(transport = %kind, server = %server.name, version = %server.version, "connected to tool provider");
                    return Ok(Connection { transport, server });
                }
                Err(e) => {
                    metrics::counter!("tool_client_connects_total", "transport" => kind.as_str(), "outcome" => "failure").increment(1);
                    warn!(transport = %kind, error = %e, "tool transport failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e @ Error::Timeout { .. }) => e,
            Some(e) => Error::ConnectFailed(e.to_string()),
            None => Error::ConnectFailed("no transport attempted".into()),
        })
    }

    /// Run a request on `conn`, dropping the handle if the session died.
    async fn request(
        &self,
        conn: &Arc<Connection>,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let result = with_deadline(
            method,
            self.request_timeout,
            conn.transport.request(method, params),
        )
        .await;

        if let Err(e) = &result
            && e.is_connection_lost()
        {
            let mut slot = self.connection.lock().await;
            if slot.as_ref().is_some_and(|live| Arc::ptr_eq(live, conn)) {
                warn!(error = %e, "tool connection lost, will reconnect on next use");
                self.set_live(None);
                *slot = None;
            }
        }
        result
    }
}
