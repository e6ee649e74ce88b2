//! Client for the remote tool provider
//!
//! Discovers and invokes tools over one of two JSON-RPC transports:
//! Streamable HTTP first, falling back to the legacy SSE stream when that
//! fails. The bearer token comes from a `TokenSource`, normally the
//! `tool_auth::AuthFlow`, so an expiring token is refreshed before each
//! connect.
//!
//! The orchestrator talks to tools through the `ToolProvider` trait so it can
//! run against a scripted provider in tests.

pub mod client;
pub mod error;
pub mod event_stream;
pub mod jsonrpc;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{ToolClient, ToolClientConfig};
pub use error::{Error, Result};
pub use transport::TransportKind;
pub use types::{PROTOCOL_VERSION, ServerInfo, ToolDescriptor};

use common::Secret;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

/// Supplies the bearer token used when a connection is established.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn TokenSource>`).
pub trait TokenSource: Send + Sync {
    fn bearer_token(
        &self,
    ) -> Pin<Box<dyn Future<Output = tool_auth::Result<Secret<String>>> + Send + '_>>;
}

impl TokenSource for tool_auth::AuthFlow {
    fn bearer_token(
        &self,
    ) -> Pin<Box<dyn Future<Output = tool_auth::Result<Secret<String>>> + Send + '_>> {
        Box::pin(self.get_valid_token())
    }
}

/// Connection status for the /health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ToolHealth {
    pub connected: bool,
    /// A handshake is in flight.
    pub connecting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
}

/// Abstraction over where tools come from.
pub trait ToolProvider: Send + Sync {
    /// Every tool currently advertised.
    fn list_tools(&self) -> Pin<Box<dyn Future<Output = Result<Vec<ToolDescriptor>>> + Send + '_>>;

    /// Invoke a tool. Provider-side failures are `Error::ToolInvocationFailed`.
    fn call_tool<'a>(
        &'a self,
        name: &'a str,
        arguments: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send + 'a>>;

    /// Drop any live connection.
    fn disconnect(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    fn health(&self) -> Pin<Box<dyn Future<Output = ToolHealth> + Send + '_>>;
}

impl ToolProvider for ToolClient {
    fn list_tools(&self) -> Pin<Box<dyn Future<Output = Result<Vec<ToolDescriptor>>> + Send + '_>> {
        Box::pin(ToolClient::list_tools(self))
    }

    fn call_tool<'a>(
        &'a self,
        name: &'a str,
        arguments: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send + 'a>> {
        Box::pin(ToolClient::call_tool(self, name, arguments))
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(ToolClient::disconnect(self))
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = ToolHealth> + Send + '_>> {
        Box::pin(async move { ToolClient::health(self) })
    }
}
