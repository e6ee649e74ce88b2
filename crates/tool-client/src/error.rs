//! Error types for tool-protocol client operations

/// Errors from connecting to and talking with the remote tool provider.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The bearer token could not be obtained (not signed in, refresh rejected, ...).
    #[error("authorization error: {0}")]
    Auth(#[from] tool_auth::Error),

    /// Neither transport could establish a session.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("tool '{name}' failed: {cause}")]
    ToolInvocationFailed { name: String, cause: String },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("tool endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("session expired")]
    SessionExpired,

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("server error [{code}]: {message}")]
    Rpc { code: i64, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Whether the live connection is unusable after this error. The client
    /// drops its handle so the next call reconnects.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Error::SessionExpired
                | Error::ConnectionClosed(_)
                | Error::Status { status: 401, .. }
        )
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. } | Error::Transport(_) => true,
            Error::Auth(e) => e.is_retryable(),
            _ => self.is_connection_lost(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

/// Result alias for tool client operations.
pub type Result<T> = std::result::Result<T, Error>;
