//! Error types for orchestration runs

/// Errors that end a run or a facade call.
///
/// Tool failures inside a run never surface here; they become tool-result
/// payloads the model can see.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] tool_auth::Error),

    #[error(transparent)]
    Tools(#[from] tool_client::Error),

    #[error("chat completion failed: {0}")]
    ChatFailed(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    /// Logged and replaced with empty arguments; never returned from a run.
    #[error("invalid arguments for tool '{tool}': {cause}")]
    ArgumentParseFailed { tool: String, cause: String },

    #[error("invalid orchestrator settings: {0}")]
    Settings(String),
}

impl Error {
    /// The authorization error behind this failure, if any, including one
    /// raised while the tool client fetched its bearer token.
    pub fn auth_error(&self) -> Option<&tool_auth::Error> {
        match self {
            Error::Auth(e) | Error::Tools(tool_client::Error::Auth(e)) => Some(e),
            _ => None,
        }
    }

    /// Whether the user has to sign in again before retrying.
    pub fn requires_reauthorization(&self) -> bool {
        self.auth_error()
            .is_some_and(tool_auth::Error::requires_reauthorization)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. }
                | Error::Tools(tool_client::Error::Timeout { .. })
                | Error::Auth(tool_auth::Error::Timeout { .. })
                | Error::Tools(tool_client::Error::Auth(tool_auth::Error::Timeout { .. }))
        )
    }
}

/// Result alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;
