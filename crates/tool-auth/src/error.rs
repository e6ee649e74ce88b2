//! Error types for OAuth authorization operations

/// Errors from the authorization flow and token store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no pending authorization (expired or never started)")]
    NoPendingAuthorization,

    #[error("state mismatch: callback state does not match the pending authorization")]
    StateMismatch,

    #[error("token exchange failed ({status}): {body}")]
    TokenExchangeFailed { status: u16, body: String },

    #[error("no refresh token available")]
    NoRefreshToken,

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("invalid OAuth settings: {0}")]
    Settings(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Whether the caller has to send the user back through the login redirect.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            Error::NotAuthenticated | Error::NoRefreshToken | Error::RefreshFailed(_)
        )
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::Http(_))
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
