//! Token storage for the single authorized user
//!
//! Holds the current access/refresh token pair and its absolute expiry.
//! The store is owned by `AuthFlow` behind a mutex; nothing else mutates it.
//!
//! When constructed with a path, every mutation is persisted with an atomic
//! temp-file + rename write (0600) so a restart does not force a new login.

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::token::TokenResponse;

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The stored token pair.
///
/// `expires_at` is a unix timestamp in milliseconds (absolute, not a delta),
/// computed once from `TokenResponse.expires_in` when the token is stored.
/// `None` means the provider gave no lifetime and no expiry is assumed.
#[derive(Debug, Clone)]
pub struct TokenData {
    pub access_token: Secret<String>,
    pub refresh_token: Option<Secret<String>>,
    pub token_type: String,
    pub expires_at: Option<u64>,
}

impl TokenData {
    /// Build token data from a token endpoint response received at `issued_at`.
    pub fn from_response(response: TokenResponse, issued_at: u64) -> Self {
        Self {
            access_token: Secret::new(response.access_token),
            refresh_token: response.refresh_token.map(Secret::new),
            token_type: response.token_type,
            expires_at: response
                .expires_in
                .map(|secs| issued_at.saturating_add(secs.saturating_mul(1000))),
        }
    }

    /// Whether the token expires within `margin` of `now` (unix millis).
    /// Tokens without an expiry never do.
    pub fn expires_within(&self, now: u64, margin: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now.saturating_add(margin.as_millis() as u64),
            None => false,
        }
    }
}

/// On-disk representation. Kept separate so `TokenData` never derives
/// `Serialize` on its secrets.
#[derive(Serialize, Deserialize)]
struct StoredToken {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    token_type: String,
    #[serde(default)]
    expires_at: Option<u64>,
}

impl From<&TokenData> for StoredToken {
    fn from(token: &TokenData) -> Self {
        Self {
            access_token: token.access_token.expose().clone(),
            refresh_token: token.refresh_token.as_ref().map(|r| r.expose().clone()),
            token_type: token.token_type.clone(),
            expires_at: token.expires_at,
        }
    }
}

impl From<StoredToken> for TokenData {
    fn from(stored: StoredToken) -> Self {
        Self {
            access_token: Secret::new(stored.access_token),
            refresh_token: stored.refresh_token.map(Secret::new),
            token_type: stored.token_type,
            expires_at: stored.expires_at,
        }
    }
}

/// Holder of the current token, optionally backed by a file.
#[derive(Debug, Default)]
pub struct TokenStore {
    path: Option<PathBuf>,
    token: Option<TokenData>,
}

impl TokenStore {
    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the token persisted at `path`.
    ///
    /// A missing file is a cold start with no token.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let token = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading token file: {e}")))?;
            let stored: StoredToken = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing token file: {e}")))?;
            info!(path = %path.display(), "loaded persisted token");
            Some(TokenData::from(stored))
        } else {
            info!(path = %path.display(), "token file not found, starting unauthenticated");
            None
        };

        Ok(Self {
            path: Some(path),
            token,
        })
    }

    /// The current token, if any.
    pub fn token(&self) -> Option<&TokenData> {
        self.token.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Replace the stored token and persist it.
    pub async fn set(&mut self, token: TokenData) -> Result<()> {
        if let Some(path) = &self.path {
            write_atomic(path, &StoredToken::from(&token)).await?;
        }
        self.token = Some(token);
        debug!("stored token");
        Ok(())
    }

    /// Drop the stored token and its persisted copy.
    pub async fn clear(&mut self) -> Result<()> {
        self.token = None;
        if let Some(path) = &self.path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(format!("removing token file: {e}"))),
            }
        }
        debug!("cleared token");
        Ok(())
    }
}

/// Write the token to a file atomically with 0600 permissions.
async fn write_atomic(path: &Path, token: &StoredToken) -> Result<()> {
    let json = serde_json::to_string_pretty(token)
        .map_err(|e| Error::CredentialParse(format!("serializing token: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("token path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".token.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting token file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp token file: {e}")))?;

    debug!(path = %path.display(), "persisted token");
    Ok(())
}
