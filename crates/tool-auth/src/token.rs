//! OAuth token exchange and refresh
//!
//! Handles the two token endpoint interactions:
//! 1. Authorization code exchange (completing the redirect flow)
//! 2. Token refresh (inline, when the access token is about to expire)
//!
//! Both operations POST a form body to `OAuthSettings::token_url` with
//! different grant types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::settings::OAuthSettings;

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time; the token
/// store converts it to an absolute timestamp. Providers may omit it, and
/// refresh responses may omit `refresh_token` (the previous one stays valid).
#[derive(Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Exchange an authorization code for tokens.
///
/// Sends the code along with the PKCE verifier to prove this client
/// initiated the flow. A non-success status is `TokenExchangeFailed`
/// carrying the endpoint's status and body.
pub async fn exchange_code(
    client: &reqwest::Client,
    settings: &OAuthSettings,
    code: &str,
    verifier: &str,
) -> Result<TokenResponse> {
    let mut form = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", settings.redirect_uri.as_str()),
        ("client_id", settings.client_id.as_str()),
        ("code_verifier", verifier),
    ];
    if let Some(secret) = &settings.client_secret {
        form.push(("client_secret", secret.expose().as_str()));
    }

    let response = client
        .post(&settings.token_url)
        .form(&form)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::TokenExchangeFailed {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchangeFailed {
            status: status.as_u16(),
            body: format!("invalid token response: {e}"),
        })
}

/// Refresh an access token using a refresh token.
///
/// Any rejection by the endpoint (non-success status or unusable body) is
/// `RefreshFailed`. Transport failures stay `Http` so the caller can tell
/// an unreachable endpoint from a revoked refresh token.
pub async fn refresh_token(
    client: &reqwest::Client,
    settings: &OAuthSettings,
    refresh: &str,
) -> Result<TokenResponse> {
    let mut form = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh),
        ("client_id", settings.client_id.as_str()),
    ];
    if let Some(secret) = &settings.client_secret {
        form.push(("client_secret", secret.expose().as_str()));
    }

    let response = client
        .post(&settings.token_url)
        .form(&form)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::RefreshFailed(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::RefreshFailed(format!("invalid refresh response: {e}")))
}
