//! OAuth client settings for the remote tool provider
//!
//! The client id, endpoints and redirect URI identify this deployment to the
//! provider. The optional client secret is only sent to the token endpoint.

use common::Secret;

use crate::error::{Error, Result};

/// Provider endpoints and client identity used by the authorization flow.
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    /// Confidential clients only; public PKCE clients leave this unset
    pub client_secret: Option<Secret<String>>,
    pub authorize_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

impl OAuthSettings {
    /// Space-separated scope parameter as sent in the authorization URL.
    pub fn scope_param(&self) -> String {
        self.scopes.join(" ")
    }

    /// Reject settings that cannot produce a working authorization flow.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Settings("client_id must not be empty".into()));
        }
        for (field, url) in [
            ("authorize_url", &self.authorize_url),
            ("token_url", &self.token_url),
            ("redirect_uri", &self.redirect_uri),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::Settings(format!(
                    "{field} must start with http:// or https://, got: {url}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_settings(token_url: &str) -> OAuthSettings {
    OAuthSettings {
        client_id: "voice-agent-test".into(),
        client_secret: None,
        authorize_url: "https://provider.example.com/oauth/authorize".into(),
        token_url: token_url.into(),
        redirect_uri: "http://localhost:8080/auth/callback".into(),
        scopes: vec!["tools:read".into(), "tools:execute".into()],
    }
}
