//! PKCE (Proof Key for Code Exchange) implementation per RFC 7636
//!
//! Generates the code verifier, the S256 challenge and the anti-CSRF state
//! nonce used during the authorization redirect. The verifier stays
//! server-side until token exchange; the challenge and state travel in the
//! authorization URL.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::settings::OAuthSettings;

/// Random bytes behind each verifier. 64 bytes encode to 86 characters,
/// inside RFC 7636's 43-128 range.
const VERIFIER_BYTES: usize = 64;

/// Random bytes behind each state nonce.
const STATE_BYTES: usize = 32;

fn random_token<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a cryptographically random PKCE code verifier.
pub fn generate_verifier() -> String {
    random_token::<VERIFIER_BYTES>()
}

/// Generate the opaque state nonce echoed back by the provider callback.
pub fn generate_state() -> String {
    random_token::<STATE_BYTES>()
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Build the provider authorization URL with all required OAuth parameters.
pub fn build_authorization_url(
    settings: &OAuthSettings,
    state: &str,
    challenge: &str,
) -> Result<String> {
    let scope = settings.scope_param();
    let url = reqwest::Url::parse_with_params(
        &settings.authorize_url,
        &[
            ("response_type", "code"),
            ("client_id", settings.client_id.as_str()),
            ("redirect_uri", settings.redirect_uri.as_str()),
            ("scope", scope.as_str()),
            ("state", state),
            ("code_challenge", challenge),
            ("code_challenge_method", "S256"),
        ],
    )
    .map_err(|e| Error::Settings(format!("invalid authorize_url: {e}")))?;
    Ok(url.into())
}

/// Compare two state values without short-circuiting on the first
/// differing byte.
pub fn states_match(expected: &str, received: &str) -> bool {
    let a = expected.as_bytes();
    let b = received.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
