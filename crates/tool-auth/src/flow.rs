//! Authorization flow manager
//!
//! Drives the PKCE redirect flow and keeps the stored token usable. Two
//! pieces of shared state live here:
//!
//! - the single `PendingAuthorization` between redirect and callback
//! - the `TokenStore`, whose mutex is held across the expiry check and any
//!   resulting refresh so concurrent callers never refresh twice with the
//!   same single-use refresh token

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use common::Secret;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pkce;
use crate::settings::OAuthSettings;
use crate::store::{TokenData, TokenStore, now_millis};
use crate::token;

/// Tokens expiring within this margin are refreshed before use.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Maximum age of a pending authorization before its callback is refused.
const PENDING_EXPIRY: Duration = Duration::from_secs(600);

/// Default timeout for token endpoint calls.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// PKCE verifier and state nonce for the redirect currently in flight.
pub struct PendingAuthorization {
    verifier: String,
    state: String,
    created_at: Instant,
}

impl fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("verifier", &"[REDACTED]")
            .field("state", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Owner of the token lifecycle for one deployment's single user.
pub struct AuthFlow {
    settings: OAuthSettings,
    http: reqwest::Client,
    timeout: Duration,
    tokens: Mutex<TokenStore>,
    pending: Mutex<Option<PendingAuthorization>>,
}

impl AuthFlow {
    pub fn new(settings: OAuthSettings, http: reqwest::Client, store: TokenStore) -> Self {
        Self {
            settings,
            http,
            timeout: DEFAULT_TIMEOUT,
            tokens: Mutex::new(store),
            pending: Mutex::new(None),
        }
    }

    /// Override the timeout applied to code exchange and refresh calls.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Start a login: store a fresh verifier + state and return the
    /// provider authorization URL.
    ///
    /// Any earlier pending authorization is replaced.
    pub async fn begin_authorization(&self) -> Result<String> {
        let verifier = pkce::generate_verifier();
        let challenge = pkce::compute_challenge(&verifier);
        let state = pkce::generate_state();
        let url = pkce::build_authorization_url(&self.settings, &state, &challenge)?;

        let mut pending = self.pending.lock().await;
        if pending.is_some() {
            debug!("replacing previous pending authorization");
        }
        *pending = Some(PendingAuthorization {
            verifier,
            state,
            created_at: Instant::now(),
        });

        info!("authorization flow started");
        Ok(url)
    }

    /// Finish a login from the provider callback.
    ///
    /// The pending authorization is consumed whether or not the callback
    /// checks out, so a mismatched or replayed callback cannot be retried.
    pub async fn complete_authorization(&self, code: &str, state: &str) -> Result<()> {
        let pending = self
            .pending
            .lock()
            .await
            .take()
            .ok_or(Error::NoPendingAuthorization)?;

        if pending.created_at.elapsed() > PENDING_EXPIRY {
            warn!("authorization callback arrived after the pending flow expired");
            return Err(Error::NoPendingAuthorization);
        }

        if !pkce::states_match(&pending.state, state) {
            warn!("authorization callback state mismatch, rejecting");
            return Err(Error::StateMismatch);
        }

        let issued_at = now_millis();
        let response = self
            .timed(
                "token exchange",
                token::exchange_code(&self.http, &self.settings, code, &pending.verifier),
            )
            .await
            .inspect_err(|e| warn!(error = %e, "authorization code exchange failed"))?;

        let token = TokenData::from_response(response, issued_at);
        let has_refresh = token.refresh_token.is_some();
        let expires_at = token.expires_at;
        self.tokens.lock().await.set(token).await?;

        info!(has_refresh, ?expires_at, "authorization completed");
        Ok(())
    }

    /// Exchange the stored refresh token for a new token pair.
    ///
    /// A rejection clears the stored token; the user has to log in again.
    pub async fn refresh(&self) -> Result<()> {
        let mut store = self.tokens.lock().await;
        self.refresh_locked(&mut store).await
    }

    /// Return an access token that is valid for at least `REFRESH_MARGIN`,
    /// refreshing inline when needed.
    pub async fn get_valid_token(&self) -> Result<Secret<String>> {
        let mut store = self.tokens.lock().await;
        let needs_refresh = store
            .token()
            .ok_or(Error::NotAuthenticated)?
            .expires_within(now_millis(), REFRESH_MARGIN);

        if needs_refresh {
            debug!("access token expiring soon, refreshing inline");
            self.refresh_locked(&mut store).await?;
        }

        let token = store.token().ok_or(Error::NotAuthenticated)?;
        Ok(token.access_token.clone())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.tokens.lock().await.is_authenticated()
    }

    /// Forget the stored token and any pending authorization.
    pub async fn sign_out(&self) -> Result<()> {
        self.pending.lock().await.take();
        self.tokens.lock().await.clear().await?;
        info!("signed out");
        Ok(())
    }

    async fn refresh_locked(&self, store: &mut TokenStore) -> Result<()> {
        let refresh = store
            .token()
            .ok_or(Error::NotAuthenticated)?
            .refresh_token
            .clone()
            .ok_or(Error::NoRefreshToken)?;

        let issued_at = now_millis();
        let result = self
            .timed(
                "token refresh",
                token::refresh_token(&self.http, &self.settings, refresh.expose()),
            )
            .await;

        match result {
            Ok(response) => {
                let mut token = TokenData::from_response(response, issued_at);
                if token.refresh_token.is_none() {
                    token.refresh_token = Some(refresh);
                }
                store.set(token).await?;
                metrics::counter!("oauth_token_refresh_total", "outcome" => "success").increment(1);
                info!("token refresh succeeded");
                Ok(())
            }
            Err(Error::RefreshFailed(msg)) => {
                metrics::counter!("oauth_token_refresh_total", "outcome" => "rejected")
                    .increment(1);
                warn!(error = %msg, "refresh token rejected, clearing stored token");
                if let Err(e) = store.clear().await {
                    warn!(error = %e, "failed to remove persisted token");
                }
                Err(Error::RefreshFailed(msg))
            }
            Err(e) => {
                metrics::counter!("oauth_token_refresh_total", "outcome" => "error").increment(1);
                warn!(error = %e, "token refresh failed, keeping stored token");
                Err(e)
            }
        }
    }

    async fn timed<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::Timeout {
                operation,
                secs: self.timeout.as_secs(),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::test_settings;
    use crate::token::test_support::{spawn_slow_token_endpoint, spawn_token_endpoint};
    use axum::http::StatusCode;
    use std::sync::Arc;

    fn query_param(url: &str, name: &str) -> String {
        reqwest::Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    fn token_expiring_at(expires_at: Option<u64>, refresh: Option<&str>) -> TokenData {
        TokenData {
            access_token: Secret::new("at_old".into()),
            refresh_token: refresh.map(|r| Secret::new(r.to_string())),
            token_type: "Bearer".into(),
            expires_at,
        }
    }

    async fn flow_with_token(token_url: &str, token: Option<TokenData>) -> AuthFlow {
        let mut store = TokenStore::in_memory();
        if let Some(token) = token {
            store.set(token).await.unwrap();
        }
        AuthFlow::new(test_settings(token_url), reqwest::Client::new(), store)
    }

    fn ok_token_body() -> serde_json::Value {
        serde_json::json!({
            "access_token": "at_new",
            "refresh_token": "rt_new",
            "token_type": "Bearer",
            "expires_in": 3600
        })
    }

    #[tokio::test]
    async fn pkce_challenge_in_url_matches_verifier_replayed_at_exchange() {
        let endpoint = spawn_token_endpoint(StatusCode::OK, ok_token_body()).await;
        let flow = flow_with_token(&endpoint.url, None).await;

        let url = flow.begin_authorization().await.unwrap();
        let state = query_param(&url, "state");
        let challenge = query_param(&url, "code_challenge");
        assert_eq!(query_param(&url, "code_challenge_method"), "S256");

        flow.complete_authorization("code-1", &state).await.unwrap();

        let form = endpoint.last_request();
        assert_eq!(form["code"], "code-1");
        assert_eq!(pkce::compute_challenge(&form["code_verifier"]), challenge);
        assert!(flow.is_authenticated().await);
    }

    #[tokio::test]
    async fn complete_without_begin_is_no_pending() {
        let endpoint = spawn_token_endpoint(StatusCode::OK, ok_token_body()).await;
        let flow = flow_with_token(&endpoint.url, None).await;

        let err = flow.complete_authorization("code", "state").await.unwrap_err();
        assert!(matches!(err, Error::NoPendingAuthorization), "got {err:?}");
        assert_eq!(endpoint.request_count(), 0);
    }

    #[tokio::test]
    async fn one_character_state_difference_is_rejected() {
        let endpoint = spawn_token_endpoint(StatusCode::OK, ok_token_body()).await;
        let flow = flow_with_token(&endpoint.url, None).await;

        let url = flow.begin_authorization().await.unwrap();
        let mut state = query_param(&url, "state");
        let last = state.pop().unwrap();
        state.push(if last == 'A' { 'B' } else { 'A' });

        let err = flow.complete_authorization("code", &state).await.unwrap_err();
        assert!(matches!(err, Error::StateMismatch), "got {err:?}");
        assert_eq!(endpoint.request_count(), 0, "no exchange on mismatch");
        assert!(!flow.is_authenticated().await);
    }

    #[tokio::test]
    async fn mismatched_callback_consumes_pending_authorization() {
        let endpoint = spawn_token_endpoint(StatusCode::OK, ok_token_body()).await;
        let flow = flow_with_token(&endpoint.url, None).await;

        let url = flow.begin_authorization().await.unwrap();
        let state = query_param(&url, "state");
        flow.complete_authorization("code", "forged").await.unwrap_err();

        let err = flow.complete_authorization("code", &state).await.unwrap_err();
        assert!(matches!(err, Error::NoPendingAuthorization), "got {err:?}");
    }

    #[tokio::test]
    async fn new_login_replaces_previous_pending() {
        let endpoint = spawn_token_endpoint(StatusCode::OK, ok_token_body()).await;
        let flow = flow_with_token(&endpoint.url, None).await;

        let first = query_param(&flow.begin_authorization().await.unwrap(), "state");
        let second = query_param(&flow.begin_authorization().await.unwrap(), "state");
        assert_ne!(first, second);

        let err = flow.complete_authorization("code", &first).await.unwrap_err();
        assert!(matches!(err, Error::StateMismatch), "got {err:?}");
    }

    #[tokio::test]
    async fn expired_pending_authorization_is_refused() {
        let endpoint = spawn_token_endpoint(StatusCode::OK, ok_token_body()).await;
        let flow = flow_with_token(&endpoint.url, None).await;

        let url = flow.begin_authorization().await.unwrap();
        let state = query_param(&url, "state");
        let Some(long_ago) = Instant::now().checked_sub(PENDING_EXPIRY + Duration::from_secs(1))
        else {
            return;
        };
        flow.pending.lock().await.as_mut().unwrap().created_at = long_ago;

        let err = flow.complete_authorization("code", &state).await.unwrap_err();
        assert!(matches!(err, Error::NoPendingAuthorization), "got {err:?}");
    }

    #[tokio::test]
    async fn exchange_rejection_leaves_user_unauthenticated() {
        let endpoint = spawn_token_endpoint(
            StatusCode::BAD_REQUEST,
            serde_json::json!({"error": "invalid_grant"}),
        )
        .await;
        let flow = flow_with_token(&endpoint.url, None).await;

        let state = query_param(&flow.begin_authorization().await.unwrap(), "state");
        let err = flow.complete_authorization("code", &state).await.unwrap_err();
        assert!(
            matches!(err, Error::TokenExchangeFailed { status: 400, .. }),
            "got {err:?}"
        );
        assert!(!flow.is_authenticated().await);
    }

    #[tokio::test]
    async fn completed_token_has_absolute_expiry() {
        let endpoint = spawn_token_endpoint(StatusCode::OK, ok_token_body()).await;
        let flow = flow_with_token(&endpoint.url, None).await;

        let before = now_millis();
        let state = query_param(&flow.begin_authorization().await.unwrap(), "state");
        flow.complete_authorization("code", &state).await.unwrap();
        let after = now_millis();

        let store = flow.tokens.lock().await;
        let expires_at = store.token().unwrap().expires_at.unwrap();
        assert!(expires_at >= before + 3_600_000 && expires_at <= after + 3_600_000);
    }

    #[tokio::test]
    async fn get_valid_token_without_token_is_not_authenticated() {
        let flow = flow_with_token("http://127.0.0.1:1/oauth/token", None).await;
        let err = flow.get_valid_token().await.unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated), "got {err:?}");
    }

    #[tokio::test]
    async fn token_near_expiry_triggers_exactly_one_refresh() {
        let endpoint = spawn_token_endpoint(StatusCode::OK, ok_token_body()).await;
        let expiring = token_expiring_at(Some(now_millis() + 30_000), Some("rt_old"));
        let flow = flow_with_token(&endpoint.url, Some(expiring)).await;

        let token = flow.get_valid_token().await.unwrap();
        assert_eq!(token.expose(), "at_new");
        assert_eq!(endpoint.request_count(), 1);
        assert_eq!(endpoint.last_request()["refresh_token"], "rt_old");

        // The refreshed token is good for an hour; no further refresh
        flow.get_valid_token().await.unwrap();
        assert_eq!(endpoint.request_count(), 1);
    }

    #[tokio::test]
    async fn token_far_from_expiry_is_returned_unchanged() {
        let endpoint = spawn_token_endpoint(StatusCode::OK, ok_token_body()).await;
        let fresh = token_expiring_at(Some(now_millis() + 3_600_000), Some("rt_old"));
        let flow = flow_with_token(&endpoint.url, Some(fresh)).await;

        let token = flow.get_valid_token().await.unwrap();
        assert_eq!(token.expose(), "at_old");
        assert_eq!(endpoint.request_count(), 0);
    }

    #[tokio::test]
    async fn token_without_expiry_is_never_refreshed() {
        let endpoint = spawn_token_endpoint(StatusCode::OK, ok_token_body()).await;
        let flow = flow_with_token(&endpoint.url, Some(token_expiring_at(None, Some("rt")))).await;

        flow.get_valid_token().await.unwrap();
        assert_eq!(endpoint.request_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_callers_share_a_single_refresh() {
        let endpoint = spawn_slow_token_endpoint(
            StatusCode::OK,
            ok_token_body(),
            Duration::from_millis(50),
        )
        .await;
        let expiring = token_expiring_at(Some(now_millis() + 10_000), Some("rt_old"));
        let flow = Arc::new(flow_with_token(&endpoint.url, Some(expiring)).await);

        let mut handles = vec![];
        for _ in 0..5 {
            let flow = flow.clone();
            handles.push(tokio::spawn(async move { flow.get_valid_token().await }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap().expose(), "at_new");
        }
        assert_eq!(endpoint.request_count(), 1);
    }

    #[tokio::test]
    async fn refresh_rejection_clears_token() {
        let endpoint = spawn_token_endpoint(
            StatusCode::BAD_REQUEST,
            serde_json::json!({"error": "invalid_grant"}),
        )
        .await;
        let flow = flow_with_token(
            &endpoint.url,
            Some(token_expiring_at(Some(now_millis() + 5_000), Some("rt_revoked"))),
        )
        .await;

        let err = flow.get_valid_token().await.unwrap_err();
        assert!(matches!(err, Error::RefreshFailed(_)), "got {err:?}");
        assert!(!flow.is_authenticated().await);

        let err = flow.get_valid_token().await.unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated), "got {err:?}");
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_keeps_session() {
        let endpoint = spawn_token_endpoint(StatusCode::OK, ok_token_body()).await;
        let flow = flow_with_token(
            &endpoint.url,
            Some(token_expiring_at(Some(now_millis() + 5_000), None)),
        )
        .await;

        let err = flow.refresh().await.unwrap_err();
        assert!(matches!(err, Error::NoRefreshToken), "got {err:?}");
        assert!(flow.is_authenticated().await);
        assert_eq!(endpoint.request_count(), 0);
    }

    #[tokio::test]
    async fn refresh_response_without_refresh_token_keeps_previous_one() {
        let endpoint = spawn_token_endpoint(
            StatusCode::OK,
            serde_json::json!({"access_token": "at_rotated", "expires_in": 3600}),
        )
        .await;
        let flow = flow_with_token(
            &endpoint.url,
            Some(token_expiring_at(Some(now_millis()), Some("rt_keep"))),
        )
        .await;

        flow.refresh().await.unwrap();
        let store = flow.tokens.lock().await;
        let token = store.token().unwrap();
        assert_eq!(token.access_token.expose(), "at_rotated");
        assert_eq!(token.refresh_token.as_ref().unwrap().expose(), "rt_keep");
    }

    #[tokio::test]
    async fn refresh_timeout_is_distinct_and_keeps_token() {
        let endpoint = spawn_slow_token_endpoint(
            StatusCode::OK,
            ok_token_body(),
            Duration::from_millis(500),
        )
        .await;
        let flow = flow_with_token(
            &endpoint.url,
            Some(token_expiring_at(Some(now_millis()), Some("rt_old"))),
        )
        .await
        .with_timeout(Duration::from_millis(50));

        let err = flow.get_valid_token().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "got {err:?}");
        assert!(err.is_retryable());
        assert!(flow.is_authenticated().await);
    }

    #[tokio::test]
    async fn sign_out_clears_token_and_pending() {
        let endpoint = spawn_token_endpoint(StatusCode::OK, ok_token_body()).await;
        let flow = flow_with_token(&endpoint.url, Some(token_expiring_at(None, None))).await;
        let state = query_param(&flow.begin_authorization().await.unwrap(), "state");

        flow.sign_out().await.unwrap();
        assert!(!flow.is_authenticated().await);
        let err = flow.complete_authorization("code", &state).await.unwrap_err();
        assert!(matches!(err, Error::NoPendingAuthorization), "got {err:?}");
    }
}
