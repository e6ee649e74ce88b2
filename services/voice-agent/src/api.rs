//! HTTP API over the orchestration engine
//!
//! Endpoints:
//! - `GET /auth/login`: redirect to the provider authorization URL
//! - `GET /auth/callback`: finish the login with `code` and `state`
//! - `GET /auth/status`: whether a token is held
//! - `POST /auth/logout`: forget the token and drop the tool connection
//! - `GET /tools`: every discovered tool, flagged `offered_to_model`
//! - `POST /tools/{name}`: call a tool directly with the JSON body as arguments
//! - `POST /prompt`: run the tool-calling loop on `{"text": ...}`
//! - `POST /webhook`: extract a transcript from a device payload, then run

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{FromRequestParts, MatchedPath, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use orchestrator::Engine;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::webhook::extract_transcript;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
}

/// Build the API router. Health and metrics live in `main`.
pub fn build_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/auth/login", get(login))
        .route("/auth/callback", get(callback))
        .route("/auth/status", get(auth_status))
        .route("/auth/logout", post(logout))
        .route("/tools", get(list_tools))
        .route("/tools/{name}", post(call_tool))
        .route("/prompt", post(prompt))
        .route("/webhook", post(webhook))
        .with_state(state)
}

/// Per-request id, `req_<uuid>`.
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(format!("req_{}", uuid::Uuid::new_v4().as_simple()))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for RequestId {
    type Rejection = Infallible;

    async fn from_request_parts(_parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::generate())
    }
}

/// JSON error body: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_response(status: StatusCode, kind: &str, message: &str, request_id: &RequestId) -> Response {
    let body = json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id.0,
        }
    });
    json_response(status, body)
}

fn json_response(status: StatusCode, body: Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Map an engine error to an HTTP status and error type.
fn classify(err: &orchestrator::Error) -> (StatusCode, &'static str) {
    use orchestrator::Error as E;

    if err.requires_reauthorization() {
        return (StatusCode::UNAUTHORIZED, "not_authenticated");
    }
    if err.is_timeout() {
        return (StatusCode::GATEWAY_TIMEOUT, "timeout");
    }
    match err.auth_error() {
        Some(tool_auth::Error::StateMismatch | tool_auth::Error::NoPendingAuthorization) => {
            return (StatusCode::BAD_REQUEST, "invalid_callback");
        }
        Some(tool_auth::Error::TokenExchangeFailed { .. } | tool_auth::Error::Http(_)) => {
            return (StatusCode::BAD_GATEWAY, "token_exchange_failed");
        }
        _ => {}
    }
    match err {
        E::Tools(tool_client::Error::ConnectFailed(_)) => (StatusCode::BAD_GATEWAY, "connect_failed"),
        E::Tools(tool_client::Error::ToolInvocationFailed { .. }) => {
            (StatusCode::BAD_GATEWAY, "tool_invocation_failed")
        }
        E::ChatFailed(_) => (StatusCode::BAD_GATEWAY, "chat_failed"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

fn engine_error(err: &orchestrator::Error, request_id: &RequestId) -> Response {
    let (status, kind) = classify(err);
    if status.is_server_error() {
        warn!(error = %err, status = status.as_u16(), "request failed");
    } else {
        info!(error = %err, status = status.as_u16(), "request rejected");
    }
    error_response(status, kind, &err.to_string(), request_id)
}

/// GET /auth/login: 302 to the provider.
#[instrument(skip_all, fields(request_id = %request_id))]
async fn login(State(state): State<ApiState>, request_id: RequestId) -> Response {
    match state.engine.begin_authorization().await {
        Ok(url) => (StatusCode::FOUND, [(header::LOCATION, url)]).into_response(),
        Err(e) => engine_error(&e, &request_id),
    }
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// GET /auth/callback: the provider redirects here after consent.
#[instrument(skip_all, fields(request_id = %request_id))]
async fn callback(
    State(state): State<ApiState>,
    request_id: RequestId,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(error) = params.error {
        let message = match params.error_description {
            Some(description) => format!("{error}: {description}"),
            None => error,
        };
        warn!(%message, "provider denied authorization");
        return error_response(StatusCode::BAD_REQUEST, "authorization_denied", &message, &request_id);
    }

    let (Some(code), Some(auth_state)) = (params.code, params.state) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_callback",
            "callback requires both code and state",
            &request_id,
        );
    };

    match state.engine.complete_authorization(&code, &auth_state).await {
        Ok(()) => json_response(StatusCode::OK, json!({ "authenticated": true })),
        Err(e) => engine_error(&e, &request_id),
    }
}

/// GET /auth/status
async fn auth_status(State(state): State<ApiState>) -> Response {
    let authenticated = state.engine.is_authenticated().await;
    json_response(StatusCode::OK, json!({ "authenticated": authenticated }))
}

/// POST /auth/logout
#[instrument(skip_all, fields(request_id = %request_id))]
async fn logout(State(state): State<ApiState>, request_id: RequestId) -> Response {
    match state.engine.sign_out().await {
        Ok(()) => json_response(StatusCode::OK, json!({ "authenticated": false })),
        Err(e) => engine_error(&e, &request_id),
    }
}

/// GET /tools
#[instrument(skip_all, fields(request_id = %request_id))]
async fn list_tools(State(state): State<ApiState>, request_id: RequestId) -> Response {
    match state.engine.list_available_tools().await {
        Ok(tools) => json_response(StatusCode::OK, json!({ "tools": tools })),
        Err(e) => engine_error(&e, &request_id),
    }
}

/// POST /tools/{name}: an empty body calls with `{}`.
#[instrument(skip_all, fields(request_id = %request_id, tool = %name))]
async fn call_tool(
    State(state): State<ApiState>,
    request_id: RequestId,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let arguments = if body.is_empty() {
        json!({})
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    "tool arguments must be a JSON object",
                    &request_id,
                );
            }
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    &format!("invalid JSON body: {e}"),
                    &request_id,
                );
            }
        }
    };

    match state.engine.call_tool_directly(&name, arguments).await {
        Ok(result) => json_response(StatusCode::OK, result),
        Err(e) => engine_error(&e, &request_id),
    }
}

#[derive(Debug, Deserialize)]
struct PromptRequest {
    text: String,
}

/// POST /prompt
#[instrument(skip_all, fields(request_id = %request_id))]
async fn prompt(
    State(state): State<ApiState>,
    request_id: RequestId,
    body: Bytes,
) -> Response {
    let text = match serde_json::from_slice::<PromptRequest>(&body) {
        Ok(request) => request.text,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("expected {{\"text\": ...}}: {e}"),
                &request_id,
            );
        }
    };
    if text.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "empty_prompt",
            "prompt text must not be empty",
            &request_id,
        );
    }
    run(&state, text.trim(), &request_id).await
}

/// POST /webhook
#[instrument(skip_all, fields(request_id = %request_id))]
async fn webhook(
    State(state): State<ApiState>,
    request_id: RequestId,
    body: Bytes,
) -> Response {
    let transcript = serde_json::from_slice::<Value>(&body)
        .ok()
        .as_ref()
        .and_then(extract_transcript);
    let Some(transcript) = transcript else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "unrecognized_payload",
            "payload carries no transcript text",
            &request_id,
        );
    };
    info!(chars = transcript.len(), "webhook transcript received");
    run(&state, &transcript, &request_id).await
}

/// Run a prompt to completion.
///
/// The run is bounded by `max_iterations` and the per-call deadlines of the
/// auth, tool and chat clients. It executes in its own task so a dropped
/// client connection cannot cancel it halfway through a token refresh.
async fn run(state: &ApiState, text: &str, request_id: &RequestId) -> Response {
    let started = Instant::now();
    let engine = Arc::clone(&state.engine);
    let text = text.to_owned();
    let task = tokio::spawn(async move { engine.run_prompt(&text).await });

    match task.await {
        Ok(Ok(outcome)) => {
            info!(
                iterations = outcome.iterations,
                tool_calls = outcome.tool_calls.len(),
                capped = outcome.capped,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "prompt run finished"
            );
            match serde_json::to_value(&outcome) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    &format!("serializing run outcome: {e}"),
                    request_id,
                ),
            }
        }
        Ok(Err(e)) => engine_error(&e, request_id),
        Err(e) => {
            warn!(error = %e, "prompt run task failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "prompt run did not complete",
                request_id,
            )
        }
    }
}

/// Middleware recording `http_requests_total` and
/// `http_request_duration_seconds` by matched route.
pub async fn track_metrics(request: Request<Body>, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let method = request.method().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    crate::metrics::record_request(
        &route,
        &method,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}
