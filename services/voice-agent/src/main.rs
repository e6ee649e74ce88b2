//! Voice Tool Gateway
//!
//! Single-binary service that:
//! 1. Signs the user in to the tool provider with OAuth2 + PKCE
//! 2. Connects to the provider's tool-protocol endpoint on demand
//! 3. Runs transcribed utterances through a bounded LLM tool-calling loop
//! 4. Exposes the loop over HTTP for device webhooks and direct prompts

mod api;
mod config;
mod metrics;
mod webhook;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;
use orchestrator::{Engine, HttpChatModel};
use tool_auth::{AuthFlow, TokenStore};
use tool_client::ToolClient;

use crate::api::ApiState;
use crate::config::Config;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    api: ApiState,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Every route is counted by the metrics middleware; the concurrency limit
/// caps in-flight requests at `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state.clone())
        .merge(api::build_api_router(state.api))
        .layer(axum::middleware::from_fn(api::track_metrics))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting voice-agent");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        tools_endpoint = %config.tools.endpoint,
        chat_model = %config.chat.model,
        max_iterations = config.orchestrator.max_iterations,
        persisted_token = config.oauth.token_file.is_some(),
        "configuration loaded"
    );

    let http = reqwest::Client::builder()
        .user_agent(concat!("voice-agent/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let store = match &config.oauth.token_file {
        Some(path) => TokenStore::load(path.clone())
            .await
            .with_context(|| format!("failed to load token from {}", path.display()))?,
        None => TokenStore::in_memory(),
    };

    let auth = Arc::new(
        AuthFlow::new(config.oauth_settings(), http.clone(), store)
            .with_timeout(Duration::from_secs(config.oauth.timeout_secs)),
    );
    let tools = Arc::new(
        ToolClient::new(config.tool_client_config(), http.clone(), auth.clone())
            .context("failed to create tool client")?,
    );
    let model = Arc::new(HttpChatModel::new(http, config.chat_settings()));
    let engine = Engine::new(auth, tools, model, config.engine_settings())
        .context("failed to create orchestration engine")?;

    let app_state = AppState {
        api: ApiState {
            engine: Arc::new(engine),
        },
        prometheus: prometheus_handle,
    };
    let app = build_router(app_state.clone(), config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    let authenticated = app_state.api.engine.is_authenticated().await;
    info!(addr = %listen_addr, authenticated, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: notify the server to drain, then race the drain against
    // the timeout.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    // Leave the provider session cleanly; the token itself stays persisted.
    app_state.api.engine.disconnect_tools().await;

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: sign-in state, tool connection and uptime.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.api.engine.status().await;
    let body = serde_json::json!({
        "status": "ok",
        "authenticated": status.authenticated,
        "tools": status.tools,
        "uptime_seconds": status.uptime_secs,
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint: returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
