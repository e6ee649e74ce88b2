//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The OAuth client secret and chat API key are loaded from
//! OAUTH_CLIENT_SECRET / CHAT_API_KEY or from the files named in the TOML,
//! never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use orchestrator::policy::{DEFAULT_LOCATION_FIELDS, DEFAULT_LOCATION_TOOL_HINTS};
use orchestrator::{ChatSettings, DEFAULT_MAX_ITERATIONS, EngineSettings, Policy};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tool_auth::OAuthSettings;
use tool_client::ToolClientConfig;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub oauth: OAuthConfig,
    pub tools: ToolsConfig,
    pub chat: ChatConfig,
    pub orchestrator: OrchestratorConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// OAuth client registration with the tool provider
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    pub authorize_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Persist the token here; memory-only when unset
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to OAUTH_CLIENT_SECRET)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(default = "default_auth_timeout")]
    pub timeout_secs: u64,
}

/// Tool provider endpoint
#[derive(Debug, Deserialize)]
pub struct ToolsConfig {
    pub endpoint: String,
    #[serde(default = "default_tool_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// OpenAI-compatible chat-completion endpoint
#[derive(Debug, Deserialize)]
pub struct ChatConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_chat_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
    /// Path to a file containing the API key (alternative to CHAT_API_KEY)
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
}

/// Run budget and tool policy
#[derive(Debug, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    pub location_id: String,
    #[serde(default = "default_location_fields")]
    pub location_fields: Vec<String>,
    #[serde(default = "default_location_tool_hints")]
    pub location_tool_hints: Vec<String>,
    #[serde(default)]
    pub deny_list: Vec<String>,
    #[serde(default)]
    pub sensitive_tools: Vec<String>,
}

fn default_max_connections() -> usize {
    64
}

fn default_auth_timeout() -> u64 {
    15
}

fn default_tool_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_chat_timeout() -> u64 {
    60
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_location_fields() -> Vec<String> {
    DEFAULT_LOCATION_FIELDS.iter().map(|s| s.to_string()).collect()
}

fn default_location_tool_hints() -> Vec<String> {
    DEFAULT_LOCATION_TOOL_HINTS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn require_http_url(field: &str, url: &str) -> common::Result<()> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {url}"
        )));
    }
    Ok(())
}

fn require_non_zero(field: &str, value: u64) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::Config(format!(
            "{field} must be greater than 0"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, validate it, then resolve secrets.
    ///
    /// Secret resolution order for each secret:
    /// 1. env var (OAUTH_CLIENT_SECRET, CHAT_API_KEY)
    /// 2. file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        config.oauth.client_secret = common::load_secret(
            "OAUTH_CLIENT_SECRET",
            config.oauth.client_secret_file.as_deref(),
        )?;
        config.chat.api_key =
            common::load_secret("CHAT_API_KEY", config.chat.api_key_file.as_deref())?;

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        require_http_url("oauth.authorize_url", &self.oauth.authorize_url)?;
        require_http_url("oauth.token_url", &self.oauth.token_url)?;
        require_http_url("oauth.redirect_uri", &self.oauth.redirect_uri)?;
        require_http_url("tools.endpoint", &self.tools.endpoint)?;
        require_http_url("chat.base_url", &self.chat.base_url)?;

        if self.oauth.client_id.trim().is_empty() {
            return Err(common::Error::Config(
                "oauth.client_id must not be empty".into(),
            ));
        }

        require_non_zero("server.max_connections", self.server.max_connections as u64)?;
        require_non_zero("oauth.timeout_secs", self.oauth.timeout_secs)?;
        require_non_zero("tools.request_timeout_secs", self.tools.request_timeout_secs)?;
        require_non_zero("tools.connect_timeout_secs", self.tools.connect_timeout_secs)?;
        require_non_zero("chat.timeout_secs", self.chat.timeout_secs)?;
        require_non_zero(
            "orchestrator.max_iterations",
            self.orchestrator.max_iterations as u64,
        )?;

        if self.orchestrator.location_id.trim().is_empty() {
            return Err(common::Error::Config(
                "orchestrator.location_id must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("voice-agent.toml")
    }

    pub fn oauth_settings(&self) -> OAuthSettings {
        OAuthSettings {
            client_id: self.oauth.client_id.clone(),
            client_secret: self.oauth.client_secret.clone(),
            authorize_url: self.oauth.authorize_url.clone(),
            token_url: self.oauth.token_url.clone(),
            redirect_uri: self.oauth.redirect_uri.clone(),
            scopes: self.oauth.scopes.clone(),
        }
    }

    pub fn tool_client_config(&self) -> ToolClientConfig {
        ToolClientConfig {
            endpoint: self.tools.endpoint.clone(),
            request_timeout: Duration::from_secs(self.tools.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.tools.connect_timeout_secs),
        }
    }

    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            base_url: self.chat.base_url.clone(),
            model: self.chat.model.clone(),
            api_key: self.chat.api_key.clone(),
            temperature: self.chat.temperature,
            timeout: Duration::from_secs(self.chat.timeout_secs),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let o = &self.orchestrator;
        EngineSettings {
            max_iterations: o.max_iterations,
            policy: Policy {
                location_id: o.location_id.clone(),
                location_fields: o.location_fields.clone(),
                location_tool_hints: o.location_tool_hints.clone(),
                deny_list: o.deny_list.clone(),
                sensitive_tools: o.sensitive_tools.clone(),
            },
        }
    }
}
