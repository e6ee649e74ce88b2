//! Consumer facade over authorization, tool access and the run loop
//!
//! The HTTP service only talks to `Engine`.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tool_auth::AuthFlow;
use tool_client::{ToolDescriptor, ToolHealth, ToolProvider};
use tracing::info;

use crate::chat::ChatModel;
use crate::error::{Error, Result};
use crate::policy::Policy;
use crate::run::{DEFAULT_MAX_ITERATIONS, Orchestrator, RunOutcome};

/// Settings for runs started through the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_iterations: u32,
    pub policy: Policy,
}

impl EngineSettings {
    pub fn new(policy: Policy) -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            policy,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::Settings("max_iterations must be greater than 0".into()));
        }
        if self.policy.location_id.trim().is_empty() {
            return Err(Error::Settings("location_id must not be empty".into()));
        }
        Ok(())
    }
}

/// A discovered tool and whether the model gets to see it.
#[derive(Debug, Clone, Serialize)]
pub struct AvailableTool {
    #[serde(flatten)]
    pub tool: ToolDescriptor,
    pub offered_to_model: bool,
}

/// Health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub authenticated: bool,
    pub tools: ToolHealth,
    pub uptime_secs: u64,
}

pub struct Engine {
    auth: Arc<AuthFlow>,
    tools: Arc<dyn ToolProvider>,
    orchestrator: Orchestrator,
    started_at: Instant,
}

impl Engine {
    pub fn new(
        auth: Arc<AuthFlow>,
        tools: Arc<dyn ToolProvider>,
        model: Arc<dyn ChatModel>,
        settings: EngineSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let orchestrator = Orchestrator::new(
            Arc::clone(&tools),
            model,
            settings.policy,
            settings.max_iterations,
        );
        Ok(Self {
            auth,
            tools,
            orchestrator,
            started_at: Instant::now(),
        })
    }

    pub async fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated().await
    }

    /// Start a login; returns the provider URL to redirect the user to.
    pub async fn begin_authorization(&self) -> Result<String> {
        Ok(self.auth.begin_authorization().await?)
    }

    /// Finish a login. Any live tool connection was opened with the previous
    /// token, so it is dropped.
    pub async fn complete_authorization(&self, code: &str, state: &str) -> Result<()> {
        self.auth.complete_authorization(code, state).await?;
        self.tools.disconnect().await;
        info!("authorization completed");
        Ok(())
    }

    /// Every discovered tool, flagged with whether the model is offered it.
    pub async fn list_available_tools(&self) -> Result<Vec<AvailableTool>> {
        let tools = self.tools.list_tools().await?;
        let policy = self.orchestrator.policy();
        Ok(tools
            .into_iter()
            .map(|tool| AvailableTool {
                offered_to_model: !policy.is_denied(&tool.name),
                tool,
            })
            .collect())
    }

    pub async fn run_prompt(&self, text: &str) -> Result<RunOutcome> {
        self.orchestrator.run_prompt(text).await
    }

    /// Invoke a tool without the model or the policy rewrites. Deny-listed
    /// tools are allowed here.
    pub async fn call_tool_directly(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        Ok(self.tools.call_tool(name, arguments).await?)
    }

    /// Close the tool session without touching the stored token.
    pub async fn disconnect_tools(&self) {
        self.tools.disconnect().await;
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.tools.disconnect().await;
        self.auth.sign_out().await?;
        info!("signed out");
        Ok(())
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            authenticated: self.auth.is_authenticated().await,
            tools: self.tools.health().await,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}
