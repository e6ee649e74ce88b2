//! Orchestration run state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! `Orchestrator::run_prompt` executes the I/O implied by each action.
//!
//! Discovering -> Prompting -> (ExecutingTools -> Prompting)* -> Finished.
//! The iteration budget counts Prompting/ExecutingTools rounds, not calls.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use tool_client::{ToolDescriptor, ToolProvider};

use crate::chat::{ChatMessage, ChatModel, ToolCall, ToolSchema};
use crate::error::{Error, Result};
use crate::policy::{CallDecision, Policy};
use crate::schema::to_tool_schema;

/// Final answer when the budget runs out before the model stops calling tools.
pub const MAX_ITERATIONS_MESSAGE: &str = "Max iterations reached";

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Run states.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    /// Fetching the tool list
    Discovering,
    /// Waiting for the model's reply in round `round` (1-based)
    Prompting { round: u32 },
    /// Executing the tool calls requested in round `round`
    ExecutingTools { round: u32 },
    /// Terminal state
    Finished { final_text: String, capped: bool },
}

/// Events that drive state transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// Tool list fetched and filtered
    ToolsDiscovered,
    /// The model answered; `calls` is empty when it produced a final answer
    ModelReplied { text: String, calls: Vec<ToolCall> },
    /// Every call of the current round has a recorded result
    ToolsExecuted,
}

/// Actions the driver should execute after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum RunAction {
    /// Send the conversation and offered schema to the model
    CallModel,
    /// Execute these calls in order
    ExecuteTools(Vec<ToolCall>),
    /// Return the outcome
    Finish,
    /// No-op
    None,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: RunState, event: RunEvent, max_iterations: u32) -> (RunState, RunAction) {
    match (state, event) {
        // --- Discovering ---
        (RunState::Discovering, RunEvent::ToolsDiscovered) if max_iterations == 0 => (
            RunState::Finished {
                final_text: MAX_ITERATIONS_MESSAGE.to_string(),
                capped: true,
            },
            RunAction::Finish,
        ),
        (RunState::Discovering, RunEvent::ToolsDiscovered) => {
            (RunState::Prompting { round: 1 }, RunAction::CallModel)
        }

        // --- Prompting ---
        (RunState::Prompting { .. }, RunEvent::ModelReplied { text, calls }) if calls.is_empty() => (
            RunState::Finished {
                final_text: text,
                capped: false,
            },
            RunAction::Finish,
        ),
        (RunState::Prompting { round }, RunEvent::ModelReplied { calls, .. }) => (
            RunState::ExecutingTools { round },
            RunAction::ExecuteTools(calls),
        ),

        // --- ExecutingTools ---
        (RunState::ExecutingTools { round }, RunEvent::ToolsExecuted) if round >= max_iterations => (
            RunState::Finished {
                final_text: MAX_ITERATIONS_MESSAGE.to_string(),
                capped: true,
            },
            RunAction::Finish,
        ),
        (RunState::ExecutingTools { round }, RunEvent::ToolsExecuted) => (
            RunState::Prompting { round: round + 1 },
            RunAction::CallModel,
        ),

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, RunAction::None),
    }
}

/// Messages of one run. Append-only, never persisted.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }
}

/// Result or error of one tool call, serialized as `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Result(Value),
    Error(Value),
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::Error(_))
    }

    /// Tool message content shown to the model.
    fn to_message_content(&self) -> String {
        match self {
            ToolOutcome::Result(value) => match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            ToolOutcome::Error(error) => json!({ "error": error }).to_string(),
        }
    }
}

/// One tool call of a run: name, arguments as sent, what came back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: Value,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

/// What a finished run returns.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub final_text: String,
    pub tool_calls: Vec<ToolCallRecord>,
    /// Prompting rounds completed
    pub iterations: u32,
    /// The budget ran out before the model produced an answer
    pub capped: bool,
}

/// Drives runs against a tool provider and a chat model.
pub struct Orchestrator {
    tools: Arc<dyn ToolProvider>,
    model: Arc<dyn ChatModel>,
    policy: Policy,
    max_iterations: u32,
}

impl Orchestrator {
    pub fn new(
        tools: Arc<dyn ToolProvider>,
        model: Arc<dyn ChatModel>,
        policy: Policy,
        max_iterations: u32,
    ) -> Self {
        Self {
            tools,
            model,
            policy,
            max_iterations,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Fetch tools and build the schema offered to the model.
    pub async fn discover(&self) -> Result<(Vec<ToolDescriptor>, Vec<ToolSchema>)> {
        let tools = self.tools.list_tools().await?;
        let offered: Vec<ToolSchema> = self
            .policy
            .offered(&tools)
            .into_iter()
            .map(to_tool_schema)
            .collect();
        debug!(
            discovered = tools.len(),
            offered = offered.len(),
            "tool schema built"
        );
        Ok((tools, offered))
    }

    /// Answer one utterance.
    pub async fn run_prompt(&self, utterance: &str) -> Result<RunOutcome> {
        let result = self.drive(utterance).await;
        match &result {
            Ok(outcome) => {
                let label = if outcome.capped { "capped" } else { "answered" };
                metrics::counter!("orchestrator_runs_total", "outcome" => label).increment(1);
                metrics::histogram!("orchestrator_run_iterations").record(outcome.iterations as f64);
            }
            Err(e) => {
                metrics::counter!("orchestrator_runs_total", "outcome" => "failed").increment(1);
                warn!(error = %e, "run failed");
            }
        }
        result
    }

    async fn drive(&self, utterance: &str) -> Result<RunOutcome> {
        let mut state = RunState::Discovering;
        let (tools, offered) = self.discover().await?;
        let schemas: HashMap<&str, &Value> = tools
            .iter()
            .map(|t| (t.name.as_str(), &t.input_schema))
            .collect();

        let mut conversation = Conversation::new(self.policy.system_prompt(), utterance);
        let mut records = Vec::new();
        let mut iterations = 0;
        let mut event = RunEvent::ToolsDiscovered;

        loop {
            let (next, action) = handle_event(state, event, self.max_iterations);
            state = next;

            event = match action {
                RunAction::CallModel => {
                    let reply = self
                        .model
                        .complete(conversation.messages(), &offered)
                        .await?;
                    iterations += 1;
                    let calls = with_call_ids(reply.requested_calls(), iterations);
                    let text = reply.content.clone().unwrap_or_default();

                    let mut assistant = reply;
                    if !calls.is_empty() {
                        assistant.tool_calls = Some(calls.clone());
                    }
                    conversation.push(assistant);
                    RunEvent::ModelReplied { text, calls }
                }
                RunAction::ExecuteTools(calls) => {
                    for call in &calls {
                        let schema = schemas.get(call.function.name.as_str()).copied();
                        let record = self.execute(call, schema).await?;
                        conversation.push(ChatMessage::tool_result(
                            call.id.clone(),
                            record.outcome.to_message_content(),
                        ));
                        records.push(record);
                    }
                    RunEvent::ToolsExecuted
                }
                RunAction::Finish => break,
                RunAction::None => {
                    return Err(Error::ChatFailed(format!(
                        "run stalled in state {state:?}"
                    )));
                }
            };
        }

        let RunState::Finished { final_text, capped } = state else {
            return Err(Error::ChatFailed("run ended before finishing".into()));
        };
        info!(
            iterations,
            tool_calls = records.len(),
            capped,
            "run finished"
        );
        Ok(RunOutcome {
            final_text,
            tool_calls: records,
            iterations,
            capped,
        })
    }

    /// Execute one call. Tool failures become error records; authorization
    /// and connection failures end the run.
    async fn execute(&self, call: &ToolCall, schema: Option<&Value>) -> Result<ToolCallRecord> {
        let name = call.function.name.clone();
        let arguments = parse_arguments(&name, &call.function.arguments);

        let sent = match self.policy.decide(&name, arguments, schema) {
            CallDecision::Canned(result) => {
                debug!(tool = %name, "answered sensitive read locally");
                metrics::counter!("orchestrator_tool_calls_total", "status" => "canned").increment(1);
                return Ok(ToolCallRecord {
                    name,
                    arguments: Value::Object(Map::new()),
                    outcome: ToolOutcome::Result(result),
                });
            }
            CallDecision::Refused => {
                warn!(tool = %name, "model requested a tool that is not offered");
                metrics::counter!("orchestrator_tool_calls_total", "status" => "refused").increment(1);
                return Ok(ToolCallRecord {
                    outcome: ToolOutcome::Error(json!({
                        "type": "tool_not_available",
                        "tool": name,
                        "message": "this tool is not available; use one of the offered tools",
                    })),
                    name,
                    arguments: Value::Object(Map::new()),
                });
            }
            CallDecision::Invoke(arguments) => arguments,
        };

        match self.tools.call_tool(&name, sent.clone()).await {
            Ok(result) => {
                debug!(tool = %name, "tool call succeeded");
                metrics::counter!("orchestrator_tool_calls_total", "status" => "success").increment(1);
                Ok(ToolCallRecord {
                    name,
                    arguments: sent,
                    outcome: ToolOutcome::Result(result),
                })
            }
            Err(e @ (tool_client::Error::Auth(_) | tool_client::Error::ConnectFailed(_))) => Err(e.into()),
            Err(e) => {
                warn!(tool = %name, error = %e, "tool call failed");
                metrics::counter!("orchestrator_tool_calls_total", "status" => "error").increment(1);
                Ok(ToolCallRecord {
                    outcome: ToolOutcome::Error(error_payload(&name, &e)),
                    name,
                    arguments: sent,
                })
            }
        }
    }
}

/// Parse model-supplied arguments. Anything but a JSON object degrades to
/// empty arguments.
fn parse_arguments(tool: &str, raw: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }
    let cause = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => return map,
        Ok(other) => format!("expected a JSON object, got {other}"),
        Err(e) => e.to_string(),
    };
    let err = Error::ArgumentParseFailed {
        tool: tool.to_string(),
        cause,
    };
    warn!(error = %err, "using empty arguments");
    Map::new()
}

/// Give every call an id so tool messages can reference it.
fn with_call_ids(calls: &[ToolCall], round: u32) -> Vec<ToolCall> {
    calls
        .iter()
        .enumerate()
        .map(|(i, call)| {
            let mut call = call.clone();
            if call.id.is_empty() {
                call.id = format!("call_{round}_{i}");
            }
            call
        })
        .collect()
}

fn error_payload(tool: &str, err: &tool_client::Error) -> Value {
    let kind = match err {
        tool_client::Error::Timeout { .. } => "timeout",
        _ => "tool_invocation_failed",
    };
    let message = match err {
        tool_client::Error::ToolInvocationFailed { cause, .. } => cause.clone(),
        other => other.to_string(),
    };
    json!({ "type": kind, "tool": tool, "message": message })
}
