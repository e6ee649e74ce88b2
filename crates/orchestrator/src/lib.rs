//! Tool orchestration for natural-language requests
//!
//! Turns an utterance into remote tool calls by letting a chat-completion
//! model pick tools, executing its calls against the tool provider, and
//! feeding results back until the model answers or the round budget runs out.
//!
//! - `chat`: OpenAI-compatible chat model behind the `ChatModel` trait
//! - `schema`: provider tool descriptors to function-tool schemas
//! - `policy`: deny list, sensitive-read short-circuit, location override
//! - `run`: the run state machine and its driver
//! - `engine`: the facade the HTTP service uses

pub mod chat;
pub mod engine;
pub mod error;
pub mod policy;
pub mod run;
pub mod schema;

#[cfg(test)]
pub(crate) mod test_support;

pub use chat::{ChatMessage, ChatModel, ChatSettings, HttpChatModel, Role, ToolCall, ToolSchema};
pub use engine::{AvailableTool, Engine, EngineSettings, EngineStatus};
pub use error::{Error, Result};
pub use policy::{CallDecision, Policy};
pub use run::{
    Conversation, DEFAULT_MAX_ITERATIONS, MAX_ITERATIONS_MESSAGE, Orchestrator, RunOutcome,
    ToolCallRecord, ToolOutcome,
};
