//! Scripted tool provider and chat model for tests.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{Value, json};
use tool_client::{ToolDescriptor, ToolHealth, ToolProvider};

use crate::chat::{ChatMessage, ChatModel, FunctionCall, Role, ToolCall, ToolSchema};
use crate::error::{Error, Result};

pub fn tool(name: &str) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        description: format!("{name} tool"),
        input_schema: json!({"type": "object", "properties": {}}),
    }
}

pub fn call(id: &str, name: &str, arguments: &str) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        r#type: "function".to_string(),
        function: FunctionCall {
            name: name.to_string(),
            arguments: arguments.to_string(),
        },
    }
}

pub fn final_answer(text: &str) -> ChatMessage {
    ChatMessage::assistant(text)
}

/// Provider with a fixed tool list. `explode` always fails.
pub struct ScriptedTools {
    tools: Vec<ToolDescriptor>,
    signed_out: bool,
    calls: Mutex<Vec<(String, Value)>>,
    disconnects: AtomicUsize,
}

impl ScriptedTools {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self {
            tools,
            signed_out: false,
            calls: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
        }
    }

    /// Every operation fails as if no token were stored.
    pub fn signed_out() -> Self {
        Self {
            signed_out: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    fn not_authenticated() -> tool_client::Error {
        tool_client::Error::Auth(tool_auth::Error::NotAuthenticated)
    }
}

impl ToolProvider for ScriptedTools {
    fn list_tools(
        &self,
    ) -> Pin<Box<dyn Future<Output = tool_client::Result<Vec<ToolDescriptor>>> + Send + '_>> {
        Box::pin(async move {
            if self.signed_out {
                return Err(Self::not_authenticated());
            }
            Ok(self.tools.clone())
        })
    }

    fn call_tool<'a>(
        &'a self,
        name: &'a str,
        arguments: Value,
    ) -> Pin<Box<dyn Future<Output = tool_client::Result<Value>> + Send + 'a>> {
        Box::pin(async move {
            if self.signed_out {
                return Err(Self::not_authenticated());
            }
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments.clone()));
            if name == "explode" {
                return Err(tool_client::Error::ToolInvocationFailed {
                    name: name.to_string(),
                    cause: "kaboom".into(),
                });
            }
            Ok(json!({
                "content": [{"type": "text", "text": format!("{name} ok")}],
                "isError": false
            }))
        })
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = ToolHealth> + Send + '_>> {
        Box::pin(async move {
            ToolHealth {
                connected: false,
                connecting: false,
                transport: None,
            }
        })
    }
}

/// Model that replays scripted replies and records what it was sent.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ChatMessage>>,
    repeat: Option<ChatMessage>,
    conversations: Mutex<Vec<Vec<ChatMessage>>>,
    offered: Mutex<Vec<Vec<ToolSchema>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ChatMessage>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            repeat: None,
            conversations: Mutex::new(Vec::new()),
            offered: Mutex::new(Vec::new()),
        }
    }

    /// Reply with the same tool call forever.
    pub fn always(call: ToolCall) -> Self {
        Self {
            repeat: Some(Self::calls(vec![call])),
            ..Self::new(Vec::new())
        }
    }

    /// Assistant message requesting these calls.
    pub fn calls(calls: Vec<ToolCall>) -> ChatMessage {
        ChatMessage {
            role: Role::Assistant,
            content: None,
            tool_call_id: None,
            tool_calls: Some(calls),
        }
    }

    pub fn conversations(&self) -> Vec<Vec<ChatMessage>> {
        self.conversations.lock().unwrap().clone()
    }

    pub fn offered(&self) -> Vec<Vec<ToolSchema>> {
        self.offered.lock().unwrap().clone()
    }
}

impl ChatModel for ScriptedModel {
    fn complete<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        tools: &'a [ToolSchema],
    ) -> Pin<Box<dyn Future<Output = Result<ChatMessage>> + Send + 'a>> {
        Box::pin(async move {
            self.conversations.lock().unwrap().push(messages.to_vec());
            self.offered.lock().unwrap().push(tools.to_vec());
            if let Some(reply) = &self.repeat {
                return Ok(reply.clone());
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::ChatFailed("script exhausted".into()))
        })
    }
}
