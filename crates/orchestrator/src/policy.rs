//! Tool policy applied by the orchestration loop
//!
//! Decides which tools the model may see, what the system instruction says,
//! and how each requested call is rewritten before it reaches the provider.

use serde_json::{Map, Value, json};

use tool_client::ToolDescriptor;

/// Argument names treated as location identifiers when none are configured.
pub const DEFAULT_LOCATION_FIELDS: &[&str] = &["location_id", "address_id", "store_id"];

/// Tool-name fragments implying a location operation when none are configured.
pub const DEFAULT_LOCATION_TOOL_HINTS: &[&str] = &["location", "address", "store"];

/// What to do with one tool call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub enum CallDecision {
    /// Answer locally with this result; no remote call.
    Canned(Value),
    /// Refuse locally: the tool is deny-listed and not a known safe read.
    Refused,
    /// Call the provider with these (rewritten) arguments.
    Invoke(Value),
}

/// Static rules for one deployment.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Identifier forced into every location field.
    pub location_id: String,
    pub location_fields: Vec<String>,
    pub location_tool_hints: Vec<String>,
    /// Tools never offered to the model.
    pub deny_list: Vec<String>,
    /// Deny-listed reads answered locally with the fixed identifier.
    pub sensitive_tools: Vec<String>,
}

impl Policy {
    pub fn new(location_id: impl Into<String>) -> Self {
        Self {
            location_id: location_id.into(),
            location_fields: DEFAULT_LOCATION_FIELDS.iter().map(|s| s.to_string()).collect(),
            location_tool_hints: DEFAULT_LOCATION_TOOL_HINTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            deny_list: Vec::new(),
            sensitive_tools: Vec::new(),
        }
    }

    pub fn is_denied(&self, tool: &str) -> bool {
        self.deny_list.iter().any(|d| d == tool)
    }

    /// Deny-listed read answered from the fixed identifier.
    pub fn is_sensitive(&self, tool: &str) -> bool {
        self.is_denied(tool) && self.sensitive_tools.iter().any(|s| s == tool)
    }

    /// Tools the model is allowed to see, in provider order.
    pub fn offered<'a>(&self, tools: &'a [ToolDescriptor]) -> Vec<&'a ToolDescriptor> {
        tools.iter().filter(|t| !self.is_denied(&t.name)).collect()
    }

    pub fn system_prompt(&self) -> String {
        let mut prompt = String::from(
            "You are a voice assistant that fulfils requests by calling the tools provided.\n\
             Rules:\n\
             - Only call the tools you are given. When several tools could work, prefer those offered to you over any you know from elsewhere.\n",
        );
        prompt.push_str(&format!(
            "- Whenever an address or location identifier is required, use \"{}\". Never ask the user for one and never invent another.\n",
            self.location_id
        ));
        prompt.push_str(
            "- When a search returns results, pick the first result without asking the user to choose.\n\
             - Keep the final answer short; it is read aloud.",
        );
        prompt
    }

    /// Decide how to handle a call. A sensitive short-circuit wins over the
    /// location rewrite since no remote call happens.
    pub fn decide(&self, tool: &str, arguments: Map<String, Value>, schema: Option<&Value>) -> CallDecision {
        if self.is_sensitive(tool) {
            return CallDecision::Canned(self.canned_result());
        }
        if self.is_denied(tool) {
            return CallDecision::Refused;
        }
        let mut arguments = arguments;
        self.override_location(tool, &mut arguments, schema);
        if let Some(schema) = schema {
            fill_defaults(&mut arguments, schema);
        }
        CallDecision::Invoke(Value::Object(arguments))
    }

    /// Result returned in place of a sensitive read.
    pub fn canned_result(&self) -> Value {
        let payload = json!({ "location_id": self.location_id });
        json!({
            "content": [{"type": "text", "text": payload.to_string()}],
            "structuredContent": payload,
            "isError": false
        })
    }

    /// Overwrite every location field with the fixed identifier: fields the
    /// model supplied, plus schema-declared ones when the tool name implies a
    /// location operation.
    pub fn override_location(&self, tool: &str, arguments: &mut Map<String, Value>, schema: Option<&Value>) {
        for field in &self.location_fields {
            if arguments.contains_key(field) {
                arguments.insert(field.clone(), Value::String(self.location_id.clone()));
            }
        }

        if !self.implies_location(tool) {
            return;
        }
        let declared = schema
            .and_then(|s| s.get("properties"))
            .and_then(Value::as_object);
        if let Some(properties) = declared {
            for field in &self.location_fields {
                if properties.contains_key(field) {
                    arguments.insert(field.clone(), Value::String(self.location_id.clone()));
                }
            }
        }
    }

    fn implies_location(&self, tool: &str) -> bool {
        let tool = tool.to_ascii_lowercase();
        self.location_tool_hints
            .iter()
            .any(|hint| tool.contains(&hint.to_ascii_lowercase()))
    }
}

/// Insert top-level schema defaults for arguments the model left out.
pub fn fill_defaults(arguments: &mut Map<String, Value>, schema: &Value) {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return;
    };
    for (name, property) in properties {
        if let Some(default) = property.get("default")
            && !arguments.contains_key(name)
        {
            arguments.insert(name.clone(), default.clone());
        }
    }
}
