//! Translation between provider tool descriptors and chat function schemas

use tool_client::ToolDescriptor;

use crate::chat::{FunctionSchema, ToolSchema};

/// Function-tool schema for one descriptor.
pub fn to_tool_schema(tool: &ToolDescriptor) -> ToolSchema {
    ToolSchema {
        r#type: "function".to_string(),
        function: FunctionSchema {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        },
    }
}

/// Descriptor back from a function-tool schema.
pub fn from_tool_schema(schema: &ToolSchema) -> ToolDescriptor {
    ToolDescriptor {
        name: schema.function.name.clone(),
        description: schema.function.description.clone(),
        input_schema: schema.function.parameters.clone(),
    }
}
