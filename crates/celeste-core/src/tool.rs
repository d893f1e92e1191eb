use serde::{Deserialize, Serialize};

/// A request from the LLM to invoke a specific tool.
///
/// `arguments` holds the raw JSON text exactly as reconstructed from the
/// stream; it is only parsed when a consumer asks for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier assigned by the provider (or synthesized) for this call.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Concatenated JSON arguments.
    #[serde(default)]
    pub arguments: String,
}

impl ToolCall {
    /// Creates a tool call from its parts.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parses the arguments, falling back to an empty object when the text
    /// is empty or not valid JSON.
    pub fn parsed_arguments(&self) -> serde_json::Value {
        serde_json::from_str(&self.arguments)
            .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()))
    }
}

/// A tool the model may call, as provided by the skill registry.
///
/// `parameters` is a JSON-schema object; each backend translates it into its
/// own tool format at request time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillDefinition {
    /// Tool name exposed to the model.
    pub name: String,
    /// Human-readable description used by the model to pick tools.
    pub description: String,
    /// JSON-schema describing the arguments object.
    #[serde(default = "empty_object_schema")]
    pub parameters: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl SkillDefinition {
    /// Creates a skill definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}
