//! Chat and tool-call types shared by every model backend.
//!
//! Serde-serializable so sessions and transcripts can be snapshotted by the caller.

use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Set on `tool` messages: the call this observation answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on `assistant` messages that requested native tool calls
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant turn that asked for native tool calls
    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Observation message answering a tool call
    pub fn tool(content: impl Into<String>, tool_call_id: &str) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.to_string()),
            ..Self::new(Role::Tool, content)
        }
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }
}

/// Result of a non-streaming generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    /// Model that actually produced the content
    pub model: String,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID
    pub id: String,
    /// Tool name
    pub name: String,
    /// Arguments as a JSON object
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: &str, arguments: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            arguments,
        }
    }
}

/// JSON-schema description of a tool offered to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Tool name (snake_case)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for parameters
    pub parameters: Value,
    /// Required parameter names
    pub required: Vec<String>,
}

impl ToolSchema {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {}
            }),
            required: vec![],
        }
    }

    pub fn with_string_param(self, name: &str, description: &str, required: bool) -> Self {
        self.with_param(name, "string", description, required)
    }

    pub fn with_int_param(self, name: &str, description: &str, required: bool) -> Self {
        self.with_param(name, "integer", description, required)
    }

    pub fn with_bool_param(self, name: &str, description: &str, required: bool) -> Self {
        self.with_param(name, "boolean", description, required)
    }

    fn with_param(mut self, name: &str, kind: &str, description: &str, required: bool) -> Self {
        if let Some(props) = self.parameters.get_mut("properties") {
            props[name] = serde_json::json!({
                "type": kind,
                "description": description
            });
        }
        if required {
            self.required.push(name.to_string());
        }
        self
    }

    /// Check arguments against the schema.
    ///
    /// Returns a human-readable reason on the first violation.
    pub fn validate(&self, args: &Value) -> Result<(), String> {
        for req in &self.required {
            match args.get(req) {
                None | Some(Value::Null) => {
                    return Err(format!("missing required parameter '{}'", req));
                }
                _ => {}
            }
        }

        let Some(props) = self.parameters.get("properties").and_then(|p| p.as_object()) else {
            return Ok(());
        };

        for (name, schema) in props {
            let Some(value) = args.get(name) else { continue };
            if value.is_null() {
                continue;
            }
            let expected = schema.get("type").and_then(|t| t.as_str());
            let valid = match expected {
                Some("string") => value.is_string(),
                Some("integer") => value.is_i64() || value.is_u64(),
                Some("number") => value.is_number(),
                Some("boolean") => value.is_boolean(),
                Some("array") => value.is_array(),
                Some("object") => value.is_object(),
                _ => true,
            };
            if !valid {
                return Err(format!(
                    "parameter '{}' has wrong type, expected {}",
                    name,
                    expected.unwrap_or("unknown")
                ));
            }
        }

        Ok(())
    }

    /// Function-calling format used by Ollama and OpenAI-compatible backends
    pub fn to_function_format(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": self.parameters.get("properties").cloned().unwrap_or(Value::Object(Default::default())),
                    "required": self.required
                }
            }
        })
    }

    /// One-line signature for prompts, e.g. `read_file(path*)`
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .parameters
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|props| {
                props
                    .keys()
                    .map(|k| {
                        if self.required.contains(k) {
                            format!("{}*", k)
                        } else {
                            k.clone()
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        format!("{}({})", self.name, params.join(", "))
    }
}

/// One full turn from a native tool-calling backend
#[derive(Debug, Clone, PartialEq)]
pub struct ToolTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub model: String,
}

/// Incremental piece of a streamed tool-calling turn
#[derive(Debug, Clone, PartialEq)]
pub enum ToolTurnChunk {
    Text(String),
    ToolCalls(Vec<ToolCall>),
}

/// Stream of raw text chunks from a backend
pub type TextStream = BoxStream<'static, anyhow::Result<String>>;

/// Stream of tool-turn chunks from a backend
pub type ToolTurnStream = BoxStream<'static, anyhow::Result<ToolTurnChunk>>;
