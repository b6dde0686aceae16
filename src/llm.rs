//! Language model capability
//!
//! Providers live outside this crate. Each one implements [`LanguageModel`]
//! and the coordination layer only ever talks to the trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Tool/function definition offered to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments
    pub parameters: Value,
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// OpenAI-style function declaration
    pub fn to_function_spec(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Message in a conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    /// Result of a tool execution fed back to the model
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(result.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(tool_name.into()),
        }
    }
}

/// One call into a language model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: Option<String>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    /// "auto", "required", "none" or a tool name
    pub tool_choice: String,
    pub max_tokens: Option<u32>,
    pub temperature: f32,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    /// Skip shared-context injection for this call
    #[serde(default)]
    pub no_context_injection: bool,
}

impl Default for ChatRequest {
    fn default() -> Self {
        Self {
            message: None,
            tools: Vec::new(),
            tool_choice: "auto".to_string(),
            max_tokens: None,
            temperature: 0.7,
            history: Vec::new(),
            no_context_injection: false,
        }
    }
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn without_context_injection(mut self) -> Self {
        self.no_context_injection = true;
        self
    }
}

/// What a model answered
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Text content, or an empty string for tool-call-only answers
    pub fn content_or_empty(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

/// A chat-capable model behind some provider
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider label, e.g. "openai"
    fn provider_name(&self) -> &str;

    /// Model identifier
    fn model(&self) -> &str;

    /// Send one request. Transport and provider failures surface as errors.
    async fn chat(&self, request: ChatRequest) -> anyhow::Result<ChatResponse>;
}


#[cfg(test)]
mod tests {
    use super::mock::ScriptedModel;
    use super::*;

    #[test]
    fn test_tool_function_spec() {
        let tool = Tool::new(
            "get_weather",
            "Get current weather",
            json!({"type": "object", "properties": {"location": {"type": "string"}}}),
        );
        let spec = tool.to_function_spec();
        assert_eq!(spec["type"], "function");
        assert_eq!(spec["function"]["name"], "get_weather");
    }

    #[test]
    fn test_request_defaults() {
        let request = ChatRequest::new("hi");
        assert_eq!(request.tool_choice, "auto");
        assert!((request.temperature - 0.7).abs() < f32::EPSILON);
        assert!(!request.no_context_injection);
    }

    #[test]
    fn test_request_builders() {
        let request = ChatRequest::new("hi")
            .with_max_tokens(128)
            .with_temperature(0.2)
            .with_history(vec![ChatMessage::system("Be brief."), ChatMessage::user("earlier")]);

        assert_eq!(request.max_tokens, Some(128));
        assert!((request.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(request.history[1].role, ChatRole::User);
        assert_eq!(request.history[1].content.as_deref(), Some("earlier"));
    }

    #[test]
    fn test_tool_result_message() {
        let message = ChatMessage::tool_result("call-1", "get_weather", "sunny");
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call-1");
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn test_scripted_model_replies_then_echoes() {
        let model = ScriptedModel::new("m").reply("first");

        let first = tokio_test::block_on(model.chat(ChatRequest::new("a"))).unwrap();
        let second = tokio_test::block_on(model.chat(ChatRequest::new("b"))).unwrap();

        assert_eq!(first.content_or_empty(), "first");
        assert_eq!(second.content_or_empty(), "m: b");
        assert_eq!(model.requests().len(), 2);
    }

    #[test]
    fn test_scripted_model_failure() {
        let model = ScriptedModel::failing("m", "quota exceeded");
        let err = tokio_test::block_on(model.chat(ChatRequest::new("a"))).unwrap_err();
        assert_eq!(err.to_string(), "quota exceeded");
    }
}
