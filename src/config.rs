//! Agent configuration

use serde::{Deserialize, Serialize};

use crate::context::ContextScope;
use crate::llm::ChatRequest;

/// Tunables for a [`HierarchicalAgent`](crate::HierarchicalAgent).
///
/// Children created through `add_child` inherit their parent's config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Scope used by `set_context` when none is given
    pub default_scope: ContextScope,
    /// Prepend visible shared context to outgoing prompts
    pub inject_context: bool,
    /// Non-scalar context values are cut to this many characters when injected
    pub context_preview_chars: usize,
    pub temperature: f32,
    pub tool_choice: String,
    pub max_tokens: Option<u32>,
    /// LOCAL context key that receives aggregated child results
    pub results_key: String,
    /// Bus message type used to announce delegated work
    pub assignment_message_type: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_scope: ContextScope::Subtree,
            inject_context: true,
            context_preview_chars: 100,
            temperature: 0.7,
            tool_choice: "auto".to_string(),
            max_tokens: None,
            results_key: "child_results".to_string(),
            assignment_message_type: "task_assignment".to_string(),
        }
    }
}

impl AgentConfig {
    /// Request for `message` carrying this config's sampling settings
    pub fn request(&self, message: impl Into<String>) -> ChatRequest {
        ChatRequest {
            message: Some(message.into()),
            tool_choice: self.tool_choice.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            ..Default::default()
        }
    }
}
