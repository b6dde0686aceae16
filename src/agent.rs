//! Hierarchical agent - one node of the tree, bound to a language model
//!
//! A [`HierarchicalAgent`] is a thin handle over the [`SharedContext`]. It
//! keeps handles to its children only so it can route delegated work to their
//! models. Who is actually a child is always answered by the registry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::bus::AgentMessage;
use crate::config::AgentConfig;
use crate::context::{ContextScope, ContextSnapshot};
use crate::error::{ConclaveError, Result};
use crate::llm::{ChatRequest, ChatResponse, ChatRole, LanguageModel, Tool};
use crate::session::{SharedContext, TreeStats};
use crate::task::{A2aMessage, Artifact, Role, Task, TaskState, TaskUpdate};
use crate::Metadata;

/// Progress of a plain delegation, as recorded under `task:{id}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    Pending,
    Completed,
    Failed,
}

/// Record of a plain delegation, stored in CHILDREN scope and sent to the child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedTask {
    pub task_id: String,
    pub description: String,
    pub tools: Vec<String>,
    pub assigned_to: String,
    pub status: AssignmentStatus,
    pub result: Option<Value>,
}

/// Result of [`HierarchicalAgent::delegate_with_lifecycle`]
#[derive(Debug, Clone)]
pub struct DelegationOutcome {
    /// Always in a terminal state
    pub task: Task,
    pub response: Option<ChatResponse>,
    pub artifact: Option<Artifact>,
}

impl DelegationOutcome {
    pub fn is_completed(&self) -> bool {
        self.task.state() == TaskState::Completed
    }

    /// Failure text of a failed delegation
    pub fn error(&self) -> Option<&str> {
        match self.task.state() {
            TaskState::Failed => self.task.status.message.as_deref(),
            _ => None,
        }
    }
}

/// What one child produced during aggregation
#[derive(Debug, Clone, PartialEq)]
pub enum ChildResult {
    Response(ChatResponse),
    Error(String),
}

impl ChildResult {
    fn to_value(&self) -> Result<Value> {
        Ok(match self {
            Self::Response(response) => serde_json::to_value(response)?,
            Self::Error(error) => json!({ "error": error }),
        })
    }
}

struct AgentInner {
    id: String,
    /// Generation of the registration this facade claimed
    generation: u64,
    model: Arc<dyn LanguageModel>,
    shared: SharedContext,
    config: AgentConfig,
    /// Routing table for delegation, not the source of truth for tree shape
    children: RwLock<Vec<HierarchicalAgent>>,
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        let removed = self.shared.release(&self.id, self.generation);
        if !removed.is_empty() {
            debug!(agent_id = %self.id, removed = removed.len(), "Dropped agent unregistered");
        }
    }
}

/// Agent that lives in a tree and shares context with it
#[derive(Clone)]
pub struct HierarchicalAgent {
    inner: Arc<AgentInner>,
}

impl HierarchicalAgent {
    /// Create an agent and register it in `shared`.
    ///
    /// With a parent, the agent also joins the parent's routing table and
    /// inherits its config.
    pub fn new(
        id: impl Into<String>,
        model: Arc<dyn LanguageModel>,
        shared: SharedContext,
        parent: Option<&HierarchicalAgent>,
        metadata: Metadata,
    ) -> Self {
        let config = parent.map(|p| p.config().clone()).unwrap_or_default();
        Self::with_config(id, model, shared, parent, metadata, config)
    }

    /// Root agent with no metadata
    pub fn root(id: impl Into<String>, model: Arc<dyn LanguageModel>, shared: SharedContext) -> Self {
        Self::new(id, model, shared, None, Metadata::new())
    }

    pub fn with_config(
        id: impl Into<String>,
        model: Arc<dyn LanguageModel>,
        shared: SharedContext,
        parent: Option<&HierarchicalAgent>,
        metadata: Metadata,
        config: AgentConfig,
    ) -> Self {
        let id = id.into();
        let parent_id = parent.map(HierarchicalAgent::id);

        if let Some(parent) = parent {
            if !parent.shared().same_as(&shared) {
                warn!(agent_id = %id, parent = %parent.id(), "Parent lives in a different shared context");
            }
        }

        info!(
            agent_id = %id,
            parent = ?parent_id,
            provider = %model.provider_name(),
            model = %model.model(),
            "Creating hierarchical agent"
        );
        let generation = shared.claim(&id, parent_id, metadata);

        let agent = Self {
            inner: Arc::new(AgentInner {
                id,
                generation,
                model,
                shared,
                config,
                children: RwLock::new(Vec::new()),
            }),
        };

        if let Some(parent) = parent {
            parent.inner.children.write().push(agent.clone());
        }

        agent
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn provider_name(&self) -> &str {
        self.inner.model.provider_name()
    }

    pub fn model_name(&self) -> &str {
        self.inner.model.model()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn shared(&self) -> &SharedContext {
        &self.inner.shared
    }

    // === Tree ===

    /// Add a child agent sharing this agent's context and config
    pub fn add_child(
        &self,
        id: impl Into<String>,
        model: Arc<dyn LanguageModel>,
        metadata: Metadata,
    ) -> HierarchicalAgent {
        HierarchicalAgent::new(id, model, self.inner.shared.clone(), Some(self), metadata)
    }

    /// Unregister a child and its subtree. `false` if it was not a child.
    pub fn remove_child(&self, child_id: &str) -> bool {
        let registered = self.children_ids().iter().any(|id| id == child_id);
        if registered {
            self.inner.shared.unregister(child_id);
        }

        let mut children = self.inner.children.write();
        let before = children.len();
        children.retain(|child| child.id() != child_id);
        registered || children.len() != before
    }

    /// Parent according to the registry
    pub fn parent_id(&self) -> Option<String> {
        self.inner.shared.parent(&self.inner.id)
    }

    /// Direct children according to the registry
    pub fn children_ids(&self) -> Vec<String> {
        self.inner.shared.children(&self.inner.id)
    }

    /// Handle to a live direct child
    pub fn child(&self, child_id: &str) -> Option<HierarchicalAgent> {
        if !self.children_ids().iter().any(|id| id == child_id) {
            return None;
        }
        self.inner
            .children
            .read()
            .iter()
            .find(|child| child.id() == child_id)
            .cloned()
    }

    fn resolve_child(&self, child_id: &str) -> Result<HierarchicalAgent> {
        self.ensure_registered()?;
        self.child(child_id).ok_or_else(|| ConclaveError::ChildNotFound {
            parent: self.inner.id.clone(),
            child: child_id.to_string(),
        })
    }

    /// A removed agent keeps its handle but can no longer coordinate. Its
    /// context writes are dropped too, since nothing would ever purge them.
    fn ensure_registered(&self) -> Result<()> {
        if self.inner.shared.is_registered(&self.inner.id) {
            Ok(())
        } else {
            Err(ConclaveError::AgentNotFound(self.inner.id.clone()))
        }
    }

    // === Context ===

    /// Set a value with the configured default scope
    pub fn set_context(&self, key: &str, value: Value) {
        self.set_scoped_context(key, value, self.inner.config.default_scope, None);
    }

    pub fn set_scoped_context(
        &self,
        key: &str,
        value: Value,
        scope: ContextScope,
        metadata: Option<Metadata>,
    ) {
        if let Err(e) = self.ensure_registered() {
            warn!(key = %key, error = %e, "Ignoring context write from unregistered agent");
            return;
        }
        self.inner
            .shared
            .set(key, value, &self.inner.id, scope, metadata);
    }

    pub fn get_context(&self, key: &str) -> Option<Value> {
        self.inner.shared.get(key, &self.inner.id)
    }

    /// Visible value or `default`, whether the key is missing or hidden
    pub fn get_context_or(&self, key: &str, default: Value) -> Value {
        self.get_context(key).unwrap_or(default)
    }

    pub fn get_all_context(&self, scope_filter: Option<ContextScope>) -> BTreeMap<String, Value> {
        self.inner.shared.get_all(&self.inner.id, scope_filter)
    }

    /// Delete an entry this agent owns
    pub fn delete_context(&self, key: &str) -> bool {
        self.inner.shared.delete(key, &self.inner.id)
    }

    pub fn export_context(&self) -> ContextSnapshot {
        self.inner.shared.export_context(&self.inner.id)
    }

    /// Import a snapshot, taking ownership of every entry
    pub fn import_context(&self, snapshot: &ContextSnapshot) -> usize {
        if let Err(e) = self.ensure_registered() {
            warn!(error = %e, "Ignoring context import into unregistered agent");
            return 0;
        }
        self.inner.shared.import_context(&self.inner.id, snapshot)
    }

    // === Messages ===

    /// Send to one agent, or broadcast with `None`
    pub fn send_message(
        &self,
        receiver_id: Option<&str>,
        message_type: &str,
        content: Value,
        metadata: Option<Metadata>,
    ) {
        let message = AgentMessage::new(
            self.inner.id.clone(),
            receiver_id.map(str::to_string),
            message_type,
            content,
        )
        .with_metadata(metadata.unwrap_or_default());
        self.inner.shared.send_message(message);
    }

    /// Pending messages for this agent; `drain` consumes them
    pub fn get_messages(&self, message_type: Option<&str>, drain: bool) -> Vec<AgentMessage> {
        self.inner
            .shared
            .get_messages(&self.inner.id, message_type, drain)
    }

    /// Send one copy to every direct child. Returns how many were sent.
    pub fn broadcast_to_children(&self, message_type: &str, content: Value) -> usize {
        let children = self.children_ids();
        for child_id in &children {
            self.send_message(Some(child_id), message_type, content.clone(), None);
        }
        children.len()
    }

    /// Send one copy to every descendant. Returns how many were sent.
    pub fn broadcast_to_subtree(&self, message_type: &str, content: Value) -> usize {
        let descendants = self.inner.shared.descendants(&self.inner.id);
        for agent_id in &descendants {
            self.send_message(Some(agent_id), message_type, content.clone(), None);
        }
        descendants.len()
    }

    /// Message the parent. `false` for a root.
    pub fn send_to_parent(&self, message_type: &str, content: Value) -> bool {
        match self.parent_id() {
            Some(parent_id) => {
                self.send_message(Some(&parent_id), message_type, content, None);
                true
            }
            None => false,
        }
    }

    // === A2A ===

    /// Start a task seeded with a user message
    pub fn create_task(&self, user_message: &str, context_id: Option<String>) -> Task {
        let message = A2aMessage::from_text(Role::User, user_message);
        self.inner.shared.create_task(context_id, Some(message))
    }

    /// Send a text A2A message to another agent
    pub fn send_a2a_message(
        &self,
        receiver_id: &str,
        text: &str,
        context_id: Option<String>,
        task_id: Option<String>,
    ) -> Result<A2aMessage> {
        let mut message = A2aMessage::from_text(Role::User, text);
        message.context_id = context_id;
        message.task_id = task_id;

        self.inner
            .shared
            .send_a2a_message(&self.inner.id, receiver_id, message.clone())?;
        Ok(message)
    }

    // === Model calls ===

    /// Call this agent's model, injecting visible shared context
    pub async fn chat(&self, mut request: ChatRequest) -> Result<ChatResponse> {
        if self.inner.config.inject_context && !request.no_context_injection {
            self.inject_context(&mut request);
        }
        Ok(self.inner.model.chat(request).await?)
    }

    fn inject_context(&self, request: &mut ChatRequest) {
        let context = self.get_all_context(None);
        if context.is_empty() {
            return;
        }
        let block = format!("\n\nShared Context:\n{}", self.format_context(&context));

        let system = request
            .history
            .iter_mut()
            .filter(|m| m.role == ChatRole::System)
            .find_map(|m| m.content.as_mut());

        if let Some(content) = system {
            content.push_str(&block);
        } else if let Some(message) = request.message.as_mut() {
            *message = format!("{block}\n\n{message}");
        }
    }

    fn format_context(&self, context: &BTreeMap<String, Value>) -> String {
        let limit = self.inner.config.context_preview_chars;
        context
            .iter()
            .map(|(key, value)| match value {
                Value::String(s) => format!("- {key}: {s}"),
                Value::Number(_) | Value::Bool(_) => format!("- {key}: {value}"),
                other => {
                    let preview: String = other.to_string().chars().take(limit).collect();
                    format!("- {key}: {preview}...")
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Hand a task to a direct child and return its raw response.
    ///
    /// Model failures propagate unchanged.
    #[instrument(skip(self, tools), fields(agent_id = %self.inner.id))]
    pub async fn delegate(
        &self,
        child_id: &str,
        task_description: &str,
        tools: Vec<Tool>,
    ) -> Result<ChatResponse> {
        let child = self.resolve_child(child_id)?;

        let mut record = AssignedTask {
            task_id: self.inner.shared.next_id(),
            description: task_description.to_string(),
            tools: tools.iter().map(|t| t.name.clone()).collect(),
            assigned_to: child_id.to_string(),
            status: AssignmentStatus::Pending,
            result: None,
        };
        let key = format!("task:{}", record.task_id);

        self.set_scoped_context(&key, serde_json::to_value(&record)?, ContextScope::Children, None);
        self.send_message(
            Some(child_id),
            &self.inner.config.assignment_message_type,
            serde_json::to_value(&record)?,
            None,
        );

        let request = self.inner.config.request(task_description).with_tools(tools);
        let outcome = child.chat(request).await;

        match &outcome {
            Ok(response) => {
                record.status = AssignmentStatus::Completed;
                record.result = Some(serde_json::to_value(response)?);
                debug!(task_id = %record.task_id, child = %child_id, "Delegation completed");
            }
            Err(e) => {
                record.status = AssignmentStatus::Failed;
                record.result = Some(json!({ "error": e.to_string() }));
                warn!(task_id = %record.task_id, child = %child_id, error = %e, "Delegation failed");
            }
        }
        self.set_scoped_context(&key, serde_json::to_value(&record)?, ContextScope::Children, None);

        outcome
    }

    /// Delegate through the task tracker.
    ///
    /// The returned task is always terminal: a model failure becomes a
    /// `Failed` transition carrying the error text. Only a missing child is
    /// reported as an error.
    #[instrument(skip(self, tools), fields(agent_id = %self.inner.id))]
    pub async fn delegate_with_lifecycle(
        &self,
        child_id: &str,
        task_description: &str,
        tools: Vec<Tool>,
        context_id: Option<String>,
    ) -> Result<DelegationOutcome> {
        let child = self.resolve_child(child_id)?;
        let shared = &self.inner.shared;

        let task = self.create_task(task_description, context_id);
        shared.update_task(
            &task.id,
            TaskUpdate::state(TaskState::InProgress)
                .with_message(format!("Delegated to {child_id}")),
        )?;
        self.send_message(
            Some(child_id),
            &self.inner.config.assignment_message_type,
            json!({
                "task_id": task.id,
                "context_id": task.context_id,
                "description": task_description,
            }),
            None,
        );

        let request = self.inner.config.request(task_description).with_tools(tools);

        match child.chat(request).await {
            Ok(response) => {
                let text = response.content_or_empty().to_string();
                let artifact = Artifact::from_text(
                    text.clone(),
                    format!("{child_id}-result"),
                    Some(task_description.to_string()),
                );

                shared.add_task_message(&task.id, A2aMessage::from_text(Role::Agent, text))?;
                let task = shared.update_task(
                    &task.id,
                    TaskUpdate::state(TaskState::Completed)
                        .with_message("Task completed successfully")
                        .with_artifact(artifact.clone()),
                )?;

                info!(task_id = %task.id, child = %child_id, "Delegated task completed");
                Ok(DelegationOutcome {
                    task,
                    response: Some(response),
                    artifact: Some(artifact),
                })
            }
            Err(e) => {
                warn!(task_id = %task.id, child = %child_id, error = %e, "Delegated task failed");
                let task = shared.update_task(
                    &task.id,
                    TaskUpdate::state(TaskState::Failed).with_message(e.to_string()),
                )?;
                Ok(DelegationOutcome {
                    task,
                    response: None,
                    artifact: None,
                })
            }
        }
    }

    /// Give the same task to every child, then have this agent's model
    /// synthesize their answers.
    ///
    /// A failing child is recorded as an error entry and does not stop the
    /// others. Per-child results are kept in LOCAL scope under
    /// `config.results_key`.
    #[instrument(skip(self, aggregation_prompt, tools), fields(agent_id = %self.inner.id))]
    pub async fn aggregate(
        &self,
        task_description: &str,
        aggregation_prompt: &str,
        tools: Vec<Tool>,
    ) -> Result<ChatResponse> {
        self.ensure_registered()?;
        let children = self.children_ids();
        if children.is_empty() {
            return Err(ConclaveError::NoChildren(self.inner.id.clone()));
        }

        let mut results = Vec::with_capacity(children.len());
        for child_id in children {
            let result = match self.delegate(&child_id, task_description, tools.clone()).await {
                Ok(response) => ChildResult::Response(response),
                Err(e) => {
                    warn!(child = %child_id, error = %e, "Child failed during aggregation");
                    ChildResult::Error(e.to_string())
                }
            };
            results.push((child_id, result));
        }

        let mut stored = serde_json::Map::new();
        for (child_id, result) in &results {
            stored.insert(child_id.clone(), result.to_value()?);
        }
        self.set_scoped_context(
            &self.inner.config.results_key,
            Value::Object(stored),
            ContextScope::Local,
            None,
        );

        let message = format!(
            "{aggregation_prompt}\n\nChild Results:\n{}",
            format_child_results(&results)
        );
        self.chat(self.inner.config.request(message)).await
    }

    // === Diagnostics ===

    /// Indented rendering of the subtree rooted here
    pub fn tree_view(&self) -> String {
        let mut labels = HashMap::new();
        self.collect_labels(&mut labels);
        self.inner.shared.render_tree(&self.inner.id, &|agent_id: &str| {
            labels
                .get(agent_id)
                .cloned()
                .unwrap_or_else(|| agent_id.to_string())
        })
    }

    fn collect_labels(&self, labels: &mut HashMap<String, String>) {
        labels.insert(
            self.inner.id.clone(),
            format!("{} ({} - {})", self.inner.id, self.provider_name(), self.model_name()),
        );
        let children = self.inner.children.read().clone();
        for child in children {
            child.collect_labels(labels);
        }
    }

    pub fn tree_stats(&self) -> TreeStats {
        self.inner.shared.tree_stats()
    }
}

fn format_child_results(results: &[(String, ChildResult)]) -> String {
    results
        .iter()
        .map(|(child_id, result)| match result {
            ChildResult::Error(error) => format!("\n{child_id}: ERROR - {error}"),
            ChildResult::Response(response) => {
                format!("\n{child_id}:\n{}", response.content_or_empty())
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl fmt::Debug for HierarchicalAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HierarchicalAgent")
            .field("id", &self.inner.id)
            .field("provider", &self.provider_name())
            .field("model", &self.model_name())
            .field("children", &self.inner.children.read().len())
            .finish()
    }
}
