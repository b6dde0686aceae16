//! Task lifecycle tracking for delegated work
//!
//! Tasks follow `Pending -> InProgress -> {Completed, Failed}`. The tracker
//! records every transition it is asked to make, in call order, and groups
//! tasks and messages by conversation context id.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ConclaveError, Result};
use crate::Metadata;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskState {
    /// Completed and Failed are terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TaskState,
    pub to: TaskState,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Current status plus the full transition history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub transitions: Vec<StateTransition>,
}

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// Content part of a message or artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Part {
    Text { text: String },
    Data { data: Value },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Data { .. } => None,
        }
    }
}

/// Agent-to-agent message recorded against a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct A2aMessage {
    pub message_id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    pub context_id: Option<String>,
    pub task_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl A2aMessage {
    /// Single text-part message
    pub fn from_text(role: Role, text: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            role,
            parts: vec![Part::text(text)],
            context_id: None,
            task_id: None,
            metadata: Metadata::new(),
        }
    }

    pub fn in_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Concatenated text parts
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Output attached to a task. Never modified once attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub name: String,
    pub description: Option<String>,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Artifact {
    /// Single text-part artifact
    pub fn from_text(
        text: impl Into<String>,
        name: impl Into<String>,
        description: Option<String>,
    ) -> Self {
        Self {
            artifact_id: Uuid::new_v4().to_string(),
            name: name.into(),
            description,
            parts: vec![Part::text(text)],
            metadata: Metadata::new(),
        }
    }

    /// Text of the first text part
    pub fn text(&self) -> Option<&str> {
        self.parts.iter().find_map(Part::as_text)
    }
}

/// A unit of delegated work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub context_id: String,
    pub status: TaskStatus,
    pub history: Vec<A2aMessage>,
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Task {
    pub fn state(&self) -> TaskState {
        self.status.state
    }

    fn record_transition(&mut self, to: TaskState, message: Option<String>) {
        let now = Utc::now();
        self.status.transitions.push(StateTransition {
            from: self.status.state,
            to,
            message: message.clone(),
            timestamp: now,
        });
        self.status.state = to;
        self.status.message = message;
        self.status.timestamp = now;
    }
}

/// Changes applied by [`TaskTracker::update`]. Each field is independent.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub state: Option<TaskState>,
    pub message: Option<String>,
    pub artifact: Option<Artifact>,
}

impl TaskUpdate {
    pub fn state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifact = Some(artifact);
        self
    }
}

/// Owns every task and the per-context indexes
#[derive(Debug, Default)]
pub struct TaskTracker {
    tasks: HashMap<String, Task>,
    context_tasks: HashMap<String, Vec<String>>,
    context_messages: HashMap<String, Vec<A2aMessage>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a `Pending` task under `context_id`.
    ///
    /// The initial message, if any, is stamped with the task and context ids
    /// and recorded in both the task history and the context message log.
    pub fn create(
        &mut self,
        task_id: String,
        context_id: String,
        initial_message: Option<A2aMessage>,
    ) -> Task {
        let now = Utc::now();
        let mut task = Task {
            id: task_id,
            context_id,
            status: TaskStatus {
                state: TaskState::Pending,
                message: None,
                timestamp: now,
                transitions: Vec::new(),
            },
            history: Vec::new(),
            artifacts: Vec::new(),
            metadata: Metadata::new(),
        };

        if let Some(message) = initial_message {
            let message = message.in_context(&task.context_id).for_task(&task.id);
            self.record_message(message.clone());
            task.history.push(message);
        }

        self.context_tasks
            .entry(task.context_id.clone())
            .or_default()
            .push(task.id.clone());
        self.tasks.insert(task.id.clone(), task.clone());
        task
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    /// Apply an update.
    ///
    /// A message sent with a state change annotates that transition; a
    /// message on its own is appended to the task history as an agent
    /// message. Transitions out of terminal states are recorded like any
    /// other.
    pub fn update(&mut self, task_id: &str, update: TaskUpdate) -> Result<&Task> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ConclaveError::TaskNotFound(task_id.to_string()))?;

        match (update.state, update.message) {
            (Some(state), message) => task.record_transition(state, message),
            (None, Some(text)) => {
                let message = A2aMessage::from_text(Role::Agent, text)
                    .in_context(&task.context_id)
                    .for_task(&task.id);
                task.history.push(message.clone());
                self.context_messages
                    .entry(message.context_id.clone().unwrap_or_default())
                    .or_default()
                    .push(message);
            }
            (None, None) => {}
        }

        if let Some(artifact) = update.artifact {
            task.artifacts.push(artifact);
        }

        Ok(task)
    }

    /// Append a message to a task's history and to its context log
    pub fn add_message(&mut self, task_id: &str, message: A2aMessage) -> Result<()> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ConclaveError::TaskNotFound(task_id.to_string()))?;

        let message = message.in_context(&task.context_id).for_task(&task.id);
        task.history.push(message.clone());
        self.record_message(message);
        Ok(())
    }

    /// Record a message under its context id. Messages without one are dropped
    /// from the index and reported as `false`.
    pub fn record_message(&mut self, message: A2aMessage) -> bool {
        match message.context_id.clone() {
            Some(context_id) => {
                self.context_messages.entry(context_id).or_default().push(message);
                true
            }
            None => false,
        }
    }

    /// Tasks of a context, in creation order
    pub fn tasks_by_context(&self, context_id: &str) -> Vec<Task> {
        self.context_tasks
            .get(context_id)
            .map(|ids| ids.iter().filter_map(|id| self.tasks.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    /// Messages of a context, in insertion order
    pub fn messages_by_context(&self, context_id: &str) -> Vec<A2aMessage> {
        self.context_messages
            .get(context_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with_task() -> (TaskTracker, String) {
        let mut tracker = TaskTracker::new();
        let task = tracker.create("t1".into(), "ctx".into(), None);
        (tracker, task.id)
    }

    // === Creation Tests ===

    #[test]
    fn test_create_task_is_pending() {
        let mut tracker = TaskTracker::new();
        let task = tracker.create(
            "t1".into(),
            "ctx".into(),
            Some(A2aMessage::from_text(Role::User, "summarize")),
        );

        assert_eq!(task.state(), TaskState::Pending);
        assert!(task.status.transitions.is_empty());
        assert_eq!(task.history.len(), 1);
        assert_eq!(task.history[0].task_id.as_deref(), Some("t1"));
        assert_eq!(tracker.messages_by_context("ctx").len(), 1);
    }

    #[test]
    fn test_tasks_grouped_by_context_in_order() {
        let mut tracker = TaskTracker::new();
        tracker.create("a".into(), "ctx-1".into(), None);
        tracker.create("b".into(), "ctx-2".into(), None);
        tracker.create("c".into(), "ctx-1".into(), None);

        let ids: Vec<_> = tracker
            .tasks_by_context("ctx-1")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(tracker.tasks_by_context("unknown").is_empty());
    }

    // === Transition Tests ===

    #[test]
    fn test_forward_lifecycle_history() {
        let (mut tracker, id) = tracker_with_task();

        tracker
            .update(&id, TaskUpdate::state(TaskState::InProgress).with_message("working"))
            .unwrap();
        let task = tracker
            .update(
                &id,
                TaskUpdate::state(TaskState::Completed)
                    .with_artifact(Artifact::from_text("done", "result.txt", None)),
            )
            .unwrap();

        assert_eq!(task.state(), TaskState::Completed);
        let transitions = &task.status.transitions;
        assert_eq!(transitions.len(), 2);
        assert_eq!((transitions[0].from, transitions[0].to), (TaskState::Pending, TaskState::InProgress));
        assert_eq!(transitions[0].message.as_deref(), Some("working"));
        assert_eq!((transitions[1].from, transitions[1].to), (TaskState::InProgress, TaskState::Completed));
        assert_eq!(task.artifacts[0].text(), Some("done"));
    }

    #[test]
    fn test_direct_pending_to_failed() {
        let (mut tracker, id) = tracker_with_task();
        let task = tracker
            .update(&id, TaskUpdate::state(TaskState::Failed).with_message("boom"))
            .unwrap();
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(task.status.message.as_deref(), Some("boom"));
    }

    /// Documents current behaviour: terminal states are not enforced, a late
    /// transition is simply recorded.
    #[test]
    fn test_transition_out_of_terminal_state_is_recorded() {
        let (mut tracker, id) = tracker_with_task();
        tracker.update(&id, TaskUpdate::state(TaskState::Completed)).unwrap();
        let task = tracker.update(&id, TaskUpdate::state(TaskState::InProgress)).unwrap();

        assert_eq!(task.state(), TaskState::InProgress);
        assert_eq!(task.status.transitions.len(), 2);
        assert!(task.status.transitions[1].from.is_terminal());
    }

    #[test]
    fn test_history_length_matches_transition_calls() {
        let (mut tracker, id) = tracker_with_task();
        let calls = [
            TaskState::InProgress,
            TaskState::InProgress,
            TaskState::Completed,
        ];
        for state in calls {
            tracker.update(&id, TaskUpdate::state(state)).unwrap();
        }
        let task = tracker.task(&id).unwrap();
        let recorded: Vec<_> = task.status.transitions.iter().map(|t| t.to).collect();
        assert_eq!(recorded, calls);
    }

    #[test]
    fn test_message_only_update_goes_to_history() {
        let (mut tracker, id) = tracker_with_task();
        let task = tracker
            .update(&id, TaskUpdate::default().with_message("progress note"))
            .unwrap();

        assert_eq!(task.state(), TaskState::Pending);
        assert!(task.status.transitions.is_empty());
        assert_eq!(task.history.last().unwrap().text(), "progress note");
        assert_eq!(tracker.messages_by_context("ctx").len(), 1);
    }

    #[test]
    fn test_artifact_only_update() {
        let (mut tracker, id) = tracker_with_task();
        let task = tracker
            .update(
                &id,
                TaskUpdate::default().with_artifact(Artifact::from_text("x", "draft", None)),
            )
            .unwrap();
        assert_eq!(task.artifacts.len(), 1);
        assert!(task.status.transitions.is_empty());
    }

    #[test]
    fn test_update_unknown_task() {
        let mut tracker = TaskTracker::new();
        let err = tracker
            .update("ghost", TaskUpdate::state(TaskState::Completed))
            .unwrap_err();
        assert!(matches!(err, ConclaveError::TaskNotFound(id) if id == "ghost"));
    }

    // === Message Tests ===

    #[test]
    fn test_add_message_indexes_context() {
        let (mut tracker, id) = tracker_with_task();
        tracker
            .add_message(&id, A2aMessage::from_text(Role::User, "follow-up"))
            .unwrap();

        let messages = tracker.messages_by_context("ctx");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].context_id.as_deref(), Some("ctx"));
        assert!(tracker.add_message("ghost", A2aMessage::from_text(Role::User, "x")).is_err());
    }

    #[test]
    fn test_record_message_without_context() {
        let mut tracker = TaskTracker::new();
        assert!(!tracker.record_message(A2aMessage::from_text(Role::Agent, "loose")));
        assert!(tracker.record_message(A2aMessage::from_text(Role::Agent, "kept").in_context("c")));
        assert_eq!(tracker.messages_by_context("c").len(), 1);
    }

    #[test]
    fn test_task_serializes_state_kebab_case() {
        let (tracker, id) = tracker_with_task();
        let json = serde_json::to_value(tracker.task(&id).unwrap()).unwrap();
        assert_eq!(json["status"]["state"], "pending");
        assert_eq!(TaskState::InProgress.to_string(), "in-progress");
    }
}
