//! The shared coordination substrate
//!
//! [`SharedContext`] bundles the hierarchy, context store, message bus and task
//! tracker behind one lock. Every operation takes the lock once, so ancestry
//! checks always see a whole tree and a recursive unregister is a single
//! atomic step. Events are queued on the unbounded stream before the lock is
//! released, so their order matches the order changes were applied. Nothing
//! else runs while the lock is held.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::bus::{AgentMessage, MessageBus};
use crate::channel::{CoordinationEvent, EventSink, EventStream};
use crate::context::{ContextEntry, ContextScope, ContextSnapshot, ContextStore};
use crate::error::Result;
use crate::hierarchy::AgentHierarchy;
use crate::ids::{IdGenerator, UuidGenerator};
use crate::task::{A2aMessage, Task, TaskTracker, TaskUpdate};
use crate::Metadata;

/// Message type used when A2A messages are mirrored onto the bus
pub const A2A_MESSAGE_TYPE: &str = "a2a_message";

/// Diagnostic snapshot of the substrate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeStats {
    pub total_agents: usize,
    pub total_context_entries: usize,
    pub total_messages: usize,
    pub total_tasks: usize,
    pub agents: Vec<String>,
}

#[derive(Default)]
struct State {
    hierarchy: AgentHierarchy,
    store: ContextStore,
    bus: MessageBus,
    tracker: TaskTracker,
    /// Live facades per registered id
    claims: HashMap<String, usize>,
}

struct Inner {
    state: Mutex<State>,
    ids: Arc<dyn IdGenerator>,
    events: Option<EventSink>,
}

impl Inner {
    fn emit(&self, event: CoordinationEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

/// Handle to the shared substrate. Clones share the same state.
#[derive(Clone)]
pub struct SharedContext {
    inner: Arc<Inner>,
}

/// Builder for a configured [`SharedContext`]
pub struct SharedContextBuilder {
    ids: Arc<dyn IdGenerator>,
}

impl SharedContextBuilder {
    pub fn new() -> Self {
        Self {
            ids: Arc::new(UuidGenerator),
        }
    }

    /// Use a custom id source for tasks and contexts
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn build(self) -> SharedContext {
        SharedContext::from_parts(self.ids, None)
    }

    /// Build and attach an event stream
    pub fn build_with_events(self) -> (SharedContext, EventStream) {
        let (sink, stream) = EventStream::new();
        (SharedContext::from_parts(self.ids, Some(sink)), stream)
    }
}

impl Default for SharedContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedContext {
    /// Create a new shared context with UUID ids and no event stream
    pub fn new() -> Self {
        SharedContextBuilder::new().build()
    }

    pub fn builder() -> SharedContextBuilder {
        SharedContextBuilder::new()
    }

    /// Create a shared context that reports to an [`EventStream`]
    pub fn with_events() -> (Self, EventStream) {
        SharedContextBuilder::new().build_with_events()
    }

    fn from_parts(ids: Arc<dyn IdGenerator>, events: Option<EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                ids,
                events,
            }),
        }
    }

    /// Fresh id from the configured generator
    pub fn next_id(&self) -> String {
        self.inner.ids.next_id()
    }

    /// Whether two handles point at the same substrate
    pub fn same_as(&self, other: &SharedContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // === Hierarchy ===

    /// Register an agent in the tree and return its generation
    pub fn register(&self, agent_id: &str, parent_id: Option<&str>, metadata: Metadata) -> u64 {
        let mut state = self.inner.state.lock();
        self.register_locked(&mut state, agent_id, parent_id, metadata)
    }

    /// Register on behalf of a facade handle, which must later call `release`
    pub(crate) fn claim(&self, agent_id: &str, parent_id: Option<&str>, metadata: Metadata) -> u64 {
        let mut state = self.inner.state.lock();
        let generation = self.register_locked(&mut state, agent_id, parent_id, metadata);
        *state.claims.entry(agent_id.to_string()).or_default() += 1;
        generation
    }

    /// Drop a facade's claim. The agent is unregistered when the last claim on
    /// its current generation goes; a claim on an earlier generation of the
    /// same id is ignored.
    pub(crate) fn release(&self, agent_id: &str, generation: u64) -> Vec<String> {
        let mut state = self.inner.state.lock();
        if state.hierarchy.generation(agent_id) != Some(generation) {
            return Vec::new();
        }
        if let Some(count) = state.claims.get_mut(agent_id) {
            *count = count.saturating_sub(1);
            if *count > 0 {
                return Vec::new();
            }
        }
        self.unregister_locked(&mut state, agent_id)
    }

    /// Remove an agent, its subtree, and every context entry any of them owns.
    ///
    /// Unknown ids are a no-op and return an empty list.
    pub fn unregister(&self, agent_id: &str) -> Vec<String> {
        let mut state = self.inner.state.lock();
        self.unregister_locked(&mut state, agent_id)
    }

    fn register_locked(
        &self,
        state: &mut State,
        agent_id: &str,
        parent_id: Option<&str>,
        metadata: Metadata,
    ) -> u64 {
        let generation = state.hierarchy.register(agent_id, parent_id, metadata);

        info!(agent_id = %agent_id, parent = ?parent_id, generation, "Registered agent");
        self.inner.emit(CoordinationEvent::AgentRegistered {
            agent_id: agent_id.to_string(),
            parent_id: parent_id.map(str::to_string),
        });
        generation
    }

    fn unregister_locked(&self, state: &mut State, agent_id: &str) -> Vec<String> {
        let removed = state.hierarchy.unregister(agent_id);
        if removed.is_empty() {
            return removed;
        }
        let purged = state.store.purge_owned_by(&removed);
        for id in &removed {
            state.claims.remove(id);
        }

        info!(
            agent_id = %agent_id,
            removed = removed.len(),
            purged_entries = purged,
            "Unregistered agent subtree"
        );
        self.inner.emit(CoordinationEvent::AgentUnregistered {
            agent_id: agent_id.to_string(),
            removed: removed.clone(),
            purged_entries: purged,
        });
        removed
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.inner.state.lock().hierarchy.contains(agent_id)
    }

    pub fn children(&self, agent_id: &str) -> Vec<String> {
        self.inner.state.lock().hierarchy.children(agent_id)
    }

    pub fn parent(&self, agent_id: &str) -> Option<String> {
        self.inner.state.lock().hierarchy.parent(agent_id)
    }

    /// Ancestors nearest first
    pub fn ancestors(&self, agent_id: &str) -> Vec<String> {
        self.inner.state.lock().hierarchy.ancestors(agent_id)
    }

    pub fn descendants(&self, agent_id: &str) -> Vec<String> {
        self.inner.state.lock().hierarchy.descendants(agent_id)
    }

    pub fn depth(&self, agent_id: &str) -> usize {
        self.inner.state.lock().hierarchy.depth(agent_id)
    }

    pub fn agent_metadata(&self, agent_id: &str) -> Option<Metadata> {
        self.inner.state.lock().hierarchy.metadata(agent_id).cloned()
    }

    /// Render the subtree under `agent_id`.
    ///
    /// `label` runs while the lock is held and must not call back into this
    /// context.
    pub fn render_tree(&self, agent_id: &str, label: &dyn Fn(&str) -> String) -> String {
        self.inner.state.lock().hierarchy.render(agent_id, label)
    }

    // === Scoped context ===

    /// Insert or update a context entry
    pub fn set(
        &self,
        key: &str,
        value: Value,
        agent_id: &str,
        scope: ContextScope,
        metadata: Option<Metadata>,
    ) {
        let mut state = self.inner.state.lock();
        let created = state.store.set(key, value, agent_id, scope, metadata);
        // Report the entry's real owner/scope, which an update leaves untouched
        let entry = state.store.lookup(key);
        let owner_id = entry.map_or_else(|| agent_id.to_string(), |e| e.owner_id.clone());
        let scope = entry.map_or(scope, |e| e.scope);

        debug!(key = %key, agent_id = %agent_id, created, "Set context entry");
        self.inner.emit(CoordinationEvent::ContextUpdated {
            key: key.to_string(),
            owner_id,
            scope,
            created,
        });
    }

    /// Value visible to `agent_id`; absent and hidden keys both give `None`
    pub fn get(&self, key: &str, agent_id: &str) -> Option<Value> {
        let state = self.inner.state.lock();
        state.store.get(key, agent_id, &state.hierarchy).cloned()
    }

    /// Full entry visible to `agent_id`
    pub fn entry(&self, key: &str, agent_id: &str) -> Option<ContextEntry> {
        let state = self.inner.state.lock();
        state.store.entry(key, agent_id, &state.hierarchy).cloned()
    }

    /// Every value visible to `agent_id`, optionally of one scope
    pub fn get_all(
        &self,
        agent_id: &str,
        scope_filter: Option<ContextScope>,
    ) -> BTreeMap<String, Value> {
        let state = self.inner.state.lock();
        state.store.get_all(agent_id, scope_filter, &state.hierarchy)
    }

    /// Delete an entry; `false` when missing or not owned by `agent_id`
    pub fn delete(&self, key: &str, agent_id: &str) -> bool {
        let mut state = self.inner.state.lock();
        let deleted = state.store.delete(key, agent_id);
        if deleted {
            debug!(key = %key, agent_id = %agent_id, "Deleted context entry");
            self.inner.emit(CoordinationEvent::ContextDeleted {
                key: key.to_string(),
                owner_id: agent_id.to_string(),
            });
        }
        deleted
    }

    pub fn export_context(&self, agent_id: &str) -> ContextSnapshot {
        let state = self.inner.state.lock();
        state.store.export(agent_id, &state.hierarchy)
    }

    /// Import a snapshot with `agent_id` as the owner of every entry
    pub fn import_context(&self, agent_id: &str, snapshot: &ContextSnapshot) -> usize {
        let imported = self.inner.state.lock().store.import(agent_id, snapshot);
        debug!(agent_id = %agent_id, imported, from = %snapshot.agent_id, "Imported context");
        imported
    }

    // === Message bus ===

    /// Append a message to the bus
    pub fn send_message(&self, message: AgentMessage) {
        let event = CoordinationEvent::MessageSent {
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            message_type: message.message_type.clone(),
        };
        debug!(
            sender = %message.sender_id,
            receiver = ?message.receiver_id,
            message_type = %message.message_type,
            "Sending message"
        );

        let mut state = self.inner.state.lock();
        state.bus.send(message);
        self.inner.emit(event);
    }

    /// Pending messages for `agent_id`; `drain` removes them from its mailbox
    pub fn get_messages(
        &self,
        agent_id: &str,
        message_type: Option<&str>,
        drain: bool,
    ) -> Vec<AgentMessage> {
        self.inner
            .state
            .lock()
            .bus
            .receive(agent_id, message_type, drain)
    }

    pub fn pending_messages(&self, agent_id: &str) -> usize {
        self.inner.state.lock().bus.pending_count(agent_id)
    }

    // === Task lifecycle ===

    /// Create a pending task. Without a context id a fresh one is generated.
    pub fn create_task(
        &self,
        context_id: Option<String>,
        initial_message: Option<A2aMessage>,
    ) -> Task {
        let task_id = self.next_id();
        let context_id = context_id.unwrap_or_else(|| self.next_id());

        let mut state = self.inner.state.lock();
        let task = state.tracker.create(task_id, context_id, initial_message);

        debug!(task_id = %task.id, context_id = %task.context_id, "Created task");
        self.inner.emit(CoordinationEvent::TaskCreated {
            task_id: task.id.clone(),
            context_id: task.context_id.clone(),
        });
        task
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.inner.state.lock().tracker.task(task_id).cloned()
    }

    /// Apply a state change, message and/or artifact to a task
    pub fn update_task(&self, task_id: &str, update: TaskUpdate) -> Result<Task> {
        let transition = update.state;
        let mut state = self.inner.state.lock();
        let from = state.tracker.task(task_id).map(Task::state);
        let task = state.tracker.update(task_id, update)?.clone();

        if let (Some(from), Some(to)) = (from, transition) {
            debug!(task_id = %task_id, %from, %to, "Task transition");
            self.inner.emit(CoordinationEvent::TaskUpdated {
                task_id: task_id.to_string(),
                from,
                to,
            });
        }
        Ok(task)
    }

    pub fn add_task_message(&self, task_id: &str, message: A2aMessage) -> Result<()> {
        self.inner.state.lock().tracker.add_message(task_id, message)
    }

    pub fn tasks_by_context(&self, context_id: &str) -> Vec<Task> {
        self.inner.state.lock().tracker.tasks_by_context(context_id)
    }

    pub fn messages_by_context(&self, context_id: &str) -> Vec<A2aMessage> {
        self.inner.state.lock().tracker.messages_by_context(context_id)
    }

    /// Record an A2A message under its context id and mirror it on the bus
    pub fn send_a2a_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        message: A2aMessage,
    ) -> Result<()> {
        let content = serde_json::to_value(&message)?;
        let mut metadata = Metadata::new();
        metadata.insert("a2a".into(), Value::Bool(true));

        let envelope = AgentMessage::new(
            sender_id,
            Some(receiver_id.to_string()),
            A2A_MESSAGE_TYPE,
            content,
        )
        .with_metadata(metadata);

        let mut state = self.inner.state.lock();
        state.tracker.record_message(message);
        state.bus.send(envelope);

        debug!(sender = %sender_id, receiver = %receiver_id, "Sent A2A message");
        self.inner.emit(CoordinationEvent::MessageSent {
            sender_id: sender_id.to_string(),
            receiver_id: Some(receiver_id.to_string()),
            message_type: A2A_MESSAGE_TYPE.to_string(),
        });
        Ok(())
    }

    // === Diagnostics ===

    /// Counts at the moment of the call
    pub fn tree_stats(&self) -> TreeStats {
        let state = self.inner.state.lock();
        TreeStats {
            total_agents: state.hierarchy.len(),
            total_context_entries: state.store.len(),
            total_messages: state.bus.len(),
            total_tasks: state.tracker.len(),
            agents: state.hierarchy.agent_ids(),
        }
    }
}

impl Default for SharedContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SharedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedContext")
            .field("stats", &self.tree_stats())
            .finish()
    }
}
