//! # Conclave
//!
//! Coordination substrate for trees of LLM-backed agents.
//!
//! Agents are arranged in a parent/child hierarchy and share one
//! [`SharedContext`]: a scoped key/value store, a message bus and an
//! A2A-style task tracker, all guarded by a single lock.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          SHARED CONTEXT                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌──────────┐ │
//! │  │   Registry   │  │ Scoped Store │  │ Message Bus  │  │  Tasks   │ │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  └──────────┘ │
//! └────────────────────────────┬────────────────────────────────────────┘
//!                              │
//!                       ┌──────┴──────┐
//!                       │ Root Agent  │   delegate / aggregate
//!                       └──────┬──────┘
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!   ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//!   │    Lead     │     │    Lead     │     │   Worker    │
//!   └──────┬──────┘     └──────┬──────┘     └─────────────┘
//!     ┌────┴────┐         ┌────┴────┐
//!     ▼         ▼         ▼         ▼
//!   ┌───┐     ┌───┐     ┌───┐     ┌───┐
//!   │W1 │     │W2 │     │W3 │     │W4 │
//!   └───┘     └───┘     └───┘     └───┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Scope**: who may read a context entry (local, children, subtree, global)
//! - **Bus**: direct and broadcast messages, drained per agent
//! - **Task**: delegated work moving from pending to completed or failed
//! - **HierarchicalAgent**: a tree node bound to a [`LanguageModel`]

pub mod agent;
pub mod bus;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod hierarchy;
pub mod ids;
pub mod llm;
pub mod session;
pub mod task;

/// Free-form metadata attached to agents, entries, messages and tasks
pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub use agent::{AssignedTask, AssignmentStatus, ChildResult, DelegationOutcome, HierarchicalAgent};
pub use bus::{AgentMessage, MessageBus};
pub use channel::{CoordinationEvent, EventStream};
pub use config::AgentConfig;
pub use context::{ContextEntry, ContextScope, ContextSnapshot, ContextStore};
pub use error::{ConclaveError, Result};
pub use hierarchy::{AgentHierarchy, AgentNode};
pub use ids::{IdGenerator, SequentialIds, UuidGenerator};
pub use llm::{ChatMessage, ChatRequest, ChatResponse, ChatRole, LanguageModel, Tool, ToolCall};
pub use session::{SharedContext, SharedContextBuilder, TreeStats, A2A_MESSAGE_TYPE};
pub use task::{
    A2aMessage, Artifact, Part, Role, StateTransition, Task, TaskState, TaskStatus, TaskTracker,
    TaskUpdate,
};
