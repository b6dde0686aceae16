//! Conclave error types

use thiserror::Error;

/// Errors that can occur while coordinating an agent tree
#[derive(Debug, Error)]
pub enum ConclaveError {
    /// Agent not registered
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Target is not a live child of the delegating agent
    #[error("Child agent '{child}' not found under '{parent}'")]
    ChildNotFound { parent: String, child: String },

    /// Task id unknown to the tracker
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Aggregation requested on a leaf agent
    #[error("Agent '{0}' has no children to delegate to")]
    NoChildren(String),

    /// The language model capability failed
    #[error(transparent)]
    ModelCall(#[from] anyhow::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ConclaveError>;
