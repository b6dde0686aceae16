//! Message bus between agents of one tree
//!
//! A single append-only log. Point-to-point messages leave the log when their
//! receiver drains them. Broadcasts stay in the log and remember who already
//! drained them, so every agent gets its own copy exactly once.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Metadata;

/// Message passed between agents in the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub sender_id: String,
    /// `None` means broadcast
    pub receiver_id: Option<String>,
    pub message_type: String,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl AgentMessage {
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: Option<String>,
        message_type: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            receiver_id,
            message_type: message_type.into(),
            content,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver_id.is_none()
    }

    fn addressed_to(&self, agent_id: &str) -> bool {
        self.receiver_id.as_deref().map_or(true, |r| r == agent_id)
    }
}

#[derive(Debug)]
struct Envelope {
    message: AgentMessage,
    /// Agents that already drained this broadcast
    drained_by: HashSet<String>,
}

impl Envelope {
    fn pending_for(&self, agent_id: &str) -> bool {
        self.message.addressed_to(agent_id) && !self.drained_by.contains(agent_id)
    }
}

/// Shared message log
#[derive(Debug, Default)]
pub struct MessageBus {
    log: Vec<Envelope>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message. Never fails, whether or not the receiver exists.
    pub fn send(&mut self, message: AgentMessage) {
        self.log.push(Envelope {
            message,
            drained_by: HashSet::new(),
        });
    }

    /// Messages pending for `agent_id`, in log order.
    ///
    /// With `drain` set, returned direct messages leave the log and returned
    /// broadcasts are marked as delivered to this agent only.
    pub fn receive(
        &mut self,
        agent_id: &str,
        message_type: Option<&str>,
        drain: bool,
    ) -> Vec<AgentMessage> {
        let matches = |envelope: &Envelope| {
            envelope.pending_for(agent_id)
                && message_type.map_or(true, |t| envelope.message.message_type == t)
        };

        if !drain {
            return self
                .log
                .iter()
                .filter(|e| matches(*e))
                .map(|e| e.message.clone())
                .collect();
        }

        let mut delivered = Vec::new();
        let mut remaining = Vec::with_capacity(self.log.len());

        for mut envelope in self.log.drain(..) {
            if !matches(&envelope) {
                remaining.push(envelope);
                continue;
            }
            delivered.push(envelope.message.clone());
            if envelope.message.is_broadcast() {
                envelope.drained_by.insert(agent_id.to_string());
                remaining.push(envelope);
            }
        }

        self.log = remaining;
        delivered
    }

    /// Number of messages `agent_id` would receive right now
    pub fn pending_count(&self, agent_id: &str) -> usize {
        self.log.iter().filter(|e| e.pending_for(agent_id)).count()
    }

    /// Messages currently retained in the log
    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}
