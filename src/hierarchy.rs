//! Agent hierarchy management
//!
//! The registry is a flat arena of [`AgentNode`]s keyed by agent id. Parent and
//! child links are plain ids, so every traversal is a chain of lookups and no
//! node ever holds a reference to another.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Metadata;

/// Node in the agent hierarchy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentNode {
    pub agent_id: String,
    /// May name an agent that was never registered; the link is then dangling
    pub parent: Option<String>,
    /// Direct children in registration order
    pub children: Vec<String>,
    pub metadata: Metadata,
    pub registered_at: DateTime<Utc>,
    /// Assigned when the id is first registered; re-registering keeps it
    #[serde(default)]
    pub generation: u64,
}

/// Manages the agent hierarchy tree
#[derive(Debug, Default)]
pub struct AgentHierarchy {
    nodes: HashMap<String, AgentNode>,
    last_generation: u64,
}

impl AgentHierarchy {
    /// Create a new empty hierarchy
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an agent to the hierarchy.
    ///
    /// Re-registering an existing id overwrites its parent and metadata. The
    /// node keeps its children and is moved out of its previous parent's child
    /// list, so the tree shape stays consistent.
    ///
    /// Returns the node's generation. It survives re-registration, while an id
    /// registered again after removal gets a higher one.
    pub fn register(&mut self, agent_id: &str, parent_id: Option<&str>, metadata: Metadata) -> u64 {
        let mut children = Vec::new();
        let mut generation = None;

        if let Some(previous) = self.nodes.remove(agent_id) {
            if let Some(old_parent) = previous.parent.as_deref() {
                if let Some(parent) = self.nodes.get_mut(old_parent) {
                    parent.children.retain(|id| id != agent_id);
                }
            }
            children = previous.children;
            generation = Some(previous.generation);
        }
        let generation = generation.unwrap_or_else(|| {
            self.last_generation += 1;
            self.last_generation
        });

        // Add to parent's children
        if let Some(pid) = parent_id {
            if let Some(parent) = self.nodes.get_mut(pid) {
                if !parent.children.iter().any(|id| id == agent_id) {
                    parent.children.push(agent_id.to_string());
                }
            }
        }

        let node = AgentNode {
            agent_id: agent_id.to_string(),
            parent: parent_id.map(str::to_string),
            children,
            metadata,
            registered_at: Utc::now(),
            generation,
        };

        self.nodes.insert(agent_id.to_string(), node);
        generation
    }

    /// Remove an agent and its whole subtree.
    ///
    /// Returns every removed id, descendants before their ancestors. Unknown ids
    /// yield an empty list.
    pub fn unregister(&mut self, agent_id: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.unregister_into(agent_id, &mut removed);
        removed
    }

    fn unregister_into(&mut self, agent_id: &str, removed: &mut Vec<String>) {
        let Some(node) = self.nodes.get(agent_id) else {
            return;
        };
        let parent = node.parent.clone();
        let children = node.children.clone();

        // Remove from parent's children
        if let Some(pid) = parent {
            if let Some(parent) = self.nodes.get_mut(&pid) {
                parent.children.retain(|id| id != agent_id);
            }
        }

        for child_id in children {
            self.unregister_into(&child_id, removed);
        }

        self.nodes.remove(agent_id);
        removed.push(agent_id.to_string());
    }

    pub fn generation(&self, agent_id: &str) -> Option<u64> {
        self.nodes.get(agent_id).map(|n| n.generation)
    }

    /// Check whether an agent is registered
    pub fn contains(&self, agent_id: &str) -> bool {
        self.nodes.contains_key(agent_id)
    }

    /// Get a registered node
    pub fn node(&self, agent_id: &str) -> Option<&AgentNode> {
        self.nodes.get(agent_id)
    }

    /// Get registration metadata of an agent
    pub fn metadata(&self, agent_id: &str) -> Option<&Metadata> {
        self.nodes.get(agent_id).map(|n| &n.metadata)
    }

    /// Get parent of an agent
    pub fn parent(&self, agent_id: &str) -> Option<String> {
        self.nodes.get(agent_id).and_then(|n| n.parent.clone())
    }

    /// Get children of an agent
    pub fn children(&self, agent_id: &str) -> Vec<String> {
        self.nodes
            .get(agent_id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Ancestors of an agent, nearest first (parent, grandparent, ..., root).
    ///
    /// A dangling parent link is reported and ends the walk.
    pub fn ancestors(&self, agent_id: &str) -> Vec<String> {
        let mut ancestors = Vec::new();
        let mut current = self.parent(agent_id);

        // A well-formed tree never needs more hops than it has nodes
        while let Some(id) = current {
            if ancestors.len() > self.nodes.len() {
                break;
            }
            current = self.parent(&id);
            ancestors.push(id);
        }

        ancestors
    }

    /// Check whether `ancestor` appears in the ancestor chain of `agent_id`
    pub fn is_ancestor(&self, ancestor: &str, agent_id: &str) -> bool {
        self.ancestors(agent_id).iter().any(|id| id == ancestor)
    }

    /// Every agent below `agent_id`, depth-first. The agent itself is excluded.
    pub fn descendants(&self, agent_id: &str) -> Vec<String> {
        let mut descendants = Vec::new();
        let mut to_visit: Vec<String> = self.children(agent_id).into_iter().rev().collect();

        while let Some(id) = to_visit.pop() {
            if descendants.len() > self.nodes.len() {
                break;
            }
            to_visit.extend(self.children(&id).into_iter().rev());
            descendants.push(id);
        }

        descendants
    }

    /// Get depth of an agent in the tree
    pub fn depth(&self, agent_id: &str) -> usize {
        if !self.contains(agent_id) {
            return 0;
        }
        self.ancestors(agent_id)
            .iter()
            .filter(|id| self.contains(id))
            .count()
    }

    /// Get all agents at a specific depth
    pub fn agents_at_depth(&self, depth: usize) -> Vec<String> {
        let mut ids: Vec<String> = self
            .nodes
            .keys()
            .filter(|id| self.depth(id) == depth)
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Agents without a registered parent
    pub fn roots(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.parent.as_deref().map_or(true, |p| !self.contains(p)))
            .map(|n| n.agent_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// All registered ids, sorted
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Render the subtree rooted at `agent_id` as indented lines
    pub fn render(&self, agent_id: &str, label: &dyn Fn(&str) -> String) -> String {
        let mut lines = Vec::new();
        self.render_node(agent_id, 0, label, &mut lines);
        lines.join("\n")
    }

    fn render_node(
        &self,
        agent_id: &str,
        indent: usize,
        label: &dyn Fn(&str) -> String,
        lines: &mut Vec<String>,
    ) {
        if indent > self.nodes.len() {
            return;
        }
        lines.push(format!("{}├─ {}", "  ".repeat(indent), label(agent_id)));
        for child_id in self.children(agent_id) {
            self.render_node(&child_id, indent + 1, label, lines);
        }
    }

    /// Get total agent count
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if hierarchy is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
