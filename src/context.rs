//! Scoped key/value context shared by an agent tree
//!
//! Every entry has one owner and an immutable [`ContextScope`]. Reads are
//! checked against the hierarchy on every call, so the answer always reflects
//! the tree shape at the moment of the read.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hierarchy::AgentHierarchy;
use crate::Metadata;

/// Visibility of a context entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextScope {
    /// Only the owner
    Local,
    /// The owner and every agent the owner is an ancestor of.
    ///
    /// This resolves exactly like [`ContextScope::Subtree`]; it is not limited
    /// to direct children.
    Children,
    /// The owner and every agent the owner is an ancestor of
    Subtree,
    /// Every agent
    Global,
}

impl Default for ContextScope {
    fn default() -> Self {
        Self::Subtree
    }
}

/// A single entry in the shared context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub key: String,
    pub value: Value,
    pub scope: ContextScope,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Portable copy of everything one agent can see
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub agent_id: String,
    pub entries: BTreeMap<String, ContextEntry>,
    pub exported_at: DateTime<Utc>,
}

/// Check if an agent can read an entry
pub fn has_access(hierarchy: &AgentHierarchy, reader_id: &str, entry: &ContextEntry) -> bool {
    match entry.scope {
        ContextScope::Global => true,
        ContextScope::Local => reader_id == entry.owner_id,
        ContextScope::Children | ContextScope::Subtree => {
            reader_id == entry.owner_id || hierarchy.is_ancestor(&entry.owner_id, reader_id)
        }
    }
}

/// Key/value store with per-entry ownership and scope
#[derive(Debug, Default)]
pub struct ContextStore {
    entries: BTreeMap<String, ContextEntry>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update an entry.
    ///
    /// An update replaces the value, bumps `updated_at` and merges `metadata`;
    /// owner and scope stay as they were at creation. Ownership of the caller
    /// is not checked here. Returns `true` when the entry was created.
    pub fn set(
        &mut self,
        key: &str,
        value: Value,
        owner_id: &str,
        scope: ContextScope,
        metadata: Option<Metadata>,
    ) -> bool {
        let now = Utc::now();

        if let Some(entry) = self.entries.get_mut(key) {
            entry.value = value;
            entry.updated_at = now;
            if let Some(metadata) = metadata {
                entry.metadata.extend(metadata);
            }
            return false;
        }

        self.entries.insert(
            key.to_string(),
            ContextEntry {
                key: key.to_string(),
                value,
                scope,
                owner_id: owner_id.to_string(),
                created_at: now,
                updated_at: now,
                metadata: metadata.unwrap_or_default(),
            },
        );
        true
    }

    /// Visible value for `key`. Missing and hidden keys both yield `None`.
    pub fn get(&self, key: &str, reader_id: &str, hierarchy: &AgentHierarchy) -> Option<&Value> {
        self.entry(key, reader_id, hierarchy).map(|e| &e.value)
    }

    /// Visible entry for `key`, with ownership and timestamps
    pub fn entry(
        &self,
        key: &str,
        reader_id: &str,
        hierarchy: &AgentHierarchy,
    ) -> Option<&ContextEntry> {
        self.entries
            .get(key)
            .filter(|entry| has_access(hierarchy, reader_id, entry))
    }

    /// Entry for `key` regardless of visibility. Internal bookkeeping only.
    pub(crate) fn lookup(&self, key: &str) -> Option<&ContextEntry> {
        self.entries.get(key)
    }

    /// Every visible value, optionally restricted to one scope
    pub fn get_all(
        &self,
        reader_id: &str,
        scope_filter: Option<ContextScope>,
        hierarchy: &AgentHierarchy,
    ) -> BTreeMap<String, Value> {
        self.visible_entries(reader_id, hierarchy)
            .filter(|entry| scope_filter.map_or(true, |scope| entry.scope == scope))
            .map(|entry| (entry.key.clone(), entry.value.clone()))
            .collect()
    }

    fn visible_entries<'a>(
        &'a self,
        reader_id: &'a str,
        hierarchy: &'a AgentHierarchy,
    ) -> impl Iterator<Item = &'a ContextEntry> + 'a {
        self.entries
            .values()
            .filter(move |entry| has_access(hierarchy, reader_id, entry))
    }

    /// Delete an entry. Only the owner may delete; anything else returns `false`.
    pub fn delete(&mut self, key: &str, caller_id: &str) -> bool {
        match self.entries.get(key) {
            Some(entry) if entry.owner_id == caller_id => {
                self.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Drop every entry owned by one of `owners`, returning how many went
    pub fn purge_owned_by(&mut self, owners: &[String]) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !owners.iter().any(|owner| *owner == entry.owner_id));
        before - self.entries.len()
    }

    /// Snapshot of everything `agent_id` can see
    pub fn export(&self, agent_id: &str, hierarchy: &AgentHierarchy) -> ContextSnapshot {
        ContextSnapshot {
            agent_id: agent_id.to_string(),
            entries: self
                .visible_entries(agent_id, hierarchy)
                .map(|entry| (entry.key.clone(), entry.clone()))
                .collect(),
            exported_at: Utc::now(),
        }
    }

    /// Write a snapshot's entries with `agent_id` as owner, keeping their scopes
    pub fn import(&mut self, agent_id: &str, snapshot: &ContextSnapshot) -> usize {
        for (key, entry) in &snapshot.entries {
            let metadata = (!entry.metadata.is_empty()).then(|| entry.metadata.clone());
            self.set(key, entry.value.clone(), agent_id, entry.scope, metadata);
        }
        snapshot.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // R -> C1 -> G1, R -> C2
    fn tree() -> AgentHierarchy {
        let mut hierarchy = AgentHierarchy::new();
        hierarchy.register("R", None, Metadata::new());
        hierarchy.register("C1", Some("R"), Metadata::new());
        hierarchy.register("G1", Some("C1"), Metadata::new());
        hierarchy.register("C2", Some("R"), Metadata::new());
        hierarchy
    }

    // === Visibility Tests ===

    #[test]
    fn test_subtree_visible_to_descendants() {
        let hierarchy = tree();
        let mut store = ContextStore::new();
        store.set("x", json!(1), "R", ContextScope::Subtree, None);

        assert_eq!(store.get("x", "R", &hierarchy), Some(&json!(1)));
        assert_eq!(store.get("x", "G1", &hierarchy), Some(&json!(1)));
        assert_eq!(store.get("x", "C2", &hierarchy), Some(&json!(1)));
    }

    #[test]
    fn test_subtree_not_visible_upwards_or_sideways() {
        let hierarchy = tree();
        let mut store = ContextStore::new();
        store.set("plan", json!("draft"), "C1", ContextScope::Subtree, None);

        assert!(store.get("plan", "G1", &hierarchy).is_some());
        assert!(store.get("plan", "R", &hierarchy).is_none());
        assert!(store.get("plan", "C2", &hierarchy).is_none());
    }

    #[test]
    fn test_local_only_visible_to_owner() {
        let hierarchy = tree();
        let mut store = ContextStore::new();
        store.set("secret", json!(true), "R", ContextScope::Local, None);

        assert!(store.get("secret", "R", &hierarchy).is_some());
        assert!(store.get("secret", "C1", &hierarchy).is_none());
        assert!(store.get("secret", "G1", &hierarchy).is_none());
    }

    #[test]
    fn test_global_visible_to_everyone() {
        let hierarchy = tree();
        let mut store = ContextStore::new();
        store.set("motd", json!("hi"), "G1", ContextScope::Global, None);

        for reader in ["R", "C1", "G1", "C2", "unregistered"] {
            assert_eq!(store.get("motd", reader, &hierarchy), Some(&json!("hi")));
        }
    }

    /// Documents current behaviour: CHILDREN reaches grandchildren too, exactly
    /// like SUBTREE. It is not restricted to direct children.
    #[test]
    fn test_children_scope_resolves_like_subtree() {
        let hierarchy = tree();
        let mut store = ContextStore::new();
        store.set("c", json!(1), "R", ContextScope::Children, None);
        store.set("s", json!(2), "R", ContextScope::Subtree, None);

        for reader in ["R", "C1", "G1", "C2", "stranger"] {
            assert_eq!(
                store.get("c", reader, &hierarchy).is_some(),
                store.get("s", reader, &hierarchy).is_some(),
                "reader {reader}"
            );
        }
        assert!(store.get("c", "G1", &hierarchy).is_some());
    }

    #[test]
    fn test_missing_and_hidden_are_indistinguishable() {
        let hierarchy = tree();
        let mut store = ContextStore::new();
        store.set("hidden", json!(42), "C1", ContextScope::Local, None);

        assert_eq!(
            store.get("hidden", "C2", &hierarchy),
            store.get("never-set", "C2", &hierarchy)
        );
    }

    // === Set / Update Tests ===

    #[test]
    fn test_update_keeps_owner_and_scope() {
        let hierarchy = tree();
        let mut store = ContextStore::new();
        assert!(store.set("k", json!(1), "R", ContextScope::Local, None));
        let created = store.entry("k", "R", &hierarchy).unwrap().created_at;

        // Update from someone else is not rejected, but owner/scope don't change
        assert!(!store.set("k", json!(2), "C1", ContextScope::Global, None));

        let entry = store.entry("k", "R", &hierarchy).unwrap();
        assert_eq!(entry.value, json!(2));
        assert_eq!(entry.owner_id, "R");
        assert_eq!(entry.scope, ContextScope::Local);
        assert_eq!(entry.created_at, created);
        assert!(entry.updated_at >= created);
        assert!(store.get("k", "C1", &hierarchy).is_none());
    }

    #[test]
    fn test_update_merges_metadata() {
        let hierarchy = tree();
        let mut store = ContextStore::new();
        let mut first = Metadata::new();
        first.insert("a".into(), json!(1));
        let mut second = Metadata::new();
        second.insert("b".into(), json!(2));

        store.set("k", json!(0), "R", ContextScope::Global, Some(first));
        store.set("k", json!(0), "R", ContextScope::Global, Some(second));

        let metadata = &store.entry("k", "R", &hierarchy).unwrap().metadata;
        assert_eq!(metadata.len(), 2);
    }

    // === Get All Tests ===

    #[test]
    fn test_get_all_with_scope_filter() {
        let hierarchy = tree();
        let mut store = ContextStore::new();
        store.set("a", json!(1), "R", ContextScope::Subtree, None);
        store.set("b", json!(2), "R", ContextScope::Global, None);
        store.set("c", json!(3), "R", ContextScope::Local, None);
        store.set("d", json!(4), "C2", ContextScope::Subtree, None);

        let all = store.get_all("G1", None, &hierarchy);
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["a", "b"]);

        let global = store.get_all("G1", Some(ContextScope::Global), &hierarchy);
        assert_eq!(global.len(), 1);
        assert_eq!(global["b"], json!(2));
    }

    // === Delete Tests ===

    #[test]
    fn test_only_owner_can_delete() {
        let hierarchy = tree();
        let mut store = ContextStore::new();
        store.set("k", json!(1), "R", ContextScope::Global, None);

        assert!(!store.delete("k", "C1"));
        assert!(store.get("k", "C1", &hierarchy).is_some());
        assert!(store.delete("k", "R"));
        assert!(!store.delete("k", "R"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_purge_owned_by() {
        let mut store = ContextStore::new();
        store.set("a", json!(1), "C1", ContextScope::Global, None);
        store.set("b", json!(2), "G1", ContextScope::Global, None);
        store.set("c", json!(3), "R", ContextScope::Global, None);

        let purged = store.purge_owned_by(&["C1".to_string(), "G1".to_string()]);
        assert_eq!(purged, 2);
        assert_eq!(store.len(), 1);
    }

    // === Export / Import Tests ===

    #[test]
    fn test_export_only_visible_entries() {
        let hierarchy = tree();
        let mut store = ContextStore::new();
        store.set("mine", json!(1), "C1", ContextScope::Local, None);
        store.set("inherited", json!(2), "R", ContextScope::Subtree, None);
        store.set("cousin", json!(3), "C2", ContextScope::Local, None);

        let snapshot = store.export("C1", &hierarchy);
        assert_eq!(snapshot.agent_id, "C1");
        assert_eq!(
            snapshot.entries.keys().collect::<Vec<_>>(),
            vec!["inherited", "mine"]
        );
    }

    #[test]
    fn test_import_into_fresh_store_reproduces_visible_set() {
        let hierarchy = tree();
        let mut store = ContextStore::new();
        store.set("mine", json!({"n": 1}), "C1", ContextScope::Local, None);
        store.set("shared", json!([1, 2]), "C1", ContextScope::Subtree, None);
        store.set("everyone", json!("x"), "R", ContextScope::Global, None);

        let snapshot = store.export("C1", &hierarchy);
        let encoded = serde_json::to_string(&snapshot).unwrap();
        let decoded: ContextSnapshot = serde_json::from_str(&encoded).unwrap();

        let mut fresh = ContextStore::new();
        assert_eq!(fresh.import("C1", &decoded), 3);

        let original = store.export("C1", &hierarchy);
        let copied = fresh.export("C1", &hierarchy);
        for (key, entry) in &original.entries {
            let other = &copied.entries[key];
            assert_eq!(other.value, entry.value);
            assert_eq!(other.scope, entry.scope);
        }
        assert_eq!(original.entries.len(), copied.entries.len());
    }

    #[test]
    fn test_scope_serializes_lowercase() {
        assert_eq!(serde_json::to_value(ContextScope::Subtree).unwrap(), json!("subtree"));
        assert_eq!(ContextScope::default(), ContextScope::Subtree);
    }
}
