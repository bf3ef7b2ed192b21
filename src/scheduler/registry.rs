use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A managed machine known to the queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: String,
    pub hostname: Option<String>,
    pub groups: BTreeSet<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl NodeRecord {
    pub fn new(id: String) -> Self {
        Self {
            id,
            hostname: None,
            groups: BTreeSet::new(),
            registered_at: Utc::now(),
            last_seen: None,
        }
    }

    /// A node is stale when it has not polled within `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        match self.last_seen {
            Some(seen) => now - seen > threshold,
            None => true,
        }
    }
}

/// Nodes and their group memberships.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, NodeRecord>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node or replace its hostname and group memberships.
    pub fn upsert_node(&mut self, node_id: &str, hostname: Option<String>, groups: Vec<String>) {
        let node = self
            .nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeRecord::new(node_id.to_string()));
        if hostname.is_some() {
            node.hostname = hostname;
        }
        node.groups = groups
            .into_iter()
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .collect();
        tracing::info!(node_id, groups = ?node.groups, "Node registered");
    }

    pub fn add_to_group(&mut self, node_id: &str, group_id: &str) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(node) => node.groups.insert(group_id.to_string()),
            None => false,
        }
    }

    /// Record a poll from a node. Unknown nodes are registered on first sight.
    pub fn touch(&mut self, node_id: &str) {
        let node = self
            .nodes
            .entry(node_id.to_string())
            .or_insert_with(|| {
                tracing::info!(node_id, "Auto-registering node on first poll");
                NodeRecord::new(node_id.to_string())
            });
        node.last_seen = Some(Utc::now());
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeRecord> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// All node ids, sorted.
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Current members of a group, sorted.
    pub fn group_members(&self, group_id: &str) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.groups.contains(group_id))
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn all_nodes(&self) -> Vec<&NodeRecord> {
        self.nodes.values().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_replaces_groups() {
        let mut registry = NodeRegistry::new();
        registry.upsert_node("n1", Some("host-1".to_string()), vec!["a".into(), "b".into()]);
        assert_eq!(registry.group_members("a"), vec!["n1".to_string()]);

        registry.upsert_node("n1", None, vec!["b".into()]);
        assert!(registry.group_members("a").is_empty());
        assert_eq!(registry.get("n1").unwrap().hostname.as_deref(), Some("host-1"));
    }

    #[test]
    fn touch_auto_registers_and_marks_seen() {
        let mut registry = NodeRegistry::new();
        registry.touch("fresh");
        let node = registry.get("fresh").unwrap();
        assert!(node.last_seen.is_some());
        assert!(!node.is_stale(Utc::now(), chrono::Duration::minutes(1)));
    }

    #[test]
    fn never_seen_node_is_stale() {
        let node = NodeRecord::new("n".to_string());
        assert!(node.is_stale(Utc::now(), chrono::Duration::days(365)));
    }

    #[test]
    fn add_to_group_requires_known_node() {
        let mut registry = NodeRegistry::new();
        assert!(!registry.add_to_group("ghost", "g"));
        registry.upsert_node("n1", None, vec![]);
        assert!(registry.add_to_group("n1", "g"));
        assert_eq!(registry.group_members("g"), vec!["n1".to_string()]);
    }
}
