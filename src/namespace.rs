//! Namespace configuration index.
//!
//! Namespace nodes are held in an id-keyed arena; a node references its
//! parent by name, resolved through the lookup table, so ownership stays
//! acyclic. Tree walks are bounded by a visited-set guard in case the
//! configuration smuggles in a cycle.

use std::collections::{HashMap, HashSet};

use crate::config::{Config, NamespaceKind};
use crate::error::{Result, UnshubError};
use crate::models::HierarchicalPath;

/// A resolved namespace node.
#[derive(Debug, Clone)]
pub struct NamespaceNode {
    pub name: String,
    pub kind: NamespaceKind,
    pub path: HierarchicalPath,
    /// Parent node name; resolved by lookup, never a direct pointer.
    pub parent: Option<String>,
    pub allow_topics: bool,
}

/// Arena of namespace nodes with a secondary index by serialized path.
#[derive(Debug, Default)]
pub struct NamespaceIndex {
    nodes: HashMap<String, NamespaceNode>,
    by_path: HashMap<String, String>,
}

impl NamespaceIndex {
    /// Build the index from configuration, validating every node path
    /// against the active hierarchy and every parent reference.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut index = Self::default();

        for ns in &config.namespaces {
            let segments: Vec<String> = ns
                .path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            let path = HierarchicalPath::from_segments(&config.hierarchy.levels, &segments)?;

            if index.nodes.contains_key(&ns.name) {
                return Err(UnshubError::Validation(format!(
                    "duplicate namespace node '{}'",
                    ns.name
                )));
            }
            index.by_path.insert(path.to_ns_path(), ns.name.clone());
            index.nodes.insert(
                ns.name.clone(),
                NamespaceNode {
                    name: ns.name.clone(),
                    kind: ns.kind,
                    path,
                    parent: ns.parent.clone(),
                    allow_topics: ns.allow_topics,
                },
            );
        }

        // Parent references must resolve inside the arena.
        for node in index.nodes.values() {
            if let Some(parent) = &node.parent {
                if !index.nodes.contains_key(parent) {
                    return Err(UnshubError::Validation(format!(
                        "namespace '{}' references unknown parent '{}'",
                        node.name, parent
                    )));
                }
            }
        }

        Ok(index)
    }

    pub fn get(&self, name: &str) -> Option<&NamespaceNode> {
        self.nodes.get(name)
    }

    /// Node anchored exactly at `path`, if any.
    pub fn node_at(&self, path: &HierarchicalPath) -> Option<&NamespaceNode> {
        self.by_path
            .get(&path.to_ns_path())
            .and_then(|name| self.nodes.get(name))
    }

    /// Whether raw topics may be auto-assigned at `path`. A path with no
    /// configured node does not allow topics.
    pub fn allows_topics(&self, path: &HierarchicalPath) -> bool {
        self.node_at(path).map(|n| n.allow_topics).unwrap_or(false)
    }

    /// Walk the parent chain of `name`, cycle-guarded.
    pub fn ancestors(&self, name: &str) -> Vec<&NamespaceNode> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut current = self.nodes.get(name).and_then(|n| n.parent.as_deref());
        while let Some(parent) = current {
            if !visited.insert(parent) {
                break; // cycle
            }
            match self.nodes.get(parent) {
                Some(node) => {
                    out.push(node);
                    current = node.parent.as_deref();
                }
                None => break,
            }
        }
        out
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
    use crate::config::{HierarchyConfig, MappingConfig, NamespaceNodeConfig};

    fn config(namespaces: Vec<NamespaceNodeConfig>) -> Config {
        Config {
            hierarchy: HierarchyConfig {
                levels: vec!["Enterprise".into(), "Site".into(), "Area".into()],
            },
            namespaces,
            mapping: MappingConfig::default(),
            historical: Default::default(),
            cache: Default::default(),
            connections: vec![],
        }
    }

    fn node(name: &str, path: &str, parent: Option<&str>, allow: bool) -> NamespaceNodeConfig {
        NamespaceNodeConfig {
            name: name.into(),
            kind: NamespaceKind::Functional,
            path: path.into(),
            parent: parent.map(String::from),
            allow_topics: allow,
        }
    }

    #[test]
    fn test_path_lookup_and_allow_topics() {
        let index = NamespaceIndex::from_config(&config(vec![
            node("dallas", "Acme/Dallas", None, false),
            node("press", "Acme/Dallas/Press", Some("dallas"), true),
        ]))
        .unwrap();

        let levels: Vec<String> = vec!["Enterprise".into(), "Site".into(), "Area".into()];
        let press =
            HierarchicalPath::from_segments(&levels, &["Acme".into(), "Dallas".into(), "Press".into()])
                .unwrap();
        let dallas =
            HierarchicalPath::from_segments(&levels, &["Acme".into(), "Dallas".into()]).unwrap();
        let unknown =
            HierarchicalPath::from_segments(&levels, &["Acme".into(), "Austin".into()]).unwrap();

        assert!(index.allows_topics(&press));
        assert!(!index.allows_topics(&dallas));
        assert!(!index.allows_topics(&unknown));
        assert_eq!(index.node_at(&press).unwrap().name, "press");
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let err = NamespaceIndex::from_config(&config(vec![node(
            "orphan",
            "Acme/Dallas",
            Some("missing"),
            true,
        )]))
        .unwrap_err();
        assert!(matches!(err, UnshubError::Validation(_)));
    }

    #[test]
    fn test_ancestor_walk_is_cycle_guarded() {
        // A cyclic parent chain must terminate instead of looping.
        let index = NamespaceIndex::from_config(&config(vec![
            node("a", "Acme", Some("b"), false),
            node("b", "Acme/Dallas", Some("a"), false),
        ]))
        .unwrap();
        let ancestors = index.ancestors("a");
        assert!(ancestors.len() <= 2);
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let err = NamespaceIndex::from_config(&config(vec![
            node("dup", "Acme", None, false),
            node("dup", "Acme/Dallas", None, false),
        ]))
        .unwrap_err();
        assert!(matches!(err, UnshubError::Validation(_)));
    }
}
