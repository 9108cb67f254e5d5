//! Node identity directory
//!
//! The topology engine resolves display names and positions through the
//! [`NodeDirectory`] trait. [`MemoryDirectory`] is the built-in
//! implementation, fed by the ingest worker from position and node-info
//! packets.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;

use super::node_id::NodeId;
use super::packet::Position;

/// What the directory knows about a node
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeIdentity {
    pub display_name: Option<String>,
    pub position: Option<Position>,
}

/// Read-only lookup of node identities
pub trait NodeDirectory: Send + Sync {
    fn resolve(&self, node: NodeId) -> Option<NodeIdentity>;
}

/// In-memory directory
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    nodes: RwLock<HashMap<NodeId, NodeIdentity>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a display name; long name preferred over short name
    pub fn set_name(&self, node: NodeId, long_name: Option<&str>, short_name: Option<&str>) {
        let name = [long_name, short_name]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|n| !n.is_empty());
        let Some(name) = name else {
            return;
        };
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.entry(node).or_default().display_name = Some(name.to_string());
    }

    /// Record a position; positions without a fix are ignored
    pub fn set_position(&self, node: NodeId, position: Position) {
        if !position.is_valid() {
            return;
        }
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.entry(node).or_default().position = Some(position);
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NodeDirectory for MemoryDirectory {
    fn resolve(&self, node: NodeId) -> Option<NodeIdentity> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&node)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u32) -> NodeId {
        NodeId::new(n).unwrap()
    }

    #[test]
    fn test_unknown_node() {
        let dir = MemoryDirectory::new();
        assert!(dir.resolve(node(1)).is_none());
        assert!(dir.is_empty());
    }

    #[test]
    fn test_name_and_position_merge() {
        let dir = MemoryDirectory::new();
        dir.set_name(node(1), None, Some("ABCD"));
        dir.set_name(node(1), Some("Hilltop Relay"), Some("HTR"));
        dir.set_position(node(1), Position { latitude: 47.0, longitude: 8.0, altitude: Some(900.0) });

        let identity = dir.resolve(node(1)).unwrap();
        assert_eq!(identity.display_name.as_deref(), Some("Hilltop Relay"));
        assert_eq!(identity.position.unwrap().latitude, 47.0);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_ignores_blank_names_and_null_island() {
        let dir = MemoryDirectory::new();
        dir.set_name(node(1), Some("  "), None);
        dir.set_position(node(1), Position { latitude: 0.0, longitude: 0.0, altitude: None });
        assert!(dir.resolve(node(1)).is_none());
    }
}
