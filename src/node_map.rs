use std::collections::HashMap;
use std::sync::RwLock;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

/// Concurrent cache of the last-observed Node objects, keyed by node name.
///
/// The node watcher keeps two of these: one mirroring the informer's view of
/// the cluster, and one holding the last-seen copy so that a key missing from
/// the informer can still be resolved to the node that was deleted.
#[derive(Default)]
pub struct NodeMap {
    nodes: RwLock<HashMap<String, Node>>,
}

impl NodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_or_update(&self, node: &Node) {
        let mut nodes = self.nodes.write().unwrap();
        nodes.insert(node.name_any(), node.clone());
    }

    pub fn delete(&self, name: &str) {
        let mut nodes = self.nodes.write().unwrap();
        nodes.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<Node> {
        let nodes = self.nodes.read().unwrap();
        nodes.get(name).cloned()
    }

    /// Point-in-time copy of the cached Nodes.
    pub fn snapshot(&self) -> Vec<Node> {
        let nodes = self.nodes.read().unwrap();
        nodes.values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        let nodes = self.nodes.read().unwrap();
        nodes.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.into());
        node
    }

    #[test]
    fn add_get_delete_round_trip() {
        let map = NodeMap::new();
        map.add_or_update(&node("n1"));
        assert!(map.get("n1").is_some());

        map.delete("n1");
        assert!(map.get("n1").is_none());
    }

    #[test]
    fn snapshot_contains_every_node_once() {
        let map = NodeMap::new();
        map.add_or_update(&node("n1"));
        map.add_or_update(&node("n2"));
        map.add_or_update(&node("n1"));
        assert_eq!(map.snapshot().len(), 2);
    }
}
