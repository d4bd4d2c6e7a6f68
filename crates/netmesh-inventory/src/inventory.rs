use std::collections::HashMap;
use std::sync::Mutex;

use netmesh_types::NodeRecord;

type IsSelf = Box<dyn Fn(&NodeRecord) -> bool + Send + Sync>;

struct State {
    nodes: HashMap<String, NodeRecord>,
    version: u64,
    ready: bool,
    self_name: Option<String>,
}

/// Concurrent in-memory map of cluster nodes, keyed by name.
///
/// All mutating operations take the single internal lock for their
/// entire duration; none of them perform I/O, so the lock is never
/// held across an await point by callers that go through this type.
pub struct Inventory {
    state: Mutex<State>,
    is_self: IsSelf,
}

/// Point-in-time, by-value copy of the inventory.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub self_node: Option<NodeRecord>,
    pub nodes: HashMap<String, NodeRecord>,
    pub version: u64,
}

impl Inventory {
    pub fn new(is_self: impl Fn(&NodeRecord) -> bool + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(State {
                nodes: HashMap::new(),
                version: 0,
                ready: false,
                self_name: None,
            }),
            is_self: Box::new(is_self),
        }
    }

    /// Upserts `node`. Returns whether any observable field changed.
    /// Binds the self pointer the first time a node matches the
    /// predicate; later matches never re-bind it.
    pub fn update_node(&self, node: NodeRecord) -> bool {
        let mut state = self.state.lock().unwrap();
        let changed = match state.nodes.get(&node.name) {
            Some(existing) => existing != &node,
            None => true,
        };

        if state.self_name.is_none() && (self.is_self)(&node) {
            state.self_name = Some(node.name.clone());
        }

        state.nodes.insert(node.name.clone(), node);
        if changed {
            state.version += 1;
        }
        changed
    }

    /// Deletes the record if present. Increments the version
    /// unconditionally on a successful delete; a delete of a missing
    /// name is a no-op and does not bump the version.
    pub fn remove_node(&self, name: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let removed = state.nodes.remove(name).is_some();
        if removed {
            state.version += 1;
        }
        removed
    }

    /// Atomically upserts every member of `list` and deletes any
    /// record not present in it.
    pub fn replace_all(&self, list: Vec<NodeRecord>) {
        let mut state = self.state.lock().unwrap();
        let incoming: HashMap<String, NodeRecord> =
            list.into_iter().map(|n| (n.name.clone(), n)).collect();

        let changed = state.nodes != incoming;

        for node in incoming.values() {
            if state.self_name.is_none() && (self.is_self)(node) {
                state.self_name = Some(node.name.clone());
            }
        }

        if changed {
            state.nodes = incoming;
            state.version += 1;
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock().unwrap();
        let self_node = state
            .self_name
            .as_ref()
            .and_then(|name| state.nodes.get(name))
            .cloned();
        Snapshot {
            self_node,
            nodes: state.nodes.clone(),
            version: state.version,
        }
    }

    pub fn is_version(&self, v: u64) -> bool {
        self.state.lock().unwrap().version == v
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap().ready
    }

    pub fn mark_ready(&self) {
        self.state.lock().unwrap().ready = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeRecord {
        NodeRecord::new(name)
    }

    #[test]
    fn remove_on_missing_name_does_not_bump_version() {
        let inv = Inventory::new(|_| false);
        inv.update_node(node("a"));
        let before = inv.snapshot().version;
        assert!(!inv.remove_node("missing"));
        assert_eq!(inv.snapshot().version, before);
    }

    #[test]
    fn self_binding_is_write_once() {
        let inv = Inventory::new(|n| n.name == "a" || n.name == "b");
        inv.update_node(node("a"));
        inv.update_node(node("b"));
        assert_eq!(inv.snapshot().self_node.unwrap().name, "a");
    }

    #[test]
    fn replace_all_full_list_semantics() {
        let inv = Inventory::new(|_| false);
        inv.update_node(node("a"));
        inv.update_node(node("b"));
        inv.replace_all(vec![node("b"), node("c")]);
        let snap = inv.snapshot();
        let mut names: Vec<_> = snap.nodes.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn version_never_decreases_across_mixed_ops() {
        let inv = Inventory::new(|_| false);
        let mut last = inv.snapshot().version;
        inv.update_node(node("a"));
        assert!(inv.snapshot().version >= last);
        last = inv.snapshot().version;
        assert!(!inv.remove_node("nope"));
        assert_eq!(inv.snapshot().version, last);
        inv.remove_node("a");
        assert!(inv.snapshot().version >= last);
    }

    #[test]
    fn ready_flag_is_sticky() {
        let inv = Inventory::new(|_| false);
        assert!(!inv.is_ready());
        inv.mark_ready();
        assert!(inv.is_ready());
        inv.update_node(node("a"));
        assert!(inv.is_ready());
    }
}
