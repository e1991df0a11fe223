use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::supervisor::registry::Registry;

/// One register entry: which node holds the name, stamped for conflict
/// resolution. A `None` holder is a tombstone left by unregister.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub holder: Option<String>,
    pub stamp_millis: i64,
    pub writer: String,
}

impl Placement {
    /// Last write wins; equal stamps break toward the greater writer id so
    /// every node resolves a conflict the same way.
    fn supersedes(&self, other: &Placement) -> bool {
        (self.stamp_millis, self.writer.as_str()) > (other.stamp_millis, other.writer.as_str())
    }
}

/// Replicated last-write-wins map of worker placements.
///
/// `merge` is commutative, associative and idempotent, so nodes converge no
/// matter how partition heal replays states.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LwwMap {
    entries: HashMap<String, Placement>,
}

impl LwwMap {
    pub fn set(&mut self, name: &str, holder: Option<String>, writer: &str) {
        self.entries.insert(
            name.to_string(),
            Placement {
                holder,
                stamp_millis: Utc::now().timestamp_millis(),
                writer: writer.to_string(),
            },
        );
    }

    pub fn holder(&self, name: &str) -> Option<&str> {
        self.entries.get(name).and_then(|p| p.holder.as_deref())
    }

    pub fn merge(&mut self, remote: &LwwMap) {
        for (name, incoming) in &remote.entries {
            match self.entries.get(name) {
                Some(current) if !incoming.supersedes(current) => {}
                _ => {
                    self.entries.insert(name.clone(), incoming.clone());
                }
            }
        }
    }

    pub fn live_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, p)| p.holder.is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Transport used to exchange registry state between nodes. The production
/// deployment wires this to its gossip layer; tests use a loopback pair.
pub trait Transport: Send + Sync {
    fn publish(&self, state: &LwwMap);
}

/// No-peer transport for a cluster of one.
pub struct NullTransport;

impl Transport for NullTransport {
    fn publish(&self, _state: &LwwMap) {}
}

/// Cluster-wide registry: a local LWW replica plus a transport.
///
/// Leadership is not involved in cluster mode; every node hosts workers and
/// this map keeps each repository placed at most once. Brief duplication
/// during partition heal resolves to the last writer.
pub struct ClusterRegistry {
    node: String,
    state: Mutex<LwwMap>,
    transport: Box<dyn Transport>,
}

impl ClusterRegistry {
    pub fn new(node: String, transport: Box<dyn Transport>) -> Self {
        ClusterRegistry {
            node,
            state: Mutex::new(LwwMap::default()),
            transport,
        }
    }

    /// Fold a remote replica's state into ours.
    pub fn absorb(&self, remote: &LwwMap) {
        let mut state = self.state.lock().unwrap();
        state.merge(remote);
    }

    pub fn snapshot(&self) -> LwwMap {
        self.state.lock().unwrap().clone()
    }
}

impl Registry for ClusterRegistry {
    fn register(&self, name: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(holder) = state.holder(name) {
            if holder != self.node {
                debug!(name, holder, "name already placed on another node");
                return false;
            }
            return false;
        }
        state.set(name, Some(self.node.clone()), &self.node);
        self.transport.publish(&state);
        true
    }

    fn unregister(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if state.holder(name) == Some(self.node.as_str()) {
            state.set(name, None, &self.node);
            self.transport.publish(&state);
        }
    }

    fn is_registered(&self, name: &str) -> bool {
        self.state.lock().unwrap().holder(name).is_some()
    }

    fn list(&self) -> Vec<String> {
        self.state.lock().unwrap().live_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placement(holder: Option<&str>, stamp: i64, writer: &str) -> Placement {
        Placement {
            holder: holder.map(str::to_string),
            stamp_millis: stamp,
            writer: writer.to_string(),
        }
    }

    #[test]
    fn merge_keeps_latest_writer() {
        let mut a = LwwMap::default();
        a.entries.insert("acme".into(), placement(Some("node-a"), 10, "node-a"));
        let mut b = LwwMap::default();
        b.entries.insert("acme".into(), placement(Some("node-b"), 20, "node-b"));

        a.merge(&b);
        assert_eq!(a.holder("acme"), Some("node-b"));

        // Replaying the older state changes nothing.
        let mut stale = LwwMap::default();
        stale.entries.insert("acme".into(), placement(Some("node-a"), 10, "node-a"));
        a.merge(&stale);
        assert_eq!(a.holder("acme"), Some("node-b"));
    }

    #[test]
    fn merge_ties_break_deterministically() {
        let left = placement(Some("node-a"), 10, "node-a");
        let right = placement(Some("node-b"), 10, "node-b");

        let mut one = LwwMap::default();
        one.entries.insert("acme".into(), left.clone());
        let mut two = LwwMap::default();
        two.entries.insert("acme".into(), right.clone());

        let mut merged_ab = one.clone();
        merged_ab.merge(&two);
        let mut merged_ba = two;
        merged_ba.merge(&one);
        assert_eq!(merged_ab.holder("acme"), merged_ba.holder("acme"));
    }

    #[test]
    fn tombstone_frees_the_name_everywhere() {
        let registry_a = ClusterRegistry::new("node-a".into(), Box::new(NullTransport));
        let registry_b = ClusterRegistry::new("node-b".into(), Box::new(NullTransport));

        assert!(registry_a.register("acme"));
        registry_b.absorb(&registry_a.snapshot());
        assert!(!registry_b.register("acme"));

        registry_a.unregister("acme");
        registry_b.absorb(&registry_a.snapshot());
        assert!(!registry_b.is_registered("acme"));
        assert!(registry_b.register("acme"));
    }

    #[test]
    fn cannot_double_register_locally() {
        let registry = ClusterRegistry::new("node-a".into(), Box::new(NullTransport));
        assert!(registry.register("acme"));
        assert!(!registry.register("acme"));
    }
}
