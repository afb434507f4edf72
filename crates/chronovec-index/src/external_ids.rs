//! Bidirectional external-ID index.
//!
//! External ids are opaque strings chosen by the caller; internal ids are
//! the dense node ids the graph runs on. Both directions live in concurrent
//! maps; dirty-key sets record what must be flushed into the persistent
//! maps at the next sync.

use chronovec_core::NodeId;
use dashmap::{DashMap, DashSet};

#[derive(Debug, Default)]
pub(crate) struct ExternalIds {
    fwd: DashMap<String, NodeId>,
    rev: DashMap<NodeId, String>,
    /// External keys inserted or removed since the last sync.
    dirty: DashSet<String>,
    /// Internal ids whose reverse entry changed since the last sync.
    rev_dirty: DashSet<NodeId>,
}

impl ExternalIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `external -> id` in both directions. Returns the previously
    /// mapped internal id, if any (the caller upserts on duplicates).
    pub fn insert(&self, external: &str, id: NodeId) -> Option<NodeId> {
        let old = self.fwd.insert(external.to_string(), id);
        if let Some(old_id) = old {
            self.rev.remove(&old_id);
            self.rev_dirty.insert(old_id);
        }
        self.rev.insert(id, external.to_string());
        self.dirty.insert(external.to_string());
        self.rev_dirty.insert(id);
        old
    }

    /// Removes a mapping by external id.
    pub fn remove(&self, external: &str) -> Option<NodeId> {
        let (_, id) = self.fwd.remove(external)?;
        self.rev.remove(&id);
        self.dirty.insert(external.to_string());
        self.rev_dirty.insert(id);
        Some(id)
    }

    pub fn get(&self, external: &str) -> Option<NodeId> {
        self.fwd.get(external).map(|e| *e.value())
    }

    pub fn external_of(&self, id: NodeId) -> Option<String> {
        self.rev.get(&id).map(|e| e.value().clone())
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.rev.contains_key(&id)
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.fwd.len()
    }

    /// Internal ids of all mapped (live) nodes.
    pub fn live_nodes(&self) -> Vec<NodeId> {
        self.rev.iter().map(|e| *e.key()).collect()
    }

    pub fn dirty_is_empty(&self) -> bool {
        self.dirty.is_empty() && self.rev_dirty.is_empty()
    }

    pub fn drain_dirty(&self) -> (Vec<String>, Vec<NodeId>) {
        let ext: Vec<String> = self.dirty.iter().map(|e| e.key().clone()).collect();
        for k in &ext {
            self.dirty.remove(k);
        }
        let rev: Vec<NodeId> = self.rev_dirty.iter().map(|e| *e.key()).collect();
        for k in &rev {
            self.rev_dirty.remove(k);
        }
        (ext, rev)
    }

    /// Independent copy for forks. Dirty sets carry over so un-synced
    /// mappings are not lost on the fork's first sync.
    pub fn deep_clone(&self) -> Self {
        let clone = Self::new();
        for e in &self.fwd {
            clone.fwd.insert(e.key().clone(), *e.value());
        }
        for e in &self.rev {
            clone.rev.insert(*e.key(), e.value().clone());
        }
        for e in self.dirty.iter() {
            clone.dirty.insert(e.clone());
        }
        for e in self.rev_dirty.iter() {
            clone.rev_dirty.insert(*e);
        }
        clone
    }

    /// Load-time hydration; does not mark dirty.
    pub fn hydrate(&self, external: String, id: NodeId) {
        self.rev.insert(id, external.clone());
        self.fwd.insert(external, id);
    }
}
