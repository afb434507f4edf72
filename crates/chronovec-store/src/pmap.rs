//! Persistent ordered map over the blob store.
//!
//! An immutable B+-tree: every node is a blob, every update path-copies the
//! touched nodes and publishes a new root address. Subtrees untouched since
//! a common ancestor are shared by address across commits, which is what
//! gives commits and forks their git-style structural sharing.
//!
//! Keys and values are strings; fixed-width hex encodings keep integer key
//! spaces correctly ordered.

use crate::blob::BlobStore;
use chronovec_core::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Max entries (leaf) or children (internal) before a split.
const MAX_FANOUT: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PNode {
    /// Leaf: the stored keys. Internal: separators, `seps[i]` is the
    /// smallest key under `children[i + 1]`.
    keys: Vec<String>,
    /// Leaf only, parallel to `keys`.
    #[serde(default)]
    vals: Vec<String>,
    /// Internal only: child node addresses.
    #[serde(default)]
    children: Vec<String>,
}

impl PNode {
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Child index to descend into for `key`.
    fn child_for(&self, key: &str) -> usize {
        self.keys.partition_point(|sep| sep.as_str() <= key)
    }
}

enum Applied {
    /// Subtree replaced by a single new node.
    Node(String),
    /// Subtree split: (left addr, separator = min key of right, right addr).
    Split(String, String, String),
    /// Key was absent on a remove.
    Unchanged,
}

/// A snapshot handle onto the tree. Cloning is O(1) and clones share the
/// node cache; mutation only moves the root of the handle it is called on.
#[derive(Clone)]
pub struct PersistentMap {
    root: Option<String>,
    store: Arc<dyn BlobStore>,
    cache: Arc<DashMap<String, Arc<PNode>>>,
}

impl std::fmt::Debug for PersistentMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentMap")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl PersistentMap {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            root: None,
            store,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Re-attaches to a previously persisted root. Nodes load lazily.
    pub fn from_root(store: Arc<dyn BlobStore>, root: Option<String>) -> Self {
        Self {
            root,
            store,
            cache: Arc::new(DashMap::new()),
        }
    }

    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    fn load(&self, addr: &str) -> Result<Arc<PNode>> {
        if let Some(hit) = self.cache.get(addr) {
            return Ok(hit.value().clone());
        }
        let bytes = self.store.get(addr)?.ok_or_else(|| {
            Error::corrupted(0, format!("map node {addr} missing from blob store"))
        })?;
        let node: PNode = serde_json::from_slice(&bytes)
            .map_err(|e| Error::corrupted(0, format!("map node {addr}: {e}")))?;
        let node = Arc::new(node);
        self.cache.insert(addr.to_string(), node.clone());
        Ok(node)
    }

    fn write(&self, node: PNode) -> Result<String> {
        let addr = format!("node/{}", Uuid::new_v4());
        let bytes = serde_json::to_vec(&node)
            .map_err(|e| Error::corrupted(0, format!("map node serialize: {e}")))?;
        self.store.put(&addr, &bytes)?;
        self.cache.insert(addr.clone(), Arc::new(node));
        Ok(addr)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let mut addr = match &self.root {
            Some(a) => a.clone(),
            None => return Ok(None),
        };
        loop {
            let node = self.load(&addr)?;
            if node.is_leaf() {
                return Ok(match node.keys.binary_search_by(|k| k.as_str().cmp(key)) {
                    Ok(i) => Some(node.vals[i].clone()),
                    Err(_) => None,
                });
            }
            addr = node.children[node.child_for(key)].clone();
        }
    }

    /// Inserts or replaces. Publishes a new root; the old tree stays intact.
    pub fn insert(&mut self, key: &str, val: &str) -> Result<()> {
        match self.root.clone() {
            None => {
                let leaf = PNode {
                    keys: vec![key.to_string()],
                    vals: vec![val.to_string()],
                    children: Vec::new(),
                };
                self.root = Some(self.write(leaf)?);
                Ok(())
            }
            Some(root) => {
                match self.insert_into(&root, key, val)? {
                    Applied::Node(addr) => {
                        self.root = Some(addr);
                        Ok(())
                    }
                    Applied::Split(left, sep, right) => {
                        let new_root = PNode {
                            keys: vec![sep],
                            vals: Vec::new(),
                            children: vec![left, right],
                        };
                        self.root = Some(self.write(new_root)?);
                        Ok(())
                    }
                    Applied::Unchanged => unreachable!("insert never reports Unchanged"),
                }
            }
        }
    }

    fn insert_into(&self, addr: &str, key: &str, val: &str) -> Result<Applied> {
        let node = self.load(addr)?;
        if node.is_leaf() {
            let mut next = (*node).clone();
            match next.keys.binary_search_by(|k| k.as_str().cmp(key)) {
                Ok(i) => next.vals[i] = val.to_string(),
                Err(i) => {
                    next.keys.insert(i, key.to_string());
                    next.vals.insert(i, val.to_string());
                }
            }
            return self.finish_leaf(next);
        }

        let idx = node.child_for(key);
        let child_addr = node.children[idx].clone();
        let mut next = (*node).clone();
        match self.insert_into(&child_addr, key, val)? {
            Applied::Node(new_child) => {
                next.children[idx] = new_child;
            }
            Applied::Split(left, sep, right) => {
                next.children[idx] = left;
                next.keys.insert(idx, sep);
                next.children.insert(idx + 1, right);
            }
            Applied::Unchanged => unreachable!(),
        }
        self.finish_internal(next)
    }

    fn finish_leaf(&self, node: PNode) -> Result<Applied> {
        if node.keys.len() <= MAX_FANOUT {
            return Ok(Applied::Node(self.write(node)?));
        }
        let mid = node.keys.len() / 2;
        let right = PNode {
            keys: node.keys[mid..].to_vec(),
            vals: node.vals[mid..].to_vec(),
            children: Vec::new(),
        };
        let left = PNode {
            keys: node.keys[..mid].to_vec(),
            vals: node.vals[..mid].to_vec(),
            children: Vec::new(),
        };
        let sep = right.keys[0].clone();
        Ok(Applied::Split(self.write(left)?, sep, self.write(right)?))
    }

    fn finish_internal(&self, node: PNode) -> Result<Applied> {
        if node.children.len() <= MAX_FANOUT {
            return Ok(Applied::Node(self.write(node)?));
        }
        let mid = node.children.len() / 2;
        let sep = node.keys[mid - 1].clone();
        let left = PNode {
            keys: node.keys[..mid - 1].to_vec(),
            vals: Vec::new(),
            children: node.children[..mid].to_vec(),
        };
        let right = PNode {
            keys: node.keys[mid..].to_vec(),
            vals: Vec::new(),
            children: node.children[mid..].to_vec(),
        };
        Ok(Applied::Split(self.write(left)?, sep, self.write(right)?))
    }

    /// Removes a key. Underfull nodes are tolerated (removals are rare
    /// relative to inserts); an empty root collapses to the empty map.
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        let Some(root) = self.root.clone() else {
            return Ok(false);
        };
        match self.remove_from(&root, key)? {
            Applied::Unchanged => Ok(false),
            Applied::Node(addr) => {
                let node = self.load(&addr)?;
                if node.is_leaf() && node.keys.is_empty() {
                    self.root = None;
                } else if !node.is_leaf() && node.children.len() == 1 {
                    self.root = Some(node.children[0].clone());
                } else {
                    self.root = Some(addr);
                }
                Ok(true)
            }
            Applied::Split(..) => unreachable!("remove never splits"),
        }
    }

    fn remove_from(&self, addr: &str, key: &str) -> Result<Applied> {
        let node = self.load(addr)?;
        if node.is_leaf() {
            return match node.keys.binary_search_by(|k| k.as_str().cmp(key)) {
                Err(_) => Ok(Applied::Unchanged),
                Ok(i) => {
                    let mut next = (*node).clone();
                    next.keys.remove(i);
                    next.vals.remove(i);
                    Ok(Applied::Node(self.write(next)?))
                }
            };
        }

        let idx = node.child_for(key);
        match self.remove_from(&node.children[idx], key)? {
            Applied::Unchanged => Ok(Applied::Unchanged),
            Applied::Node(new_child) => {
                let child = self.load(&new_child)?;
                let mut next = (*node).clone();
                if child.is_leaf() && child.keys.is_empty() && next.children.len() > 1 {
                    // Drop the emptied leaf entirely.
                    next.children.remove(idx);
                    if idx == 0 {
                        next.keys.remove(0);
                    } else {
                        next.keys.remove(idx - 1);
                    }
                } else {
                    next.children[idx] = new_child;
                }
                Ok(Applied::Node(self.write(next)?))
            }
            Applied::Split(..) => unreachable!(),
        }
    }

    /// In-order key/value pairs. The maps this index persists are either
    /// bounded by chunk counts or hydrated wholesale on load, so a full
    /// materialized walk is acceptable.
    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            self.walk(root, &mut out)?;
        }
        Ok(out)
    }

    fn walk(&self, addr: &str, out: &mut Vec<(String, String)>) -> Result<()> {
        let node = self.load(addr)?;
        if node.is_leaf() {
            for (k, v) in node.keys.iter().zip(&node.vals) {
                out.push((k.clone(), v.clone()));
            }
            return Ok(());
        }
        for child in &node.children {
            self.walk(child, out)?;
        }
        Ok(())
    }

    /// Entries whose key starts with `prefix`.
    pub fn entries_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .collect())
    }

    /// Adds every node address reachable from the root to `out`.
    /// Used by GC marking; values that are themselves blob addresses are
    /// the caller's responsibility.
    pub fn collect_node_addrs(&self, out: &mut HashSet<String>) -> Result<()> {
        if let Some(root) = &self.root {
            self.collect_from(root, out)?;
        }
        Ok(())
    }

    fn collect_from(&self, addr: &str, out: &mut HashSet<String>) -> Result<()> {
        if !out.insert(addr.to_string()) {
            return Ok(());
        }
        let node = self.load(addr)?;
        for child in &node.children {
            self.collect_from(child, out)?;
        }
        Ok(())
    }
}

/// Fixed-width hex rendering of a u64 key, ordering-compatible with the
/// numeric value.
pub fn hex_key(v: u64) -> String {
    format!("{v:016x}")
}
