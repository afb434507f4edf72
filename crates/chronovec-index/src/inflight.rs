//! Process-global build state.
//!
//! Two deliberate globals live here. The bulk-insert thread pool is sized to
//! physical cores, not logical ones, to avoid memory-bandwidth thrashing on
//! hyperthreads. The in-flight insertion registry lets concurrent inserts
//! see each other as link candidates before their edges land in the graph;
//! it is scoped by index identity so co-existing indexes (e.g. during
//! compaction) never contaminate each other's candidate sets.

use chronovec_core::NodeId;
use dashmap::{DashMap, DashSet};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) static POOL: Lazy<rayon::ThreadPool> = Lazy::new(|| {
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_cpus::get_physical().max(1))
        .thread_name(|i| format!("chronovec-build-{i}"))
        .build()
        .expect("failed to build the bulk-insert thread pool")
});

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

static INFLIGHT: Lazy<DashMap<u64, Arc<DashSet<NodeId>>>> = Lazy::new(DashMap::new);

/// Fresh identity for a new index handle.
pub(crate) fn next_identity() -> u64 {
    NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed)
}

fn scope(identity: u64) -> Arc<DashSet<NodeId>> {
    INFLIGHT
        .entry(identity)
        .or_insert_with(|| Arc::new(DashSet::new()))
        .clone()
}

/// RAII registration of an in-flight insert.
pub(crate) struct InflightGuard {
    set: Arc<DashSet<NodeId>>,
    id: NodeId,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

pub(crate) fn register(identity: u64, id: NodeId) -> InflightGuard {
    let set = scope(identity);
    set.insert(id);
    InflightGuard { set, id }
}

/// Peers currently inserting into the same index, excluding `id` itself.
pub(crate) fn peers(identity: u64, id: NodeId) -> Vec<NodeId> {
    scope(identity)
        .iter()
        .map(|e| *e.key())
        .filter(|&p| p != id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_scoped_and_dropped() {
        let a = next_identity();
        let b = next_identity();

        let g1 = register(a, 1);
        let _g2 = register(a, 2);
        let _g3 = register(b, 9);

        let mut seen = peers(a, 2);
        seen.sort_unstable();
        assert_eq!(seen, vec![1]);
        assert_eq!(peers(b, 0), vec![9]);

        drop(g1);
        assert!(peers(a, 2).is_empty());
    }
}
