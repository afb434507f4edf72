//! Mark-and-sweep garbage collection over the blob store.
//!
//! Mark: from every branch head, walk the commit DAG through parents and
//! collect everything reachable: commit records, map nodes of the four
//! persistent maps, edge/vector chunk blobs, deleted bitsets. Sweep: delete
//! unreachable blobs older than the `remove_before` cutoff. Young blobs are
//! always preserved, which keeps an in-flight sync's freshly written (not
//! yet referenced) blobs safe.

use crate::commit::{commit_key, load_commit_record};
use crate::VectorIndex;
use chronovec_core::Result;
use chronovec_store::{BlobStore, PersistentMap, ROOTS_KEY};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Reachable blobs.
    pub marked: usize,
    /// Unreachable blobs deleted.
    pub swept: usize,
    /// Unreachable blobs kept because they are younger than the cutoff.
    pub kept_young: usize,
}

impl VectorIndex {
    /// Collects garbage in this index's blob store. The caller picks
    /// `remove_before`; anything newer survives even when unreachable.
    pub fn gc(&self, remove_before: SystemTime) -> Result<GcStats> {
        collect_garbage(&self.blobs, remove_before)
    }
}

pub fn collect_garbage(
    blobs: &Arc<dyn BlobStore>,
    remove_before: SystemTime,
) -> Result<GcStats> {
    let mut marked: HashSet<String> = HashSet::new();

    let (_, branch_roots) = crate::commit::read_branch_roots(blobs)?;
    let mut queue: VecDeque<Uuid> = branch_roots.branches.values().copied().collect();
    let mut visited: HashSet<Uuid> = HashSet::new();

    while let Some(commit_id) = queue.pop_front() {
        if !visited.insert(commit_id) {
            continue;
        }
        let record = load_commit_record(blobs, commit_id)?;
        marked.insert(commit_key(commit_id));
        if let Some(key) = &record.deleted_blob {
            marked.insert(key.clone());
        }

        for root in [
            &record.edges_root,
            &record.vectors_root,
            &record.metadata_root,
            &record.external_root,
        ] {
            let map = PersistentMap::from_root(blobs.clone(), root.clone());
            map.collect_node_addrs(&mut marked)?;
        }

        // Chunk blobs are the values of the two address maps.
        for root in [&record.edges_root, &record.vectors_root] {
            let map = PersistentMap::from_root(blobs.clone(), root.clone());
            for (_, chunk_blob) in map.entries()? {
                marked.insert(chunk_blob);
            }
        }

        queue.extend(record.parents);
    }

    let mut stats = GcStats {
        marked: marked.len(),
        ..GcStats::default()
    };

    for key in blobs.list()? {
        if key == ROOTS_KEY || marked.contains(&key) {
            continue;
        }
        let young = match blobs.created_at(&key)? {
            Some(created) => created >= remove_before,
            // Unknown age: be conservative, keep it.
            None => true,
        };
        if young {
            stats.kept_young += 1;
            continue;
        }
        debug!(key = %key, "sweeping unreachable blob");
        blobs.delete(&key)?;
        stats.swept += 1;
    }

    info!(
        marked = stats.marked,
        swept = stats.swept,
        kept_young = stats.kept_young,
        "gc complete"
    );
    Ok(stats)
}
