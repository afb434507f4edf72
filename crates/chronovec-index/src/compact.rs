//! Compaction: rebuild an index without its soft-deleted nodes.
//!
//! Offline compaction re-inserts every live node, in internal-id order,
//! into a fresh target index, producing a dense id space and a freshly
//! built graph. Online compaction does the same over a fork while the
//! source keeps serving; mutations made during the copy land in a delta
//! log and are replayed onto the target before it is handed back (the
//! caller performs the final handle swap).

use crate::{inflight, VectorIndex};
use chronovec_core::{NodeId, Result};
use chronovec_store::BlobStore;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

/// Where the compacted index lives.
pub struct CompactTargets {
    pub blobs: Arc<dyn BlobStore>,
    pub vectors_path: PathBuf,
}

/// A mutation buffered while an online compaction copy is running.
#[derive(Debug, Clone)]
pub enum DeltaOp {
    Add {
        external_id: String,
        vector: Vec<f32>,
        metadata: HashMap<String, String>,
    },
    Delete {
        external_id: String,
    },
}

impl VectorIndex {
    /// Rebuilds this index into `target`, dropping soft-deleted nodes and
    /// remapping internal ids densely. The source is untouched.
    pub fn compact_offline(&self, target: CompactTargets) -> Result<VectorIndex> {
        let out = VectorIndex::create(target.blobs, &target.vectors_path, self.opts.clone())?;

        let mut live: Vec<NodeId> = self.ids.live_nodes();
        live.sort_unstable();

        // Appends are sequential so the target id order mirrors the source
        // iteration order; graph builds run on the physical-core pool.
        let mut remap: HashMap<NodeId, NodeId> = HashMap::with_capacity(live.len());
        let mut queue: Vec<(NodeId, Vec<f32>)> = Vec::with_capacity(live.len());
        for &old_id in &live {
            let vector = self.vectors.get(old_id);
            let new_id = out.vectors.append(&vector)?;
            out.vector_count.fetch_max(new_id + 1, Ordering::AcqRel);
            remap.insert(old_id, new_id);
            queue.push((new_id, vector));
        }

        out.edges.as_transient()?;
        let built: Result<Vec<()>> = inflight::POOL.install(|| {
            queue
                .par_iter()
                .with_min_len(100)
                .map(|(id, vector)| out.hnsw_insert(*id, vector))
                .collect()
        });
        out.edges.as_persistent()?;
        built?;

        for &old_id in &live {
            let new_id = remap[&old_id];
            if let Some(external) = self.ids.external_of(old_id) {
                out.ids.insert(&external, new_id);
            }
            if let Some(meta) = self.metadata.get(&old_id) {
                out.metadata.insert(new_id, meta.value().clone());
                out.meta_dirty.insert(new_id);
            }
        }

        info!(live = live.len(), "offline compaction complete");
        Ok(out)
    }

    /// Online compaction: copies from a fork while this index keeps serving
    /// reads and writes, then replays the mutations buffered during the
    /// copy onto the target. Returns the compacted index; swapping it in
    /// for the source handle is the caller's final step.
    pub fn compact_online(&self, target: CompactTargets) -> Result<VectorIndex> {
        {
            let mut log = self.delta_log.lock();
            *log = Some(Vec::new());
        }

        let snapshot = self.fork()?;
        let copied = snapshot.compact_offline(target);

        // Stop buffering before replay; ops arriving after this point were
        // not part of the copy window and belong to the source's future.
        let buffered = self.delta_log.lock().take().unwrap_or_default();
        let out = copied?;

        let replayed = buffered.len();
        for op in buffered {
            match op {
                DeltaOp::Add {
                    external_id,
                    vector,
                    metadata,
                } => {
                    out.add_with_metadata(external_id, &vector, metadata)?;
                }
                DeltaOp::Delete { external_id } => {
                    out.delete(&external_id)?;
                }
            }
        }

        info!(replayed, "online compaction complete");
        Ok(out)
    }
}
