#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::too_many_lines)]

//! A versioned, embedded HNSW vector index.
//!
//! Vectors live in an append-only memory-mapped arena; the graph adjacency
//! lives in a chunked copy-on-write edge store. `sync` turns the current
//! state into an immutable commit (git-style: parents, branches, structural
//! sharing of unchanged chunks), `fork` is O(1), and `load` rehydrates any
//! commit from the blob store with lazy edge-chunk paging.

mod commit;
mod compact;
mod external_ids;
mod gc;
mod hnsw;
mod inflight;
mod verify;

pub use commit::{BranchRoots, CommitRecord, LoadTarget};
pub use compact::{CompactTargets, DeltaOp};
pub use gc::{collect_garbage, GcStats};
pub use verify::{verify_from_cold, VerifyReport};

use chronovec_core::distance::{distance, normalize_l2};
use chronovec_core::{DistanceKind, Error, IndexOptions, NodeId, Result, RuntimeConfig};
use chronovec_edges::{ChunkResolver, EdgeGeometry, EdgeStore};
use chronovec_store::{hex_key, BlobStore, FsBlobStore, PersistentMap, VectorStore};
use dashmap::{DashMap, DashSet};
use external_ids::ExternalIds;
use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Per-query search controls. All early-termination options compose; hitting
/// any of them returns best-so-far results, never an error.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Beam width override. The effective beam is the max of this, the
    /// configured `ef_search` default, and `k`.
    pub ef: Option<usize>,
    /// Wall-clock budget, checked once per outer iteration.
    pub timeout_nanos: Option<u64>,
    /// Hard cap on distance computations.
    pub max_distance_computations: Option<u64>,
    /// "Patience in Proximity" saturation-based termination.
    pub patience: Option<Patience>,
    /// Allow-set filter over internal ids. The beam still traverses
    /// non-allowed nodes to preserve connectivity; they are just never
    /// admitted to the results.
    pub allow: Option<Arc<RoaringBitmap>>,
}

#[derive(Debug, Clone, Copy)]
pub struct Patience {
    /// Required top-k overlap fraction in `[0, 1]`.
    pub saturation: f64,
    /// Consecutive saturated iterations before stopping. Defaults to
    /// `max(7, ceil(0.3 * k))`.
    pub patience: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub external_id: String,
    pub node_id: NodeId,
    pub distance: f64,
}

#[derive(Debug, Clone)]
pub struct IndexStats {
    pub vector_count: u32,
    pub live_count: usize,
    pub deleted_count: u64,
    pub current_max_level: usize,
    pub entry_point: i64,
    pub dirty_chunks: usize,
    pub resident_chunks: usize,
    pub warm_chunks: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct HeadCommit {
    pub id: Uuid,
    pub hash: Option<String>,
}

/// The four persistent map roots a commit points at.
pub(crate) struct MapRoots {
    pub edges_addrs: PersistentMap,
    pub vector_addrs: PersistentMap,
    pub metadata: PersistentMap,
    pub external: PersistentMap,
}

impl MapRoots {
    fn empty(blobs: &Arc<dyn BlobStore>) -> Self {
        Self {
            edges_addrs: PersistentMap::new(blobs.clone()),
            vector_addrs: PersistentMap::new(blobs.clone()),
            metadata: PersistentMap::new(blobs.clone()),
            external: PersistentMap::new(blobs.clone()),
        }
    }
}

/// Cold-load path for edge chunks: encoded address -> blob key via the
/// edges address map, then the blob store.
struct PmapResolver {
    blobs: Arc<dyn BlobStore>,
    roots: Arc<Mutex<MapRoots>>,
}

impl std::fmt::Debug for PmapResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmapResolver").finish_non_exhaustive()
    }
}

impl ChunkResolver for PmapResolver {
    fn load_chunk(&self, addr: u64) -> Result<Option<Vec<u8>>> {
        let key = { self.roots.lock().edges_addrs.get(&hex_key(addr))? };
        match key {
            Some(key) => self.blobs.get(&key),
            None => Ok(None),
        }
    }
}

pub struct VectorIndex {
    pub(crate) opts: IndexOptions,
    pub(crate) runtime: RuntimeConfig,
    pub(crate) vectors: Arc<VectorStore>,
    pub(crate) edges: Arc<EdgeStore>,
    pub(crate) blobs: Arc<dyn BlobStore>,
    /// This handle's logical vector count: an upper watermark over the ids
    /// its graph may reference (the arena is shared across forks).
    pub(crate) vector_count: AtomicU32,
    pub(crate) last_synced_count: AtomicU32,
    pub(crate) last_synced_deleted: AtomicU64,
    pub(crate) ids: ExternalIds,
    pub(crate) metadata: DashMap<NodeId, HashMap<String, String>>,
    pub(crate) meta_dirty: DashSet<NodeId>,
    pub(crate) roots: Arc<Mutex<MapRoots>>,
    pub(crate) branch: RwLock<String>,
    pub(crate) head: Mutex<Option<HeadCommit>>,
    pub(crate) identity: u64,
    pub(crate) delta_log: Mutex<Option<Vec<DeltaOp>>>,
    pub(crate) sync_lock: Mutex<()>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("branch", &*self.branch.read())
            .field("vector_count", &self.vector_count.load(Ordering::Relaxed))
            .field("distance", &self.opts.distance)
            .finish_non_exhaustive()
    }
}

impl VectorIndex {
    /// Creates a fresh index over the given blob store and vector file.
    pub fn create(
        blobs: Arc<dyn BlobStore>,
        vectors_path: &Path,
        opts: IndexOptions,
    ) -> Result<Self> {
        opts.validate()?;
        let vectors = Arc::new(VectorStore::open_or_create(
            vectors_path,
            opts.dim,
            opts.capacity,
        )?);
        let geo = EdgeGeometry::new(opts.chunk_size, opts.m, opts.m0, opts.max_level, opts.capacity);
        let edges = Arc::new(EdgeStore::new(geo, opts.cache_size));
        let roots = Arc::new(Mutex::new(MapRoots::empty(&blobs)));
        edges.set_resolver(Arc::new(PmapResolver {
            blobs: blobs.clone(),
            roots: roots.clone(),
        }));
        let branch = opts.branch.clone();
        Ok(Self {
            runtime: RuntimeConfig::new(&opts),
            opts,
            vectors,
            edges,
            blobs,
            vector_count: AtomicU32::new(0),
            last_synced_count: AtomicU32::new(0),
            last_synced_deleted: AtomicU64::new(0),
            ids: ExternalIds::new(),
            metadata: DashMap::new(),
            meta_dirty: DashSet::new(),
            roots,
            branch: RwLock::new(branch),
            head: Mutex::new(None),
            identity: inflight::next_identity(),
            delta_log: Mutex::new(None),
            sync_lock: Mutex::new(()),
        })
    }

    /// Convenience layout: `<dir>/blobs` for durable storage and
    /// `<dir>/vectors.mmap` for the vector arena.
    pub fn open_in_dir(dir: &Path, opts: IndexOptions) -> Result<Self> {
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::open(&dir.join("blobs"))?);
        Self::create(blobs, &dir.join("vectors.mmap"), opts)
    }

    pub fn options(&self) -> &IndexOptions {
        &self.opts
    }

    /// Direct access to the underlying edge store (graph invariant checks,
    /// diagnostics).
    pub fn edge_store(&self) -> &EdgeStore {
        &self.edges
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn branch(&self) -> String {
        self.branch.read().clone()
    }

    /// Commit id of the last sync on this handle, if any.
    pub fn head_commit(&self) -> Option<Uuid> {
        self.head.lock().as_ref().map(|h| h.id)
    }

    // ---- writes -----------------------------------------------------------

    pub fn add(&self, external_id: impl Into<String>, vector: &[f32]) -> Result<NodeId> {
        self.add_with_metadata(external_id, vector, HashMap::new())
    }

    pub fn add_with_metadata(
        &self,
        external_id: impl Into<String>,
        vector: &[f32],
        meta: HashMap<String, String>,
    ) -> Result<NodeId> {
        let external_id = external_id.into();
        if vector.len() != self.opts.dim {
            return Err(Error::DimensionMismatch {
                expected: self.opts.dim,
                actual: vector.len(),
            });
        }

        // Duplicate external id upserts: delete then insert.
        if self.ids.get(&external_id).is_some() {
            self.delete(&external_id)?;
        }

        let mut owned = vector.to_vec();
        if self.opts.distance == DistanceKind::Cosine {
            normalize_l2(&mut owned);
        }

        let id = self.vectors.append(&owned)?;
        self.vector_count.fetch_max(id + 1, Ordering::AcqRel);
        self.hnsw_insert(id, &owned)?;

        self.ids.insert(&external_id, id);
        if !meta.is_empty() {
            self.metadata.insert(id, meta.clone());
            self.meta_dirty.insert(id);
        }
        self.log_delta(|| DeltaOp::Add {
            external_id: external_id.clone(),
            vector: owned.clone(),
            metadata: meta.clone(),
        });
        Ok(id)
    }

    /// Batch insert over the process-wide physical-core pool.
    pub fn add_batch(&self, items: Vec<(String, Vec<f32>)>) -> Result<Vec<NodeId>> {
        use rayon::prelude::*;
        inflight::POOL.install(|| {
            items
                .into_par_iter()
                .with_min_len(100)
                .map(|(external_id, vector)| self.add(external_id, &vector))
                .collect()
        })
    }

    /// Soft-deletes by external id. The node stays in the graph for
    /// traversal but is never returned; its neighbors are repaired.
    pub fn delete(&self, external_id: &str) -> Result<bool> {
        let Some(id) = self.ids.remove(external_id) else {
            return Ok(false);
        };
        if self.metadata.remove(&id).is_some() {
            self.meta_dirty.insert(id);
        }
        self.edges.mark_deleted(id);
        self.repair_after_delete(id)?;
        self.log_delta(|| DeltaOp::Delete {
            external_id: external_id.to_string(),
        });
        Ok(true)
    }

    pub(crate) fn log_delta(&self, op: impl Fn() -> DeltaOp) {
        let mut log = self.delta_log.lock();
        if let Some(buffer) = log.as_mut() {
            buffer.push(op());
        }
    }

    // ---- reads ------------------------------------------------------------

    /// K-nearest search with external-id translation. Entries whose mapping
    /// was removed mid-flight are dropped.
    pub fn search(&self, query: &[f32], k: usize, opts: &SearchOptions) -> Result<Vec<SearchHit>> {
        let hits = self.search_internal(query, k, opts)?;
        Ok(hits
            .into_iter()
            .filter_map(|(node_id, dist)| {
                self.ids.external_of(node_id).map(|external_id| SearchHit {
                    external_id,
                    node_id,
                    distance: dist,
                })
            })
            .collect())
    }

    pub fn metadata_of(&self, external_id: &str) -> Option<HashMap<String, String>> {
        let id = self.ids.get(external_id)?;
        self.metadata.get(&id).map(|e| e.value().clone())
    }

    pub fn contains(&self, external_id: &str) -> bool {
        self.ids.get(external_id).is_some()
    }

    /// Total vectors this handle has appended (including soft-deleted).
    pub fn count(&self) -> u32 {
        self.vector_count.load(Ordering::Acquire)
    }

    pub fn live_count(&self) -> usize {
        self.ids.len()
    }

    pub fn deleted_count(&self) -> u64 {
        self.edges.deleted_count()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            vector_count: self.count(),
            live_count: self.live_count(),
            deleted_count: self.deleted_count(),
            current_max_level: self.edges.current_max_level(),
            entry_point: self.edges.entry_point(),
            dirty_chunks: self.edges.dirty_len(),
            resident_chunks: self.edges.resident_chunks(),
            warm_chunks: self.edges.cache_entries(),
        }
    }

    /// Brute-force scan over live nodes. Exact; for recall measurement and
    /// tests only, it does not scale.
    pub fn exact_search(&self, query: &[f32], k: usize) -> Result<Vec<(NodeId, f64)>> {
        if query.len() != self.opts.dim {
            return Err(Error::DimensionMismatch {
                expected: self.opts.dim,
                actual: query.len(),
            });
        }
        let query = self.prepared_query(query);
        let mut hits: Vec<(NodeId, f64)> = self
            .ids
            .live_nodes()
            .into_iter()
            .map(|id| (id, self.dist_to_query(id, &query)))
            .collect();
        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    // ---- internals shared by the hnsw modules -----------------------------

    pub(crate) fn prepared_query(&self, query: &[f32]) -> Vec<f32> {
        let mut owned = query.to_vec();
        if self.opts.distance == DistanceKind::Cosine {
            normalize_l2(&mut owned);
        }
        owned
    }

    #[inline]
    pub(crate) fn dist_to_query(&self, id: NodeId, query: &[f32]) -> f64 {
        distance(self.opts.distance, self.vectors.raw_slice(id), query)
    }

    #[inline]
    pub(crate) fn dist_between(&self, a: NodeId, b: NodeId) -> f64 {
        distance(
            self.opts.distance,
            self.vectors.raw_slice(a),
            self.vectors.raw_slice(b),
        )
    }

    pub(crate) fn debug_log_state(&self, context: &str) {
        debug!(
            context,
            vectors = self.count(),
            live = self.live_count(),
            entry = self.edges.entry_point(),
            max_level = self.edges.current_max_level(),
        );
    }
}
