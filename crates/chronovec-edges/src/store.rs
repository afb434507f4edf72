//! Chunked, copy-on-write graph adjacency with lock-free reads.
//!
//! Each layer owns an array of chunk slots (`ArcSwapOption<Chunk>`). A slot
//! is either hard-held (resident, mutable under stripe lock), warm (only in
//! the shared [`ChunkCache`] after `softify`), or cold (reloadable by
//! address through a [`ChunkResolver`]). Writers publish by an atomic
//! pointer swap of the affected slot, so a reader always sees either the
//! pre-CoW or the post-CoW chunk, never a partial one.
//!
//! Forks shallow-clone the slot arrays: both handles keep pointing at the
//! same chunks until one of them writes. The stripe-lock banks and the warm
//! cache are shared across forks so writers that touch the same chunk from
//! two forks still serialize.

use crate::cache::ChunkCache;
use crate::chunk::{decode_addr, encode_addr, Chunk};
use arc_swap::{ArcSwap, ArcSwapOption};
use chronovec_core::{Error, NodeId, Result, NO_ENTRY_POINT};
use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Stripe bank guarding per-node neighbor-list mutations.
pub const NODE_STRIPES: usize = 1024;
/// Smaller bank guarding first allocation of a chunk.
pub const ALLOC_STRIPES: usize = 64;

/// Loads persisted chunk bytes by encoded address. Implemented by the
/// persistence layer, which owns the edges address map; the store itself
/// never tracks blob addresses.
pub trait ChunkResolver: Send + Sync + fmt::Debug {
    fn load_chunk(&self, addr: u64) -> Result<Option<Vec<u8>>>;
}

#[derive(Debug, Clone)]
pub struct EdgeGeometry {
    pub chunk_size: usize,
    pub m: usize,
    pub m0: usize,
    pub max_level: usize,
    pub num_chunks: usize,
    chunk_shift: u32,
    chunk_mask: u32,
}

impl EdgeGeometry {
    pub fn new(chunk_size: usize, m: usize, m0: usize, max_level: usize, capacity: usize) -> Self {
        assert!(chunk_size.is_power_of_two(), "chunk_size must be 2^k");
        Self {
            chunk_size,
            m,
            m0,
            max_level,
            num_chunks: capacity.div_ceil(chunk_size).max(1),
            chunk_shift: chunk_size.trailing_zeros(),
            chunk_mask: (chunk_size - 1) as u32,
        }
    }

    /// Ints per node slot at a layer: neighbor cap plus the count word.
    #[inline]
    pub fn slot_width(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m0 + 1
        } else {
            self.m + 1
        }
    }

    #[inline]
    pub fn locate(&self, id: NodeId) -> (u32, usize) {
        (id >> self.chunk_shift, (id & self.chunk_mask) as usize)
    }
}

#[derive(Debug)]
struct StripeLocks {
    nodes: Vec<Mutex<()>>,
    alloc: Vec<Mutex<()>>,
}

impl StripeLocks {
    fn new() -> Self {
        Self {
            nodes: (0..NODE_STRIPES).map(|_| Mutex::new(())).collect(),
            alloc: (0..ALLOC_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }
}

pub struct EdgeStore {
    geo: EdgeGeometry,
    /// `layers[l][chunk_idx]`: hard slot per chunk position.
    layers: Vec<Box<[ArcSwapOption<Chunk>]>>,
    locks: Arc<StripeLocks>,
    cache: Arc<ChunkCache>,
    resolver: RwLock<Option<Arc<dyn ChunkResolver>>>,
    /// Chunks written since the last sync, by encoded address.
    dirty: DashSet<u64>,
    /// Chunks this handle may mutate in place while transient. Cleared on
    /// fork (both sides must re-CoW anything they shared).
    owned: DashSet<u64>,
    transient: AtomicBool,
    entry_point: AtomicI64,
    max_level_cur: AtomicU32,
    deleted: ArcSwap<RoaringBitmap>,
    deleted_lock: Mutex<()>,
}

impl fmt::Debug for EdgeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeStore")
            .field("geo", &self.geo)
            .field("dirty", &self.dirty.len())
            .field("transient", &self.transient.load(Ordering::Relaxed))
            .field("entry_point", &self.entry_point.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EdgeStore {
    pub fn new(geo: EdgeGeometry, cache_capacity: u64) -> Self {
        let layers = (0..=geo.max_level)
            .map(|_| {
                (0..geo.num_chunks)
                    .map(|_| ArcSwapOption::const_empty())
                    .collect::<Vec<_>>()
                    .into_boxed_slice()
            })
            .collect();
        Self {
            geo,
            layers,
            locks: Arc::new(StripeLocks::new()),
            cache: Arc::new(ChunkCache::new(cache_capacity)),
            resolver: RwLock::new(None),
            dirty: DashSet::new(),
            owned: DashSet::new(),
            transient: AtomicBool::new(false),
            entry_point: AtomicI64::new(NO_ENTRY_POINT),
            max_level_cur: AtomicU32::new(0),
            deleted: ArcSwap::from_pointee(RoaringBitmap::new()),
            deleted_lock: Mutex::new(()),
        }
    }

    pub fn geometry(&self) -> &EdgeGeometry {
        &self.geo
    }

    /// Attaches the cold-load path. Called by the persistence layer once the
    /// edges address map is available.
    pub fn set_resolver(&self, resolver: Arc<dyn ChunkResolver>) {
        *self.resolver.write() = Some(resolver);
    }

    // ---- reads ------------------------------------------------------------

    /// Copy of a node's neighbor list at `layer`, or empty. Lock-free; may
    /// page the chunk into the warm cache.
    pub fn get_neighbors(&self, layer: usize, id: NodeId) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        self.get_neighbors_into(layer, id, &mut out)?;
        Ok(out)
    }

    /// Allocation-free variant: appends into `out`, returns the count.
    pub fn get_neighbors_into(
        &self,
        layer: usize,
        id: NodeId,
        out: &mut Vec<NodeId>,
    ) -> Result<usize> {
        let (ci, local) = self.geo.locate(id);
        match self.get_raw_chunk(layer, ci)? {
            Some(chunk) => Ok(chunk.read_neighbors(local, out)),
            None => Ok(0),
        }
    }

    /// Zero-copy chunk view for hot search paths. Resolution order: hard
    /// slot, warm cache, cold blob load (which lands in the warm cache).
    pub fn get_raw_chunk(&self, layer: usize, chunk_idx: u32) -> Result<Option<Arc<Chunk>>> {
        debug_assert!(layer < self.layers.len());
        let slot = &self.layers[layer][chunk_idx as usize];
        if let Some(chunk) = slot.load_full() {
            return Ok(Some(chunk));
        }
        let addr = encode_addr(layer as u32, chunk_idx);
        if let Some(chunk) = self.cache.get(addr) {
            return Ok(Some(chunk));
        }
        self.load_cold(layer, addr).map(|loaded| {
            if let Some(chunk) = &loaded {
                self.cache.insert(addr, chunk.clone());
            }
            loaded
        })
    }

    fn load_cold(&self, layer: usize, addr: u64) -> Result<Option<Arc<Chunk>>> {
        let resolver = self.resolver.read().clone();
        let Some(resolver) = resolver else {
            return Ok(None);
        };
        let Some(bytes) = resolver.load_chunk(addr)? else {
            return Ok(None);
        };
        trace!(addr, "cold chunk load");
        let chunk = Chunk::from_bytes(self.geo.chunk_size, self.geo.slot_width(layer), &bytes, addr)?;
        Ok(Some(Arc::new(chunk)))
    }

    // ---- writes -----------------------------------------------------------

    /// Replaces a node's neighbor list. Over-full input is truncated to the
    /// layer cap. Stripe-locked; CoW-publishes unless this handle is
    /// transient and already owns the chunk.
    pub fn set_neighbors(&self, layer: usize, id: NodeId, list: &[NodeId]) -> Result<()> {
        self.mutate_slot(layer, id, |chunk, local| chunk.write_neighbors(local, list))
    }

    /// Appends one neighbor if the node holds fewer than `max`; no-op
    /// otherwise.
    pub fn add_neighbor(&self, layer: usize, id: NodeId, nbr: NodeId, max: usize) -> Result<()> {
        self.mutate_slot(layer, id, |chunk, local| {
            chunk.push_neighbor(local, nbr, max);
        })
    }

    pub fn remove_neighbor(&self, layer: usize, id: NodeId, nbr: NodeId) -> Result<()> {
        self.mutate_slot(layer, id, |chunk, local| {
            chunk.remove_neighbor(local, nbr);
        })
    }

    /// Read-modify-write of a node's neighbor list under its stripe lock.
    /// The rebuild closure may run more than once if the slot is contended.
    pub fn update_neighbors(
        &self,
        layer: usize,
        id: NodeId,
        rebuild: impl Fn(&[NodeId]) -> Vec<NodeId>,
    ) -> Result<()> {
        self.mutate_slot(layer, id, |chunk, local| {
            let mut current = Vec::new();
            chunk.read_neighbors(local, &mut current);
            let next = rebuild(&current);
            chunk.write_neighbors(local, &next);
        })
    }

    fn mutate_slot(&self, layer: usize, id: NodeId, apply: impl Fn(&Chunk, usize)) -> Result<()> {
        if layer >= self.layers.len() {
            return Err(Error::invalid_state(format!(
                "layer {layer} beyond max level {}",
                self.geo.max_level
            )));
        }
        let (ci, local) = self.geo.locate(id);
        if ci as usize >= self.geo.num_chunks {
            return Err(Error::invalid_state(format!("node {id} beyond capacity")));
        }
        let addr = encode_addr(layer as u32, ci);
        let _node_guard = self.locks.nodes[id as usize & (NODE_STRIPES - 1)].lock();
        let slot = &self.layers[layer][ci as usize];

        if self.transient.load(Ordering::Relaxed) && self.owned.contains(&addr) {
            // In place: the chunk is private to this handle. Re-pin the hard
            // slot in case it was softified after the last sync.
            let chunk = match slot.load_full() {
                Some(chunk) => chunk,
                None => self
                    .warm_or_cold(layer, addr)?
                    .ok_or_else(|| Error::corrupted(addr, "owned chunk lost from all tiers"))?,
            };
            slot.store(Some(chunk.clone()));
            apply(&chunk, local);
            self.dirty.insert(addr);
            return Ok(());
        }

        // CoW publication. Base content for a missing slot comes from the
        // warm cache or the blob store; a write must never proceed without
        // having seen previously persisted content for this address.
        let base_cold = if slot.load().is_none() {
            self.warm_or_cold(layer, addr)?
        } else {
            None
        };

        let _alloc_guard = if slot.load().is_none() && base_cold.is_none() {
            Some(self.locks.alloc[(addr as usize) & (ALLOC_STRIPES - 1)].lock())
        } else {
            None
        };

        slot.rcu(|cur| {
            let new = match cur.as_ref().or(base_cold.as_ref()) {
                Some(chunk) => chunk.deep_clone(),
                None => Chunk::new(self.geo.chunk_size, self.geo.slot_width(layer)),
            };
            apply(&new, local);
            Some(Arc::new(new))
        });
        self.owned.insert(addr);
        self.dirty.insert(addr);
        Ok(())
    }

    fn warm_or_cold(&self, layer: usize, addr: u64) -> Result<Option<Arc<Chunk>>> {
        if let Some(chunk) = self.cache.get(addr) {
            return Ok(Some(chunk));
        }
        self.load_cold(layer, addr)
    }

    // ---- deletion bitset --------------------------------------------------

    /// Marks a node deleted (CoW on the shared bitmap). Returns false if it
    /// already was.
    pub fn mark_deleted(&self, id: NodeId) -> bool {
        let _guard = self.deleted_lock.lock();
        let current = self.deleted.load_full();
        if current.contains(id) {
            return false;
        }
        let mut next = (*current).clone();
        next.insert(id);
        self.deleted.store(Arc::new(next));
        true
    }

    #[inline]
    pub fn is_deleted(&self, id: NodeId) -> bool {
        self.deleted.load().contains(id)
    }

    pub fn deleted_count(&self) -> u64 {
        self.deleted.load().len()
    }

    pub fn deleted_bitmap(&self) -> Arc<RoaringBitmap> {
        self.deleted.load_full()
    }

    pub fn set_deleted_bitmap(&self, bitmap: RoaringBitmap) {
        let _guard = self.deleted_lock.lock();
        self.deleted.store(Arc::new(bitmap));
    }

    // ---- entry point / level ----------------------------------------------

    pub fn entry_point(&self) -> i64 {
        self.entry_point.load(Ordering::Acquire)
    }

    pub fn set_entry_point(&self, id: i64) {
        self.entry_point.store(id, Ordering::Release);
    }

    pub fn cas_entry_point(&self, expected: i64, new: i64) -> bool {
        self.entry_point
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn current_max_level(&self) -> usize {
        self.max_level_cur.load(Ordering::Acquire) as usize
    }

    pub fn set_max_level(&self, level: usize) {
        self.max_level_cur.store(level as u32, Ordering::Release);
    }

    pub fn cas_max_level(&self, expected: usize, new: usize) -> bool {
        self.max_level_cur
            .compare_exchange(
                expected as u32,
                new as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    // ---- modes ------------------------------------------------------------

    /// Enters transient mode: subsequent writes to owned chunks mutate in
    /// place (bulk-build throughput). Must be paired with
    /// [`EdgeStore::as_persistent`].
    pub fn as_transient(&self) -> Result<()> {
        if self.transient.swap(true, Ordering::AcqRel) {
            return Err(Error::invalid_state("store is already transient"));
        }
        Ok(())
    }

    pub fn as_persistent(&self) -> Result<()> {
        if !self.transient.swap(false, Ordering::AcqRel) {
            return Err(Error::invalid_state("store is not transient"));
        }
        Ok(())
    }

    pub fn is_transient(&self) -> bool {
        self.transient.load(Ordering::Relaxed)
    }

    // ---- fork / sync support ----------------------------------------------

    /// New store sharing every chunk, the stripe banks, and the warm cache.
    /// The fork gets its own dirty set and starts in persistent mode. Both
    /// sides lose in-place rights: any chunk either one touches next is
    /// re-cloned before publication.
    pub fn fork(&self) -> EdgeStore {
        self.owned.clear();
        let layers = self
            .layers
            .iter()
            .map(|slots| {
                slots
                    .iter()
                    .map(|slot| ArcSwapOption::new(slot.load_full()))
                    .collect::<Vec<_>>()
                    .into_boxed_slice()
            })
            .collect();
        EdgeStore {
            geo: self.geo.clone(),
            layers,
            locks: Arc::clone(&self.locks),
            cache: Arc::clone(&self.cache),
            resolver: RwLock::new(self.resolver.read().clone()),
            dirty: DashSet::new(),
            owned: DashSet::new(),
            transient: AtomicBool::new(false),
            entry_point: AtomicI64::new(self.entry_point.load(Ordering::Acquire)),
            max_level_cur: AtomicU32::new(self.max_level_cur.load(Ordering::Acquire)),
            deleted: ArcSwap::new(self.deleted.load_full()),
            deleted_lock: Mutex::new(()),
        }
    }

    /// Snapshot-and-clear of the dirty set. A write racing the drain either
    /// lands in the snapshot (and its content is serialized afterwards) or
    /// stays queued for the next sync; nothing is lost.
    pub fn drain_dirty(&self) -> Vec<u64> {
        let addrs: Vec<u64> = self.dirty.iter().map(|e| *e.key()).collect();
        for addr in &addrs {
            self.dirty.remove(addr);
        }
        addrs
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// Serializes the current content of the chunk at `addr`. The chunk
    /// must be resident (dirty chunks always are).
    pub fn chunk_bytes(&self, addr: u64) -> Result<Vec<u8>> {
        let (layer, ci) = decode_addr(addr);
        let slot = &self.layers[layer as usize][ci as usize];
        let chunk = match slot.load_full() {
            Some(chunk) => chunk,
            None => self
                .cache
                .get(addr)
                .ok_or_else(|| Error::corrupted(addr, "dirty chunk not resident"))?,
        };
        Ok(chunk.to_bytes())
    }

    /// Post-persistence eviction hook: moves the chunk from its hard slot
    /// into the warm cache. A concurrent writer that re-published the slot
    /// wins; the slot is only cleared if it still holds the chunk we cached.
    pub fn softify(&self, addr: u64) {
        let (layer, ci) = decode_addr(addr);
        let slot = &self.layers[layer as usize][ci as usize];
        let Some(chunk) = slot.load_full() else {
            return;
        };
        self.cache.insert(addr, chunk.clone());
        slot.rcu(|cur| match cur {
            Some(c) if Arc::ptr_eq(c, &chunk) => None,
            other => other.clone(),
        });
    }

    /// Hard-resident chunk count (stats surface).
    pub fn resident_chunks(&self) -> usize {
        self.layers
            .iter()
            .map(|slots| slots.iter().filter(|s| s.load().is_some()).count())
            .sum()
    }

    pub fn cache_entries(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Raw slot pointer for structural-sharing assertions in tests.
    pub fn chunk_ptr(&self, layer: usize, chunk_idx: u32) -> Option<*const Chunk> {
        self.layers[layer][chunk_idx as usize]
            .load_full()
            .map(|arc| Arc::as_ptr(&arc))
    }
}
