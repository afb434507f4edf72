//! Warm-chunk cache: the soft-reference tier between the hard chunk-array
//! slots and the cold blob store.
//!
//! After a chunk has been persisted, `softify` drops its hard slot and
//! parks the `Arc` here; re-access stays cheap until the LRU evicts it, at
//! which point the chunk must be reloaded by address from durable storage.

use crate::chunk::Chunk;
use moka::sync::Cache;
use std::sync::Arc;

#[derive(Debug)]
pub struct ChunkCache {
    inner: Cache<u64, Arc<Chunk>>,
}

impl ChunkCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Cache::new(capacity.max(1)),
        }
    }

    pub fn insert(&self, addr: u64, chunk: Arc<Chunk>) {
        self.inner.insert(addr, chunk);
    }

    pub fn get(&self, addr: u64) -> Option<Arc<Chunk>> {
        self.inner.get(&addr)
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }
}
