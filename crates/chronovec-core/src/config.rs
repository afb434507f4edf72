use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Distance metric, fixed at index-create time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceKind {
    /// Squared Euclidean distance (no sqrt; only ordering is used).
    Euclidean,
    /// `1 - dot(a, b)`.
    InnerProduct,
    /// Inputs are L2-normalized at insert and query, then inner-product.
    Cosine,
}

/// Index creation options. `dim` and `capacity` are required; everything
/// else carries the conventional HNSW defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexOptions {
    pub dim: usize,
    /// Max neighbors on upper layers.
    pub m: usize,
    /// Max neighbors on layer 0. Defaults to `2 * m`.
    pub m0: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// Cap on assigned levels.
    pub max_level: usize,
    /// Fixed vector count cap; the mmap file is sized from this.
    pub capacity: usize,
    pub distance: DistanceKind,
    /// Initial branch name.
    pub branch: String,
    /// Enable chained SHA-512/128 commit hashing.
    pub crypto_hash: bool,
    /// Nodes per edge chunk. Must be a power of two.
    pub chunk_size: usize,
    /// Warm-chunk cache capacity hint (number of chunks).
    pub cache_size: u64,
}

impl IndexOptions {
    pub fn new(dim: usize, capacity: usize) -> Self {
        let m = 16;
        Self {
            dim,
            m,
            m0: 2 * m,
            ef_construction: 200,
            ef_search: 100,
            max_level: 16,
            capacity,
            distance: DistanceKind::Euclidean,
            branch: "main".to_string(),
            crypto_hash: false,
            chunk_size: 1024,
            cache_size: 4096,
        }
    }

    pub fn with_m(mut self, m: usize) -> Self {
        self.m = m;
        self.m0 = 2 * m;
        self
    }

    pub fn with_m0(mut self, m0: usize) -> Self {
        self.m0 = m0;
        self
    }

    pub fn with_ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = ef;
        self
    }

    pub fn with_ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef;
        self
    }

    pub fn with_distance(mut self, distance: DistanceKind) -> Self {
        self.distance = distance;
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_crypto_hash(mut self, enabled: bool) -> Self {
        self.crypto_hash = enabled;
        self
    }

    pub fn with_max_level(mut self, max_level: usize) -> Self {
        self.max_level = max_level;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_cache_size(mut self, cache_size: u64) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(Error::invalid_state("dim must be non-zero"));
        }
        if self.m < 2 {
            return Err(Error::invalid_state("m must be at least 2"));
        }
        if self.m0 < self.m {
            return Err(Error::invalid_state("m0 must be at least m"));
        }
        if !self.chunk_size.is_power_of_two() {
            return Err(Error::invalid_state("chunk_size must be a power of two"));
        }
        if self.max_level == 0 || self.max_level > 64 {
            return Err(Error::invalid_state("max_level must be in 1..=64"));
        }
        if self.branch.is_empty() {
            return Err(Error::invalid_state("branch name must be non-empty"));
        }
        Ok(())
    }

    /// Neighbor cap for a layer.
    #[inline]
    pub fn max_neighbors(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }

    /// Number of edge chunks needed to cover `capacity` nodes.
    #[inline]
    pub fn num_chunks(&self) -> usize {
        self.capacity.div_ceil(self.chunk_size).max(1)
    }
}

/// Runtime-tunable knobs, adjustable on a live index.
#[derive(Debug)]
pub struct RuntimeConfig {
    ef_search: AtomicUsize,
    ef_construction: AtomicUsize,
}

impl RuntimeConfig {
    pub fn new(opts: &IndexOptions) -> Self {
        Self {
            ef_search: AtomicUsize::new(opts.ef_search),
            ef_construction: AtomicUsize::new(opts.ef_construction),
        }
    }

    pub fn ef_search(&self) -> usize {
        self.ef_search.load(Ordering::Relaxed)
    }

    pub fn set_ef_search(&self, val: usize) {
        self.ef_search.store(val, Ordering::Relaxed);
    }

    pub fn ef_construction(&self) -> usize {
        self.ef_construction.load(Ordering::Relaxed)
    }

    pub fn set_ef_construction(&self, val: usize) {
        self.ef_construction.store(val, Ordering::Relaxed);
    }
}
