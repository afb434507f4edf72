//! Commits, branches, sync, fork, and load.
//!
//! A commit is a small self-describing JSON record pointing (by blob key) at
//! the roots of the four persistent maps plus the deleted bitset. The branch
//! map lives in the single mutable roots blob, updated with compare-and-set;
//! everything else is content under write-once keys, so two commits that
//! share history share chunks and map nodes by address.

use crate::external_ids::ExternalIds;
use crate::{inflight, HeadCommit, MapRoots, PmapResolver, VectorIndex};
use chronovec_core::{Error, IndexOptions, NodeId, Result, RuntimeConfig};
use chronovec_store::{hex_key, BlobStore, PersistentMap, ROOTS_KEY};
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;

/// Immutable snapshot record. Optional fields keep the format
/// forward-compatible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    pub commit_id: Uuid,
    #[serde(default)]
    pub parents: Vec<Uuid>,
    pub created_at_ms: u64,
    pub branch: String,
    pub vector_count: u32,
    pub deleted_count: u64,
    pub entry_point: i64,
    pub current_max_level: u32,
    #[serde(default)]
    pub vectors_root: Option<String>,
    #[serde(default)]
    pub edges_root: Option<String>,
    #[serde(default)]
    pub metadata_root: Option<String>,
    #[serde(default)]
    pub external_root: Option<String>,
    #[serde(default)]
    pub deleted_blob: Option<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub options: Option<IndexOptions>,
}

/// The branch map held in the mutable roots blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchRoots {
    #[serde(default)]
    pub branches: BTreeMap<String, Uuid>,
}

pub enum LoadTarget<'a> {
    Branch(&'a str),
    Commit(Uuid),
}

pub(crate) fn commit_key(id: Uuid) -> String {
    format!("commit/{id}")
}

pub(crate) fn meta_key(id: NodeId) -> String {
    format!("m/{id:08x}")
}

/// Reserved prefix inside the metadata map for the reverse external-id map.
pub(crate) fn reverse_key(id: NodeId) -> String {
    format!("x/{id:08x}")
}

fn codec_err(detail: impl std::fmt::Display) -> Error {
    Error::corrupted(0, detail.to_string())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// SHA-512 over the canonical record (hash field cleared) chained with the
/// parent hashes, truncated to 128 bits and rendered as a UUID.
pub(crate) fn compute_commit_hash(
    record: &CommitRecord,
    parent_hashes: &[String],
) -> Result<String> {
    let mut unhashed = record.clone();
    unhashed.commit_hash = None;
    let json = serde_json::to_vec(&unhashed).map_err(codec_err)?;
    let mut hasher = Sha512::new();
    hasher.update(&json);
    for parent in parent_hashes {
        hasher.update(parent.as_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Ok(Uuid::from_bytes(bytes).to_string())
}

pub(crate) fn read_branch_roots(
    blobs: &Arc<dyn BlobStore>,
) -> Result<(Option<Vec<u8>>, BranchRoots)> {
    let raw = blobs.get(ROOTS_KEY)?;
    let roots = match &raw {
        Some(bytes) => serde_json::from_slice(bytes).map_err(codec_err)?,
        None => BranchRoots::default(),
    };
    Ok((raw, roots))
}

pub(crate) fn load_commit_record(
    blobs: &Arc<dyn BlobStore>,
    commit_id: Uuid,
) -> Result<CommitRecord> {
    let bytes = blobs
        .get(&commit_key(commit_id))?
        .ok_or(Error::SnapshotNotFound { commit_id })?;
    serde_json::from_slice(&bytes).map_err(codec_err)
}

impl VectorIndex {
    fn has_unsynced_changes(&self) -> bool {
        self.edges.dirty_len() > 0
            || self.vector_count.load(Ordering::Acquire) != self.last_synced_count.load(Ordering::Acquire)
            || !self.meta_dirty.is_empty()
            || !self.ids.dirty_is_empty()
            || self.deleted_count() != self.last_synced_deleted.load(Ordering::Acquire)
    }

    /// Persists all dirty state as a new commit and advances this handle's
    /// branch head. Idempotent: syncing a clean handle returns the existing
    /// head without creating a commit.
    pub fn sync(&self) -> Result<Uuid> {
        let _ordered = self.sync_lock.lock();

        if !self.has_unsynced_changes() {
            if let Some(head) = self.head.lock().as_ref() {
                return Ok(head.id);
            }
        }

        self.vectors.sync_to_disk()?;

        // Steps 1-4: drain dirty state into content blobs and the maps.
        let dirty_chunks = self.edges.drain_dirty();
        let vector_count = self.vector_count.load(Ordering::Acquire);
        let last_synced = self.last_synced_count.load(Ordering::Acquire);
        {
            let mut roots = self.roots.lock();

            for &addr in &dirty_chunks {
                let bytes = self.edges.chunk_bytes(addr)?;
                let key = format!("chunk/{}", Uuid::new_v4());
                self.blobs.put(&key, &bytes)?;
                roots.edges_addrs.insert(&hex_key(addr), &key)?;
            }

            if vector_count > last_synced {
                let chunk_size = self.opts.chunk_size;
                let first = last_synced as usize / chunk_size;
                let last = (vector_count as usize - 1) / chunk_size;
                for ci in first..=last {
                    let bytes = self.vectors.chunk_bytes(ci as u32, chunk_size, vector_count);
                    let key = format!("vchunk/{}", Uuid::new_v4());
                    self.blobs.put(&key, &bytes)?;
                    roots.vector_addrs.insert(&hex_key(ci as u64), &key)?;
                }
            }

            for node in self.drain_meta_dirty() {
                match self.metadata.get(&node) {
                    Some(entry) => {
                        let json = serde_json::to_string(entry.value()).map_err(codec_err)?;
                        roots.metadata.insert(&meta_key(node), &json)?;
                    }
                    None => {
                        roots.metadata.remove(&meta_key(node))?;
                    }
                }
            }

            let (ext_dirty, rev_dirty) = self.ids.drain_dirty();
            for external in ext_dirty {
                match self.ids.get(&external) {
                    Some(id) => roots.external.insert(&external, &hex_key(u64::from(id)))?,
                    None => {
                        roots.external.remove(&external)?;
                    }
                }
            }
            for node in rev_dirty {
                match self.ids.external_of(node) {
                    Some(external) => roots.metadata.insert(&reverse_key(node), &external)?,
                    None => {
                        roots.metadata.remove(&reverse_key(node))?;
                    }
                }
            }
        }

        let deleted = self.edges.deleted_bitmap();
        let deleted_blob = if deleted.is_empty() {
            None
        } else {
            let mut bytes = Vec::new();
            deleted
                .serialize_into(&mut bytes)
                .map_err(|e| codec_err(format!("deleted bitmap: {e}")))?;
            let key = format!("deleted/{}", Uuid::new_v4());
            self.blobs.put(&key, &bytes)?;
            Some(key)
        };

        // Steps 5-7: assemble the record and atomically advance the branch.
        // The parent is re-read inside the CAS loop so commits on one branch
        // always chain off the branch's actual prior head.
        let branch = self.branch.read().clone();
        let commit_id = Uuid::new_v4();
        let (edges_root, vectors_root, metadata_root, external_root) = {
            let roots = self.roots.lock();
            (
                roots.edges_addrs.root().map(str::to_string),
                roots.vector_addrs.root().map(str::to_string),
                roots.metadata.root().map(str::to_string),
                roots.external.root().map(str::to_string),
            )
        };

        let record = loop {
            let (raw, mut branch_roots) = read_branch_roots(&self.blobs)?;
            let parent = branch_roots.branches.get(&branch).copied();

            let mut record = CommitRecord {
                commit_id,
                parents: parent.into_iter().collect(),
                created_at_ms: now_ms(),
                branch: branch.clone(),
                vector_count,
                deleted_count: deleted.len(),
                entry_point: self.edges.entry_point(),
                current_max_level: self.edges.current_max_level() as u32,
                vectors_root: vectors_root.clone(),
                edges_root: edges_root.clone(),
                metadata_root: metadata_root.clone(),
                external_root: external_root.clone(),
                deleted_blob: deleted_blob.clone(),
                commit_hash: None,
                options: Some(self.opts.clone()),
            };

            if self.opts.crypto_hash {
                let parent_hashes: Vec<String> = match parent {
                    Some(pid) => load_commit_record(&self.blobs, pid)?
                        .commit_hash
                        .into_iter()
                        .collect(),
                    None => Vec::new(),
                };
                record.commit_hash = Some(compute_commit_hash(&record, &parent_hashes)?);
            }

            let record_bytes = serde_json::to_vec(&record).map_err(codec_err)?;
            self.blobs.put(&commit_key(commit_id), &record_bytes)?;

            branch_roots.branches.insert(branch.clone(), commit_id);
            let roots_bytes = serde_json::to_vec(&branch_roots).map_err(codec_err)?;
            if self
                .blobs
                .compare_and_set(ROOTS_KEY, raw.as_deref(), &roots_bytes)?
            {
                break record;
            }
            debug!(branch = %branch, "branch head moved during sync; re-parenting");
        };

        // Step 8: persisted chunks may leave their hard slots.
        for addr in dirty_chunks {
            self.edges.softify(addr);
        }

        self.last_synced_count.store(vector_count, Ordering::Release);
        self.last_synced_deleted.store(deleted.len(), Ordering::Release);
        *self.head.lock() = Some(HeadCommit {
            id: commit_id,
            hash: record.commit_hash.clone(),
        });

        info!(branch = %record.branch, commit = %commit_id, vectors = vector_count, "sync complete");
        Ok(commit_id)
    }

    fn drain_meta_dirty(&self) -> Vec<NodeId> {
        let nodes: Vec<NodeId> = self.meta_dirty.iter().map(|e| *e.key()).collect();
        for n in &nodes {
            self.meta_dirty.remove(n);
        }
        nodes
    }

    /// O(1) fork: shares the vector arena and every unmodified edge chunk.
    /// The fork starts in persistent mode on the same branch with the same
    /// head; mutations on either side never leak to the other.
    pub fn fork(&self) -> Result<VectorIndex> {
        let edges = Arc::new(self.edges.fork());
        let new_roots = {
            let roots = self.roots.lock();
            Arc::new(Mutex::new(MapRoots {
                edges_addrs: roots.edges_addrs.clone(),
                vector_addrs: roots.vector_addrs.clone(),
                metadata: roots.metadata.clone(),
                external: roots.external.clone(),
            }))
        };
        edges.set_resolver(Arc::new(PmapResolver {
            blobs: self.blobs.clone(),
            roots: new_roots.clone(),
        }));

        let runtime = RuntimeConfig::new(&self.opts);
        runtime.set_ef_search(self.runtime.ef_search());
        runtime.set_ef_construction(self.runtime.ef_construction());

        let metadata = DashMap::new();
        for entry in &self.metadata {
            metadata.insert(*entry.key(), entry.value().clone());
        }
        let meta_dirty = DashSet::new();
        for entry in self.meta_dirty.iter() {
            meta_dirty.insert(*entry);
        }

        Ok(VectorIndex {
            opts: self.opts.clone(),
            runtime,
            vectors: Arc::clone(&self.vectors),
            edges,
            blobs: self.blobs.clone(),
            vector_count: AtomicU32::new(self.vector_count.load(Ordering::Acquire)),
            last_synced_count: AtomicU32::new(self.last_synced_count.load(Ordering::Acquire)),
            last_synced_deleted: AtomicU64::new(self.last_synced_deleted.load(Ordering::Acquire)),
            ids: self.ids.deep_clone(),
            metadata,
            meta_dirty,
            roots: new_roots,
            branch: RwLock::new(self.branch.read().clone()),
            head: Mutex::new(self.head.lock().clone()),
            identity: inflight::next_identity(),
            delta_log: Mutex::new(None),
            sync_lock: Mutex::new(()),
        })
    }

    /// Creates a branch at the current commit and switches this handle to
    /// it. Requires a synced index.
    pub fn create_branch(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_state("branch name must be non-empty"));
        }
        if self.has_unsynced_changes() {
            return Err(Error::invalid_state(
                "index has unsynced changes; sync before branching",
            ));
        }
        let head = self
            .head
            .lock()
            .clone()
            .ok_or_else(|| Error::invalid_state("no commit to branch from"))?;

        loop {
            let (raw, mut branch_roots) = read_branch_roots(&self.blobs)?;
            if branch_roots.branches.contains_key(name) {
                return Err(Error::invalid_state(format!("branch {name} already exists")));
            }
            branch_roots.branches.insert(name.to_string(), head.id);
            let bytes = serde_json::to_vec(&branch_roots).map_err(codec_err)?;
            if self
                .blobs
                .compare_and_set(ROOTS_KEY, raw.as_deref(), &bytes)?
            {
                break;
            }
        }
        *self.branch.write() = name.to_string();
        Ok(())
    }

    /// Branch names currently present in the roots blob.
    pub fn branches(blobs: &Arc<dyn BlobStore>) -> Result<BTreeMap<String, Uuid>> {
        Ok(read_branch_roots(blobs)?.1.branches)
    }

    /// Rehydrates an index from a commit (or a branch head). Vector chunks
    /// are hydrated into the mmap eagerly; edge chunks page in lazily
    /// through the address map on first access.
    pub fn load(
        blobs: Arc<dyn BlobStore>,
        vectors_path: &Path,
        target: LoadTarget<'_>,
    ) -> Result<VectorIndex> {
        let commit_id = match target {
            LoadTarget::Commit(id) => id,
            LoadTarget::Branch(name) => {
                let (_, roots) = read_branch_roots(&blobs)?;
                roots
                    .branches
                    .get(name)
                    .copied()
                    .ok_or_else(|| Error::BranchNotFound {
                        name: name.to_string(),
                    })?
            }
        };

        let record = load_commit_record(&blobs, commit_id)?;
        let opts = record
            .options
            .clone()
            .ok_or_else(|| Error::invalid_state("commit record carries no index options"))?;

        let index = VectorIndex::create(blobs.clone(), vectors_path, opts.clone())?;
        {
            let mut roots = index.roots.lock();
            roots.edges_addrs =
                PersistentMap::from_root(blobs.clone(), record.edges_root.clone());
            roots.vector_addrs =
                PersistentMap::from_root(blobs.clone(), record.vectors_root.clone());
            roots.metadata = PersistentMap::from_root(blobs.clone(), record.metadata_root.clone());
            roots.external = PersistentMap::from_root(blobs.clone(), record.external_root.clone());
        }

        // Vector hydration; skipped when the mmap already covers the commit
        // (reloading in place over a shared arena).
        if index.vectors.count() < record.vector_count {
            let entries = index.roots.lock().vector_addrs.entries()?;
            for (hex_ci, key) in entries {
                let ci = u64::from_str_radix(&hex_ci, 16)
                    .map_err(|e| codec_err(format!("vector chunk key {hex_ci}: {e}")))?
                    as u32;
                let bytes = blobs.get(&key)?.ok_or_else(|| {
                    Error::corrupted(u64::from(ci), format!("vector chunk blob {key} missing"))
                })?;
                index.vectors.write_chunk_bytes(ci, opts.chunk_size, &bytes)?;
            }
            index.vectors.publish_count(record.vector_count);
        }
        index
            .vector_count
            .store(record.vector_count, Ordering::Release);
        index
            .last_synced_count
            .store(record.vector_count, Ordering::Release);

        index.edges.set_entry_point(record.entry_point);
        index.edges.set_max_level(record.current_max_level as usize);
        if let Some(key) = &record.deleted_blob {
            let bytes = blobs
                .get(key)?
                .ok_or_else(|| Error::corrupted(0, format!("deleted bitmap blob {key} missing")))?;
            let bitmap = RoaringBitmap::deserialize_from(&bytes[..])
                .map_err(|e| codec_err(format!("deleted bitmap: {e}")))?;
            index.edges.set_deleted_bitmap(bitmap);
        }
        index
            .last_synced_deleted
            .store(index.edges.deleted_count(), Ordering::Release);

        hydrate_mappings(&index.ids, &index.metadata, &index.roots.lock())?;

        *index.branch.write() = record.branch.clone();
        *index.head.lock() = Some(HeadCommit {
            id: commit_id,
            hash: record.commit_hash.clone(),
        });
        index.debug_log_state("load");
        Ok(index)
    }
}

fn hydrate_mappings(
    ids: &ExternalIds,
    metadata: &DashMap<NodeId, HashMap<String, String>>,
    roots: &MapRoots,
) -> Result<()> {
    for (external, hex_id) in roots.external.entries()? {
        let id = u64::from_str_radix(&hex_id, 16)
            .map_err(|e| codec_err(format!("external mapping {external}: {e}")))? as NodeId;
        ids.hydrate(external, id);
    }
    for (key, json) in roots.metadata.entries_with_prefix("m/")? {
        let id = u32::from_str_radix(&key[2..], 16)
            .map_err(|e| codec_err(format!("metadata key {key}: {e}")))?;
        let map: HashMap<String, String> = serde_json::from_str(&json).map_err(codec_err)?;
        metadata.insert(id, map);
    }
    Ok(())
}
