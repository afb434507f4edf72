use chronovec_edges::{encode_addr, ChunkResolver, EdgeGeometry, EdgeStore};
use dashmap::DashMap;
use std::sync::Arc;

fn small_store() -> EdgeStore {
    // 64-node chunks, m=4/m0=8, 2 upper levels, room for 256 nodes.
    EdgeStore::new(EdgeGeometry::new(64, 4, 8, 2, 256), 128)
}

#[test]
fn empty_store_reads_empty() {
    let store = small_store();
    assert_eq!(store.get_neighbors(0, 0).unwrap(), Vec::<u32>::new());
    assert_eq!(store.entry_point(), -1);
    assert_eq!(store.current_max_level(), 0);
}

#[test]
fn set_get_roundtrip_across_layers() {
    let store = small_store();
    store.set_neighbors(0, 5, &[1, 2, 3]).unwrap();
    store.set_neighbors(1, 5, &[9]).unwrap();
    assert_eq!(store.get_neighbors(0, 5).unwrap(), vec![1, 2, 3]);
    assert_eq!(store.get_neighbors(1, 5).unwrap(), vec![9]);
    assert_eq!(store.get_neighbors(2, 5).unwrap(), Vec::<u32>::new());
}

#[test]
fn overfull_list_truncates_to_layer_cap() {
    let store = small_store();
    let too_many: Vec<u32> = (0..20).collect();
    store.set_neighbors(1, 0, &too_many).unwrap();
    // Upper layers cap at m = 4.
    assert_eq!(store.get_neighbors(1, 0).unwrap().len(), 4);
    store.set_neighbors(0, 0, &too_many).unwrap();
    // Layer 0 caps at m0 = 8.
    assert_eq!(store.get_neighbors(0, 0).unwrap().len(), 8);
}

#[test]
fn add_and_remove_neighbor() {
    let store = small_store();
    store.add_neighbor(0, 3, 7, 8).unwrap();
    store.add_neighbor(0, 3, 7, 8).unwrap(); // duplicate: no-op
    store.add_neighbor(0, 3, 9, 8).unwrap();
    assert_eq!(store.get_neighbors(0, 3).unwrap(), vec![7, 9]);

    store.remove_neighbor(0, 3, 7).unwrap();
    assert_eq!(store.get_neighbors(0, 3).unwrap(), vec![9]);
}

#[test]
fn fork_shares_chunk_pointers_until_write() {
    let store = small_store();
    store.set_neighbors(0, 1, &[2]).unwrap();
    store.set_neighbors(0, 100, &[3]).unwrap(); // second chunk

    let fork = store.fork();
    // Unmutated forks share every chunk pointer.
    assert_eq!(store.chunk_ptr(0, 0), fork.chunk_ptr(0, 0));
    assert_eq!(store.chunk_ptr(0, 1), fork.chunk_ptr(0, 1));

    // A write on the fork re-points only the touched chunk.
    fork.set_neighbors(0, 1, &[5]).unwrap();
    assert_ne!(store.chunk_ptr(0, 0), fork.chunk_ptr(0, 0));
    assert_eq!(store.chunk_ptr(0, 1), fork.chunk_ptr(0, 1));

    // Source still reads its own data.
    assert_eq!(store.get_neighbors(0, 1).unwrap(), vec![2]);
    assert_eq!(fork.get_neighbors(0, 1).unwrap(), vec![5]);
}

#[test]
fn fork_isolates_deletes_and_entry_point() {
    let store = small_store();
    store.set_entry_point(1);
    store.mark_deleted(4);

    let fork = store.fork();
    fork.mark_deleted(7);
    fork.set_entry_point(2);

    assert!(store.is_deleted(4) && !store.is_deleted(7));
    assert!(fork.is_deleted(4) && fork.is_deleted(7));
    assert_eq!(store.entry_point(), 1);
    assert_eq!(fork.entry_point(), 2);
}

#[test]
fn transient_mode_must_pair() {
    let store = small_store();
    store.as_transient().unwrap();
    assert!(store.as_transient().is_err());
    store.as_persistent().unwrap();
    assert!(store.as_persistent().is_err());
}

#[test]
fn transient_write_after_fork_still_cows() {
    let store = small_store();
    store.as_transient().unwrap();
    store.set_neighbors(0, 1, &[2]).unwrap();

    let fork = store.fork();
    let shared_ptr = store.chunk_ptr(0, 0);
    assert_eq!(shared_ptr, fork.chunk_ptr(0, 0));

    // Parent is still transient, but the chunk is now inherited by the
    // fork, so the next write must clone before publishing.
    store.set_neighbors(0, 2, &[3]).unwrap();
    assert_ne!(store.chunk_ptr(0, 0), shared_ptr);
    assert_eq!(fork.chunk_ptr(0, 0), shared_ptr);
    assert_eq!(fork.get_neighbors(0, 2).unwrap(), Vec::<u32>::new());
    store.as_persistent().unwrap();
}

#[test]
fn dirty_tracking_drains_once() {
    let store = small_store();
    store.set_neighbors(0, 0, &[1]).unwrap();
    store.set_neighbors(0, 70, &[1]).unwrap(); // chunk 1
    store.set_neighbors(1, 0, &[1]).unwrap();

    let mut dirty = store.drain_dirty();
    dirty.sort_unstable();
    assert_eq!(
        dirty,
        vec![encode_addr(0, 0), encode_addr(0, 1), encode_addr(1, 0)]
    );
    assert!(store.drain_dirty().is_empty());

    store.set_neighbors(0, 0, &[2]).unwrap();
    assert_eq!(store.drain_dirty(), vec![encode_addr(0, 0)]);
}

#[derive(Debug, Default)]
struct MapResolver {
    blobs: DashMap<u64, Vec<u8>>,
}

impl ChunkResolver for MapResolver {
    fn load_chunk(&self, addr: u64) -> chronovec_core::Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(&addr).map(|e| e.value().clone()))
    }
}

#[test]
fn softify_then_reload_from_resolver() {
    let store = small_store();
    let resolver = Arc::new(MapResolver::default());
    store.set_resolver(resolver.clone());

    store.set_neighbors(0, 1, &[2, 3]).unwrap();
    let addr = encode_addr(0, 0);

    // "Persist" the chunk, then softify it out of the hard slot.
    let bytes = store.chunk_bytes(addr).unwrap();
    resolver.blobs.insert(addr, bytes);
    store.drain_dirty();
    store.softify(addr);
    assert_eq!(store.chunk_ptr(0, 0), None);

    // Warm read comes from the cache.
    assert_eq!(store.get_neighbors(0, 1).unwrap(), vec![2, 3]);

    // A write resolves, clones, and re-publishes a hard chunk.
    store.set_neighbors(0, 2, &[4]).unwrap();
    assert!(store.chunk_ptr(0, 0).is_some());
    assert_eq!(store.get_neighbors(0, 1).unwrap(), vec![2, 3]);
    assert_eq!(store.get_neighbors(0, 2).unwrap(), vec![4]);
}

#[test]
fn cold_load_without_cache_entry() {
    // Build a store, persist a chunk, then start a fresh store that only
    // has the resolver: the chunk must come back from "disk".
    let resolver = Arc::new(MapResolver::default());
    {
        let store = small_store();
        store.set_neighbors(0, 10, &[11, 12]).unwrap();
        let addr = encode_addr(0, 0);
        resolver.blobs.insert(addr, store.chunk_bytes(addr).unwrap());
    }

    let cold = small_store();
    cold.set_resolver(resolver);
    assert_eq!(cold.get_neighbors(0, 10).unwrap(), vec![11, 12]);
    // Writes on top of cold content preserve it.
    cold.add_neighbor(0, 10, 13, 8).unwrap();
    assert_eq!(cold.get_neighbors(0, 10).unwrap(), vec![11, 12, 13]);
}

#[test]
fn entry_point_cas() {
    let store = small_store();
    assert!(store.cas_entry_point(-1, 5));
    assert!(!store.cas_entry_point(-1, 6));
    assert_eq!(store.entry_point(), 5);

    assert!(store.cas_max_level(0, 3));
    assert!(!store.cas_max_level(0, 4));
    assert_eq!(store.current_max_level(), 3);
}
