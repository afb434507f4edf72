use chronovec_core::IndexOptions;
use chronovec_index::{LoadTarget, SearchOptions, VectorIndex};
use chronovec_store::{BlobStore, MemBlobStore};
use std::sync::Arc;

fn fresh(dir: &tempfile::TempDir, blobs: Arc<dyn BlobStore>) -> VectorIndex {
    VectorIndex::create(
        blobs,
        &dir.path().join("vectors.mmap"),
        IndexOptions::new(4, 256),
    )
    .unwrap()
}

#[test]
fn fork_isolates_inserts() {
    let dir = tempfile::tempdir().unwrap();
    let a = fresh(&dir, Arc::new(MemBlobStore::new()));
    a.add("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();

    let b = a.fork().unwrap();
    b.add("b", &[0.0, 1.0, 0.0, 0.0]).unwrap();

    let hits_a = a
        .search(&[0.0, 1.0, 0.0, 0.0], 10, &SearchOptions::default())
        .unwrap();
    assert!(hits_a.iter().all(|h| h.external_id != "b"));
    assert_eq!(hits_a.len(), 1);

    let hits_b = b
        .search(&[0.0, 1.0, 0.0, 0.0], 10, &SearchOptions::default())
        .unwrap();
    let names: Vec<&str> = hits_b.iter().map(|h| h.external_id.as_str()).collect();
    assert!(names.contains(&"a") && names.contains(&"b"));
}

#[test]
fn fork_isolates_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let a = fresh(&dir, Arc::new(MemBlobStore::new()));
    a.add("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
    a.add("b", &[0.0, 1.0, 0.0, 0.0]).unwrap();

    let b = a.fork().unwrap();
    b.delete("a").unwrap();

    assert!(a.contains("a"));
    assert!(!b.contains("a"));
    assert_eq!(a.live_count(), 2);
    assert_eq!(b.live_count(), 1);
}

#[test]
fn unmutated_forks_search_identically() {
    let dir = tempfile::tempdir().unwrap();
    let a = fresh(&dir, Arc::new(MemBlobStore::new()));
    for i in 0..50 {
        a.add(format!("v{i}"), &[i as f32, 1.0, 0.0, 0.0]).unwrap();
    }
    let b = a.fork().unwrap();

    let q = [25.0f32, 1.0, 0.0, 0.0];
    let ra = a.search_internal(&q, 10, &SearchOptions::default()).unwrap();
    let rb = b.search_internal(&q, 10, &SearchOptions::default()).unwrap();
    assert_eq!(ra, rb);
}

#[test]
fn fork_write_does_not_leak_into_source_sync() {
    let dir = tempfile::tempdir().unwrap();
    let blobs: Arc<dyn BlobStore> = Arc::new(MemBlobStore::new());
    let a = fresh(&dir, blobs.clone());
    a.add("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
    let count_before_fork = a.count();

    let b = a.fork().unwrap();
    b.add("b", &[0.0, 1.0, 0.0, 0.0]).unwrap();

    // Syncing A must snapshot A's state only.
    let commit = a.sync().unwrap();
    assert_eq!(a.count(), count_before_fork);

    let reloaded = VectorIndex::load(
        blobs,
        &dir.path().join("reload.mmap"),
        LoadTarget::Commit(commit),
    )
    .unwrap();
    assert_eq!(reloaded.count(), count_before_fork);
    assert!(reloaded.contains("a"));
    assert!(!reloaded.contains("b"), "fork-only vector leaked into A's commit");
}

#[test]
fn fork_then_separate_branches() {
    let dir = tempfile::tempdir().unwrap();
    let blobs: Arc<dyn BlobStore> = Arc::new(MemBlobStore::new());
    let a = fresh(&dir, blobs.clone());
    a.add("base", &[1.0, 0.0, 0.0, 0.0]).unwrap();
    a.sync().unwrap();

    let b = a.fork().unwrap();
    b.create_branch("side").unwrap();
    b.add("side-only", &[0.0, 1.0, 0.0, 0.0]).unwrap();
    let side = b.sync().unwrap();

    a.add("main-only", &[0.0, 0.0, 1.0, 0.0]).unwrap();
    let main = a.sync().unwrap();

    let branches = VectorIndex::branches(&blobs).unwrap();
    assert_eq!(branches.get("main"), Some(&main));
    assert_eq!(branches.get("side"), Some(&side));

    let main_idx = VectorIndex::load(
        blobs.clone(),
        &dir.path().join("m.mmap"),
        LoadTarget::Branch("main"),
    )
    .unwrap();
    let side_idx = VectorIndex::load(
        blobs,
        &dir.path().join("s.mmap"),
        LoadTarget::Branch("side"),
    )
    .unwrap();

    assert!(main_idx.contains("main-only") && !main_idx.contains("side-only"));
    assert!(side_idx.contains("side-only") && !side_idx.contains("main-only"));
    assert!(main_idx.contains("base") && side_idx.contains("base"));
}

#[test]
fn chained_forks_stay_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let a = fresh(&dir, Arc::new(MemBlobStore::new()));
    for i in 0..20 {
        a.add(format!("a{i}"), &[i as f32, 0.0, 0.0, 0.0]).unwrap();
    }
    let b = a.fork().unwrap();
    b.add("b0", &[100.0, 0.0, 0.0, 0.0]).unwrap();
    let c = b.fork().unwrap();
    c.delete("a0").unwrap();

    assert_eq!(a.live_count(), 20);
    assert_eq!(b.live_count(), 21);
    assert_eq!(c.live_count(), 20);
    assert!(c.contains("b0") && !c.contains("a0"));
    assert!(b.contains("a0"));
}
