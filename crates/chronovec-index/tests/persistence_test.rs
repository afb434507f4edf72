use chronovec_core::{Error, IndexOptions};
use chronovec_index::{verify_from_cold, LoadTarget, SearchOptions, VectorIndex};
use chronovec_store::{BlobStore, FsBlobStore, MemBlobStore};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

fn random_vec(dim: usize, rng: &mut impl Rng) -> Vec<f32> {
    (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

#[test]
fn sync_is_idempotent_on_clean_state() {
    let dir = tempfile::tempdir().unwrap();
    let index = VectorIndex::create(
        Arc::new(MemBlobStore::new()),
        &dir.path().join("v.mmap"),
        IndexOptions::new(4, 100),
    )
    .unwrap();

    index.add("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
    let c1 = index.sync().unwrap();
    let c2 = index.sync().unwrap();
    assert_eq!(c1, c2, "clean sync must not create a new commit");

    index.add("b", &[0.0, 1.0, 0.0, 0.0]).unwrap();
    let c3 = index.sync().unwrap();
    assert_ne!(c1, c3);
}

#[test]
fn load_by_commit_reproduces_search_results() {
    let dir = tempfile::tempdir().unwrap();
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::open(&dir.path().join("blobs")).unwrap());
    let opts = IndexOptions::new(8, 256).with_ef_construction(64);

    let index =
        VectorIndex::create(blobs.clone(), &dir.path().join("v.mmap"), opts).unwrap();
    let mut rng = rand::thread_rng();
    let vectors: Vec<Vec<f32>> = (0..100).map(|_| random_vec(8, &mut rng)).collect();
    for (i, v) in vectors.iter().enumerate() {
        index.add(format!("v{i}"), v).unwrap();
    }
    index.delete("v7").unwrap();
    let commit = index.sync().unwrap();

    // Load into a separate vector file: full cold rehydration.
    let reloaded = VectorIndex::load(
        blobs,
        &dir.path().join("v2.mmap"),
        LoadTarget::Commit(commit),
    )
    .unwrap();

    assert_eq!(reloaded.count(), index.count());
    assert_eq!(reloaded.live_count(), index.live_count());
    assert_eq!(reloaded.head_commit(), Some(commit));

    let search_opts = SearchOptions { ef: Some(128), ..SearchOptions::default() };
    for q in vectors.iter().take(20) {
        let a = index.search_internal(q, 5, &search_opts).unwrap();
        let b = reloaded.search_internal(q, 5, &search_opts).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.0, y.0);
            assert!((x.1 - y.1).abs() < 1e-9);
        }
    }
    assert!(!reloaded.contains("v7"));
}

#[test]
fn load_by_branch_follows_the_head() {
    let dir = tempfile::tempdir().unwrap();
    let blobs: Arc<dyn BlobStore> = Arc::new(MemBlobStore::new());
    let index = VectorIndex::create(
        blobs.clone(),
        &dir.path().join("v.mmap"),
        IndexOptions::new(4, 100),
    )
    .unwrap();
    index.add("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
    let head = index.sync().unwrap();

    let reloaded = VectorIndex::load(
        blobs.clone(),
        &dir.path().join("v2.mmap"),
        LoadTarget::Branch("main"),
    )
    .unwrap();
    assert_eq!(reloaded.head_commit(), Some(head));
    assert!(reloaded.contains("a"));

    assert!(matches!(
        VectorIndex::load(blobs, &dir.path().join("v3.mmap"), LoadTarget::Branch("nope")),
        Err(Error::BranchNotFound { .. })
    ));
}

#[test]
fn load_unknown_commit_is_snapshot_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let blobs: Arc<dyn BlobStore> = Arc::new(MemBlobStore::new());
    let missing = Uuid::new_v4();
    assert!(matches!(
        VectorIndex::load(blobs, &dir.path().join("v.mmap"), LoadTarget::Commit(missing)),
        Err(Error::SnapshotNotFound { commit_id }) if commit_id == missing
    ));
}

#[test]
fn verify_from_cold_is_valid_right_after_sync() {
    let dir = tempfile::tempdir().unwrap();
    let index = VectorIndex::create(
        Arc::new(MemBlobStore::new()),
        &dir.path().join("v.mmap"),
        IndexOptions::new(8, 256).with_crypto_hash(true),
    )
    .unwrap();
    let mut rng = rand::thread_rng();
    for i in 0..50 {
        index.add(format!("v{i}"), &random_vec(8, &mut rng)).unwrap();
    }
    index.sync().unwrap();

    let report = index.verify_from_cold().unwrap();
    assert!(report.valid);
    assert!(report.edges_verified > 0);
    assert!(report.vectors_verified > 0);
    assert!(report.expected_hash.is_some());
}

#[test]
fn crypto_hash_chains_across_commits() {
    let dir = tempfile::tempdir().unwrap();
    let blobs: Arc<dyn BlobStore> = Arc::new(MemBlobStore::new());
    let index = VectorIndex::create(
        blobs.clone(),
        &dir.path().join("v.mmap"),
        IndexOptions::new(4, 100).with_crypto_hash(true),
    )
    .unwrap();

    index.add("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
    let c1 = index.sync().unwrap();
    index.add("b", &[0.0, 1.0, 0.0, 0.0]).unwrap();
    let c2 = index.sync().unwrap();

    let r1 = verify_from_cold(&blobs, c1).unwrap();
    let r2 = verify_from_cold(&blobs, c2).unwrap();
    assert!(r1.valid && r2.valid);
    assert_ne!(r1.expected_hash, r2.expected_hash);
}

#[test]
fn branch_creation_requires_synced_state() {
    let dir = tempfile::tempdir().unwrap();
    let index = VectorIndex::create(
        Arc::new(MemBlobStore::new()),
        &dir.path().join("v.mmap"),
        IndexOptions::new(4, 100),
    )
    .unwrap();
    index.add("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
    assert!(matches!(
        index.create_branch("exp"),
        Err(Error::InvalidState(_))
    ));

    index.sync().unwrap();
    index.create_branch("exp").unwrap();
    assert_eq!(index.branch(), "exp");
}

#[test]
fn branches_diverge_and_both_load() {
    let dir = tempfile::tempdir().unwrap();
    let blobs: Arc<dyn BlobStore> = Arc::new(MemBlobStore::new());
    let index = VectorIndex::create(
        blobs.clone(),
        &dir.path().join("v.mmap"),
        IndexOptions::new(4, 100),
    )
    .unwrap();
    index.add("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
    let base = index.sync().unwrap();

    index.create_branch("exp").unwrap();
    index.add("b", &[0.0, 1.0, 0.0, 0.0]).unwrap();
    let exp_head = index.sync().unwrap();

    let branches = VectorIndex::branches(&blobs).unwrap();
    assert_eq!(branches.get("main"), Some(&base));
    assert_eq!(branches.get("exp"), Some(&exp_head));

    let main = VectorIndex::load(
        blobs.clone(),
        &dir.path().join("main.mmap"),
        LoadTarget::Branch("main"),
    )
    .unwrap();
    let exp = VectorIndex::load(
        blobs,
        &dir.path().join("exp.mmap"),
        LoadTarget::Branch("exp"),
    )
    .unwrap();

    assert!(main.contains("a") && !main.contains("b"));
    assert!(exp.contains("a") && exp.contains("b"));
}

#[test]
fn metadata_survives_persistence() {
    let dir = tempfile::tempdir().unwrap();
    let blobs: Arc<dyn BlobStore> = Arc::new(MemBlobStore::new());
    let index = VectorIndex::create(
        blobs.clone(),
        &dir.path().join("v.mmap"),
        IndexOptions::new(4, 100),
    )
    .unwrap();

    let mut meta = std::collections::HashMap::new();
    meta.insert("kind".to_string(), "doc".to_string());
    index
        .add_with_metadata("a", &[1.0, 0.0, 0.0, 0.0], meta.clone())
        .unwrap();
    let commit = index.sync().unwrap();

    let reloaded = VectorIndex::load(
        blobs,
        &dir.path().join("v2.mmap"),
        LoadTarget::Commit(commit),
    )
    .unwrap();
    assert_eq!(reloaded.metadata_of("a"), Some(meta));
}

#[test]
fn gc_sweeps_unreferenced_blobs_only() {
    let dir = tempfile::tempdir().unwrap();
    let blobs: Arc<dyn BlobStore> = Arc::new(MemBlobStore::new());
    let index = VectorIndex::create(
        blobs.clone(),
        &dir.path().join("v.mmap"),
        IndexOptions::new(8, 256),
    )
    .unwrap();
    let mut rng = rand::thread_rng();
    for i in 0..40 {
        index.add(format!("v{i}"), &random_vec(8, &mut rng)).unwrap();
    }
    let c1 = index.sync().unwrap();
    for i in 0..10 {
        index.add(format!("w{i}"), &random_vec(8, &mut rng)).unwrap();
    }
    let c2 = index.sync().unwrap();

    // Plant garbage that nothing references.
    blobs.put("chunk/dead-beef", b"junk").unwrap();
    blobs.put("node/dead-beef", b"junk").unwrap();

    // A cutoff in the future means "sweep everything unreachable".
    let stats = index
        .gc(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
    assert!(stats.swept >= 2, "planted garbage must be swept");
    assert!(stats.marked > 0);

    // Both commits stay loadable: c1 is an ancestor of the branch head.
    assert!(verify_from_cold(&blobs, c1).unwrap().valid);
    assert!(verify_from_cold(&blobs, c2).unwrap().valid);
    let reloaded = VectorIndex::load(
        blobs,
        &dir.path().join("v2.mmap"),
        LoadTarget::Commit(c1),
    )
    .unwrap();
    assert_eq!(reloaded.live_count(), 40);
}

#[test]
fn gc_keeps_young_unreferenced_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let blobs: Arc<dyn BlobStore> = Arc::new(MemBlobStore::new());
    let index = VectorIndex::create(
        blobs.clone(),
        &dir.path().join("v.mmap"),
        IndexOptions::new(4, 100),
    )
    .unwrap();
    index.add("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
    index.sync().unwrap();

    blobs.put("chunk/fresh-junk", b"junk").unwrap();

    // Cutoff in the past: everything is younger, nothing is swept.
    let stats = index
        .gc(SystemTime::now() - Duration::from_secs(3600))
        .unwrap();
    assert_eq!(stats.swept, 0);
    assert!(stats.kept_young >= 1);
    assert!(blobs.get("chunk/fresh-junk").unwrap().is_some());
}
