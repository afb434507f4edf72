use chronovec_core::Error;
use chronovec_store::VectorStore;
use std::sync::Arc;
use std::thread;

#[test]
fn append_get_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vectors.mmap");
    let store = VectorStore::open_or_create(&path, 4, 100).unwrap();

    let id = store.append(&[1.0, 2.0, 3.0, 4.0]).unwrap();
    assert_eq!(id, 0);
    assert_eq!(store.count(), 1);
    assert_eq!(store.get(0), vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(store.raw_slice(0), &[1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn rejects_dimension_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let store = VectorStore::open_or_create(&dir.path().join("v.mmap"), 4, 10).unwrap();
    let err = store.append(&[1.0, 2.0]).unwrap_err();
    assert!(matches!(
        err,
        Error::DimensionMismatch {
            expected: 4,
            actual: 2
        }
    ));
}

#[test]
fn capacity_zero_always_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = VectorStore::open_or_create(&dir.path().join("v.mmap"), 4, 0).unwrap();
    for _ in 0..3 {
        assert!(matches!(
            store.append(&[0.0; 4]).unwrap_err(),
            Error::CapacityExceeded
        ));
    }
}

#[test]
fn fills_to_capacity_then_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = VectorStore::open_or_create(&dir.path().join("v.mmap"), 2, 5).unwrap();
    for i in 0..5 {
        let id = store.append(&[i as f32, 0.0]).unwrap();
        assert_eq!(id, i);
    }
    assert!(matches!(
        store.append(&[9.0, 9.0]).unwrap_err(),
        Error::CapacityExceeded
    ));
    assert_eq!(store.count(), 5);
}

#[test]
fn reopen_preserves_count_and_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("v.mmap");
    {
        let store = VectorStore::open_or_create(&path, 3, 10).unwrap();
        store.append(&[1.0, 2.0, 3.0]).unwrap();
        store.append(&[4.0, 5.0, 6.0]).unwrap();
        store.sync_to_disk().unwrap();
    }
    let store = VectorStore::open_or_create(&path, 3, 10).unwrap();
    assert_eq!(store.count(), 2);
    assert_eq!(store.get(1), vec![4.0, 5.0, 6.0]);
}

#[test]
fn reopen_with_wrong_geometry_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("v.mmap");
    {
        VectorStore::open_or_create(&path, 3, 10).unwrap();
    }
    assert!(VectorStore::open_or_create(&path, 4, 10).is_err());
}

#[test]
fn concurrent_appends_assign_unique_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(VectorStore::open_or_create(&dir.path().join("v.mmap"), 2, 4000).unwrap());

    let mut handles = Vec::new();
    for t in 0..8 {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            let mut ids = Vec::new();
            for i in 0..500 {
                let v = [t as f32, i as f32];
                ids.push((store.append(&v).unwrap(), v));
            }
            ids
        }));
    }

    let mut seen = vec![false; 4000];
    for h in handles {
        for (id, v) in h.join().unwrap() {
            assert!(!seen[id as usize], "id {id} assigned twice");
            seen[id as usize] = true;
            assert_eq!(store.get(id), v.to_vec());
        }
    }
    assert_eq!(store.count(), 4000);
}

#[test]
fn chunk_bytes_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path_a = dir.path().join("a.mmap");
    let path_b = dir.path().join("b.mmap");
    let a = VectorStore::open_or_create(&path_a, 2, 300).unwrap();
    for i in 0..300 {
        a.append(&[i as f32, -(i as f32)]).unwrap();
    }

    // Copy via serialized chunks of 128 vectors.
    let b = VectorStore::open_or_create(&path_b, 2, 300).unwrap();
    for chunk_idx in 0..3 {
        let bytes = a.chunk_bytes(chunk_idx, 128, 300);
        assert_eq!(bytes.len(), a.chunk_len(chunk_idx, 128));
        b.write_chunk_bytes(chunk_idx, 128, &bytes).unwrap();
    }
    b.publish_count(300);

    for i in 0..300 {
        assert_eq!(b.get(i), a.get(i));
    }
}

#[test]
fn chunk_bytes_zeroes_slots_beyond_limit() {
    let dir = tempfile::tempdir().unwrap();
    let store = VectorStore::open_or_create(&dir.path().join("v.mmap"), 2, 8).unwrap();
    for i in 0..4 {
        store.append(&[i as f32 + 1.0, 0.0]).unwrap();
    }

    // Only the first two vectors are visible to this snapshot.
    let bytes = store.chunk_bytes(0, 8, 2);
    assert_eq!(bytes.len(), 8 * 2 * 4);
    assert!(bytes[..2 * 2 * 4].iter().any(|&b| b != 0));
    assert!(bytes[2 * 2 * 4..].iter().all(|&b| b == 0));
}
