//! Durable blob storage behind the index.
//!
//! The index treats persistence as an opaque key/value store: content blobs
//! (edge chunks, vector chunks, map nodes, commit records) are written once
//! under fresh keys and never mutated. The single exception is the designated
//! [`ROOTS_KEY`], which holds the branch map and is updated with
//! compare-and-set semantics.

use chronovec_core::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;
use uuid::Uuid;

/// The one key updated in place, with CAS semantics: the branch roots map.
pub const ROOTS_KEY: &str = "roots";

/// Minimal capability set the index requires of durable storage.
pub trait BlobStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    /// All keys currently present. Used by GC sweep and verification.
    fn list(&self) -> Result<Vec<String>>;

    /// Creation time of a blob, if known. GC never sweeps blobs younger
    /// than its `remove_before` cutoff.
    fn created_at(&self, key: &str) -> Result<Option<SystemTime>>;

    /// Atomically replaces `key` if its current content equals `expected`
    /// (`None` = key absent). Returns false on mismatch.
    fn compare_and_set(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool>;
}

/// Filesystem-backed blob store: one file per key under a root directory.
/// Writes go through a temp file + rename so a crash never leaves a
/// half-written blob under a live key.
pub struct FsBlobStore {
    dir: PathBuf,
    cas_lock: Mutex<()>,
}

impl fmt::Debug for FsBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsBlobStore").field("dir", &self.dir).finish()
    }
}

impl FsBlobStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            cas_lock: Mutex::new(()),
        })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        // Keys use '/' namespacing ("chunk/<uuid>", "node/<uuid>", ...).
        self.dir.join(key)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.dir.join(format!(".tmp-{}", Uuid::new_v4()));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn collect_keys(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(".tmp-") {
                continue;
            }
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            if entry.file_type()?.is_dir() {
                self.collect_keys(&entry.path(), &key, out)?;
            } else {
                out.push(key);
            }
        }
        Ok(())
    }
}

impl BlobStore for FsBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.key_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.write_atomic(&self.key_path(key), bytes)
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        self.collect_keys(&self.dir, "", &mut out)?;
        Ok(out)
    }

    fn created_at(&self, key: &str) -> Result<Option<SystemTime>> {
        match fs::metadata(self.key_path(key)) {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn compare_and_set(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool> {
        // Single-process writers only; cross-process coordination is out of
        // scope, so an in-process lock suffices for the roots key.
        let _guard = self.cas_lock.lock();
        let current = self.get(key)?;
        if current.as_deref() != expected {
            debug!(key, "compare_and_set lost the race");
            return Ok(false);
        }
        self.write_atomic(&self.key_path(key), new)?;
        Ok(true)
    }
}

/// In-memory blob store for tests and transient indexes.
#[derive(Debug, Default)]
pub struct MemBlobStore {
    map: DashMap<String, (SystemTime, Arc<Vec<u8>>)>,
    cas_lock: Mutex<()>,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.get(key).map(|e| e.value().1.as_ref().clone()))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.map.insert(
            key.to_string(),
            (SystemTime::now(), Arc::new(bytes.to_vec())),
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.map.iter().map(|e| e.key().clone()).collect())
    }

    fn created_at(&self, key: &str) -> Result<Option<SystemTime>> {
        Ok(self.map.get(key).map(|e| e.value().0))
    }

    fn compare_and_set(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool> {
        let _guard = self.cas_lock.lock();
        let matches = match (self.map.get(key), expected) {
            (None, None) => true,
            (Some(e), Some(want)) => e.value().1.as_slice() == want,
            _ => false,
        };
        if !matches {
            return Ok(false);
        }
        self.map
            .insert(key.to_string(), (SystemTime::now(), Arc::new(new.to_vec())));
        Ok(true)
    }
}
