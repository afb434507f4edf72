#![allow(clippy::cast_ptr_alignment)]
use byteorder::{ByteOrder, LittleEndian};
use chronovec_core::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

const HEADER_LEN: usize = 64;
const OFF_DIM: usize = 0;
const OFF_COUNT: usize = 4;
const OFF_CAPACITY: usize = 8;
const OFF_MAGIC: usize = 12;
const OFF_VERSION: usize = 16;

const MAGIC: u32 = 0x4356_4543; // "CVEC"
const VERSION: u32 = 1;

/// Fixed-capacity append-only vector storage over a memory-mapped file.
///
/// Layout: a 64-byte header (`dim`, `count`, `capacity`, little-endian)
/// followed by `capacity * dim * 4` bytes of raw f32 data. Vector `i`
/// starts at byte `64 + i * dim * 4`.
///
/// The store is shared by every fork of an index: slots are written at most
/// once, ids are handed out by atomic reservation, and the in-header count
/// is the last store of each append, so a reader observing `count > i` is
/// guaranteed to see vector `i` fully written.
#[derive(Debug)]
pub struct VectorStore {
    map: MmapMut,
    ptr: *mut u8,
    dim: usize,
    capacity: usize,
    /// Next id to hand out.
    reserved: AtomicU32,
    /// Ids below this are fully written and visible.
    committed: AtomicU32,
    path: PathBuf,
}

// Writes go to disjoint slots behind atomic reservation; the raw pointer is
// only ever offset into regions owned by a single writer.
unsafe impl Send for VectorStore {}
unsafe impl Sync for VectorStore {}

impl VectorStore {
    /// Creates a new store, or opens an existing one if the file already
    /// carries a valid header with matching geometry.
    pub fn open_or_create(path: &Path, dim: usize, capacity: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let data_len = capacity
            .checked_mul(dim)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| Error::invalid_state("vector file size overflow"))?;
        let total_len = (HEADER_LEN + data_len) as u64;

        let existing = file.metadata()?.len() >= HEADER_LEN as u64;
        file.set_len(total_len)?;

        let mut map = unsafe { MmapOptions::new().map_mut(&file)? };
        let ptr = map.as_mut_ptr();

        let count = if existing && LittleEndian::read_u32(&map[OFF_MAGIC..OFF_MAGIC + 4]) == MAGIC {
            let on_disk_dim = LittleEndian::read_u32(&map[OFF_DIM..OFF_DIM + 4]) as usize;
            let on_disk_cap = LittleEndian::read_u32(&map[OFF_CAPACITY..OFF_CAPACITY + 4]) as usize;
            if on_disk_dim != dim || on_disk_cap != capacity {
                return Err(Error::invalid_state(format!(
                    "vector file geometry mismatch: file has dim={on_disk_dim} capacity={on_disk_cap}, \
                     requested dim={dim} capacity={capacity}"
                )));
            }
            LittleEndian::read_u32(&map[OFF_COUNT..OFF_COUNT + 4])
        } else {
            LittleEndian::write_u32(&mut map[OFF_DIM..OFF_DIM + 4], dim as u32);
            LittleEndian::write_u32(&mut map[OFF_COUNT..OFF_COUNT + 4], 0);
            LittleEndian::write_u32(&mut map[OFF_CAPACITY..OFF_CAPACITY + 4], capacity as u32);
            LittleEndian::write_u32(&mut map[OFF_MAGIC..OFF_MAGIC + 4], MAGIC);
            LittleEndian::write_u32(&mut map[OFF_VERSION..OFF_VERSION + 4], VERSION);
            map.flush_range(0, HEADER_LEN)?;
            0
        };

        if (count as usize) > capacity {
            return Err(Error::corrupted(
                0,
                format!("vector file count {count} exceeds capacity {capacity}"),
            ));
        }

        Ok(Self {
            map,
            ptr,
            dim,
            capacity,
            reserved: AtomicU32::new(count),
            committed: AtomicU32::new(count),
            path: path.to_path_buf(),
        })
    }

    /// Appends a vector, returning its dense internal id.
    ///
    /// The in-header count bump is the final store of the operation.
    pub fn append(&self, vector: &[f32]) -> Result<u32> {
        if vector.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }

        // Reserve a slot; never overshoot capacity.
        let id = loop {
            let cur = self.reserved.load(Ordering::Relaxed);
            if cur as usize >= self.capacity {
                return Err(Error::CapacityExceeded);
            }
            if self
                .reserved
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break cur;
            }
        };

        unsafe {
            let dst = self.ptr.add(self.slot_offset(id));
            std::ptr::copy_nonoverlapping(vector.as_ptr().cast::<u8>(), dst, self.dim * 4);
        }

        // Publish in id order so `count` always covers a fully-written prefix.
        while self
            .committed
            .compare_exchange_weak(id, id + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        self.header_count().store(id + 1, Ordering::Release);

        Ok(id)
    }

    /// Zero-copy view of a stored vector, for the SIMD kernels.
    ///
    /// # Panics
    /// Out-of-bounds ids are a caller precondition violation.
    #[inline]
    pub fn raw_slice(&self, id: u32) -> &[f32] {
        let count = self.committed.load(Ordering::Acquire);
        assert!(id < count, "vector id {id} out of bounds (count {count})");
        unsafe {
            let ptr = self.ptr.add(self.slot_offset(id)).cast::<f32>();
            std::slice::from_raw_parts(ptr, self.dim)
        }
    }

    /// Copies a stored vector out.
    pub fn get(&self, id: u32) -> Vec<f32> {
        self.raw_slice(id).to_vec()
    }

    pub fn count(&self) -> u32 {
        self.committed.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes the mapped region to disk.
    pub fn sync_to_disk(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Serializes the vectors covered by chunk `chunk_idx` (groups of
    /// `chunk_size` consecutive ids) as raw little-endian floats. Slots at or
    /// beyond `limit` are zeroed: the arena is shared between forks, and a
    /// snapshot must not leak vectors appended by other handles.
    pub fn chunk_bytes(&self, chunk_idx: u32, chunk_size: usize, limit: u32) -> Vec<u8> {
        let start = chunk_idx as usize * chunk_size;
        let end = (start + chunk_size).min(self.capacity);
        assert!(start < end, "vector chunk {chunk_idx} out of range");
        let len = (end - start) * self.dim * 4;
        let mut out = unsafe {
            let src = self.ptr.add(self.slot_offset(start as u32));
            std::slice::from_raw_parts(src, len).to_vec()
        };
        let visible = (limit as usize).clamp(start, end) - start;
        out[visible * self.dim * 4..].fill(0);
        out
    }

    /// Expected serialized length of vector chunk `chunk_idx`.
    pub fn chunk_len(&self, chunk_idx: u32, chunk_size: usize) -> usize {
        let start = chunk_idx as usize * chunk_size;
        let end = (start + chunk_size).min(self.capacity);
        end.saturating_sub(start) * self.dim * 4
    }

    /// Hydrates a chunk of vectors from a serialized blob (cold load path).
    /// Not safe to interleave with concurrent appends to the same slots.
    pub fn write_chunk_bytes(&self, chunk_idx: u32, chunk_size: usize, bytes: &[u8]) -> Result<()> {
        let expected = self.chunk_len(chunk_idx, chunk_size);
        if bytes.len() != expected {
            return Err(Error::corrupted(
                u64::from(chunk_idx),
                format!("vector chunk length {} != expected {expected}", bytes.len()),
            ));
        }
        let start = chunk_idx as usize * chunk_size;
        unsafe {
            let dst = self.ptr.add(self.slot_offset(start as u32));
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        Ok(())
    }

    /// Raises the committed watermark after hydration.
    pub fn publish_count(&self, count: u32) {
        assert!(count as usize <= self.capacity);
        self.reserved.fetch_max(count, Ordering::AcqRel);
        self.committed.fetch_max(count, Ordering::AcqRel);
        self.header_count().fetch_max(count, Ordering::Release);
    }

    #[inline]
    fn slot_offset(&self, id: u32) -> usize {
        HEADER_LEN + id as usize * self.dim * 4
    }

    #[inline]
    fn header_count(&self) -> &AtomicU32 {
        // Offset 4 in a page-aligned mapping: u32-aligned.
        unsafe { &*self.ptr.add(OFF_COUNT).cast::<AtomicU32>() }
    }
}
