//! The unit of structural sharing: neighbor lists for a fixed run of
//! consecutive nodes at one layer.
//!
//! Layout is `chunk_size` slots of `slot_width = m_layer + 1` ints each:
//! `[count, n0, n1, ...]` per node. Cells are atomics so a transient-mode
//! writer can mutate an owned chunk in place while lock-free readers
//! traverse it; the count word is published last with Release so a reader
//! admitting `count` entries sees them fully written.

use byteorder::{ByteOrder, LittleEndian};
use chronovec_core::{Error, NodeId, Result};
use std::sync::atomic::{AtomicI32, Ordering};

/// Encodes a chunk position as the 64-bit address `(layer << 32) | index`.
#[inline]
pub fn encode_addr(layer: u32, chunk_idx: u32) -> u64 {
    (u64::from(layer) << 32) | u64::from(chunk_idx)
}

#[inline]
pub fn decode_addr(addr: u64) -> (u32, u32) {
    ((addr >> 32) as u32, addr as u32)
}

#[derive(Debug)]
pub struct Chunk {
    chunk_size: usize,
    slot_width: usize,
    cells: Box<[AtomicI32]>,
}

impl Chunk {
    pub fn new(chunk_size: usize, slot_width: usize) -> Self {
        let cells = (0..chunk_size * slot_width)
            .map(|_| AtomicI32::new(0))
            .collect();
        Self {
            chunk_size,
            slot_width,
            cells,
        }
    }

    #[inline]
    pub fn slot_width(&self) -> usize {
        self.slot_width
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Max neighbors a slot can hold.
    #[inline]
    pub fn neighbor_cap(&self) -> usize {
        self.slot_width - 1
    }

    #[inline]
    fn base(&self, local: usize) -> usize {
        debug_assert!(local < self.chunk_size);
        local * self.slot_width
    }

    #[inline]
    pub fn neighbor_count(&self, local: usize) -> usize {
        let raw = self.cells[self.base(local)].load(Ordering::Acquire);
        (raw.max(0) as usize).min(self.neighbor_cap())
    }

    /// Appends the slot's neighbors to `out`, returning how many were added.
    pub fn read_neighbors(&self, local: usize, out: &mut Vec<NodeId>) -> usize {
        let base = self.base(local);
        let count = self.neighbor_count(local);
        out.reserve(count);
        for i in 0..count {
            let n = self.cells[base + 1 + i].load(Ordering::Relaxed);
            if n >= 0 {
                out.push(n as NodeId);
            }
        }
        count
    }

    /// Replaces the slot's neighbor list. Over-full input is truncated to
    /// the layer cap. Entries are written before the count (Release).
    pub fn write_neighbors(&self, local: usize, list: &[NodeId]) {
        let base = self.base(local);
        let n = list.len().min(self.neighbor_cap());
        for (i, &nbr) in list.iter().take(n).enumerate() {
            self.cells[base + 1 + i].store(nbr as i32, Ordering::Relaxed);
        }
        self.cells[base].store(n as i32, Ordering::Release);
    }

    /// Appends one neighbor if the slot holds fewer than `max`. No-op when
    /// full or when the neighbor is already present.
    pub fn push_neighbor(&self, local: usize, nbr: NodeId, max: usize) -> bool {
        let base = self.base(local);
        let count = self.neighbor_count(local);
        if count >= max.min(self.neighbor_cap()) {
            return false;
        }
        for i in 0..count {
            if self.cells[base + 1 + i].load(Ordering::Relaxed) == nbr as i32 {
                return false;
            }
        }
        self.cells[base + 1 + count].store(nbr as i32, Ordering::Relaxed);
        self.cells[base].store((count + 1) as i32, Ordering::Release);
        true
    }

    /// Removes one neighbor, compacting the list. Returns whether it was
    /// present.
    pub fn remove_neighbor(&self, local: usize, nbr: NodeId) -> bool {
        let base = self.base(local);
        let count = self.neighbor_count(local);
        let mut found = None;
        for i in 0..count {
            if self.cells[base + 1 + i].load(Ordering::Relaxed) == nbr as i32 {
                found = Some(i);
                break;
            }
        }
        let Some(at) = found else {
            return false;
        };
        // Shrink first so a racing reader never sees the hole.
        self.cells[base].store((count - 1) as i32, Ordering::Release);
        for i in at..count - 1 {
            let next = self.cells[base + 1 + i + 1].load(Ordering::Relaxed);
            self.cells[base + 1 + i].store(next, Ordering::Relaxed);
        }
        true
    }

    /// Copies the chunk for copy-on-write publication.
    pub fn deep_clone(&self) -> Self {
        let cells = self
            .cells
            .iter()
            .map(|c| AtomicI32::new(c.load(Ordering::Acquire)))
            .collect();
        Self {
            chunk_size: self.chunk_size,
            slot_width: self.slot_width,
            cells,
        }
    }

    pub fn byte_len(chunk_size: usize, slot_width: usize) -> usize {
        chunk_size * slot_width * 4
    }

    /// Fixed-length little-endian serialization; no per-chunk header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.cells.len() * 4];
        for (i, cell) in self.cells.iter().enumerate() {
            LittleEndian::write_i32(&mut out[i * 4..i * 4 + 4], cell.load(Ordering::Acquire));
        }
        out
    }

    pub fn from_bytes(chunk_size: usize, slot_width: usize, bytes: &[u8], addr: u64) -> Result<Self> {
        let expected = Self::byte_len(chunk_size, slot_width);
        if bytes.len() != expected {
            return Err(Error::corrupted(
                addr,
                format!("chunk blob length {} != expected {expected}", bytes.len()),
            ));
        }
        let cells = bytes
            .chunks_exact(4)
            .map(|b| AtomicI32::new(LittleEndian::read_i32(b)))
            .collect();
        Ok(Self {
            chunk_size,
            slot_width,
            cells,
        })
    }
}
