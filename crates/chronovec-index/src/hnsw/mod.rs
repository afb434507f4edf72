//! HNSW graph algorithms over the chunked edge store.

pub(crate) mod insert;
pub(crate) mod search;

use chronovec_core::NodeId;
use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;

/// Nearest-neighbor candidate. Orders as a min-heap on distance inside
/// `BinaryHeap` (which is a max-heap, hence the reversed comparison).
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct Candidate {
    pub id: NodeId,
    pub distance: f64,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(CmpOrdering::Equal)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Per-thread reusable search state. The visited set is a generation-marked
/// array: bumping the generation clears it lazily, so only words actually
/// touched since the last wrap are ever rewritten.
#[derive(Default)]
pub(crate) struct VisitedScratch {
    marks: Vec<u32>,
    generation: u32,
    pub candidates: BinaryHeap<Candidate>,
    pub results: BinaryHeap<std::cmp::Reverse<Candidate>>,
    pub neighbors: Vec<NodeId>,
}

impl VisitedScratch {
    pub fn prepare(&mut self, len: usize) -> u32 {
        if self.marks.len() < len {
            self.marks.resize(len, 0);
        }
        self.generation = self.generation.wrapping_add(1);
        if self.generation == 0 {
            self.marks.fill(0);
            self.generation = 1;
        }
        self.generation
    }

    /// Marks `id` visited; returns false if it already was this generation.
    #[inline]
    pub fn mark_visited(&mut self, id: NodeId) -> bool {
        let slot = &mut self.marks[id as usize];
        if *slot == self.generation {
            false
        } else {
            *slot = self.generation;
            true
        }
    }
}

thread_local! {
    pub(crate) static SCRATCH: RefCell<VisitedScratch> = RefCell::new(VisitedScratch::default());
}
