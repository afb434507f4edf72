//! Query-time search: greedy descent, layer-0 beam, early termination,
//! and allow-set filtering.

use super::{Candidate, SCRATCH};
use crate::{SearchOptions, VectorIndex};
use chronovec_core::{Error, NodeId, Result, NO_ENTRY_POINT};
use std::time::{Duration, Instant};

struct Budget {
    used: u64,
    max: u64,
}

impl Budget {
    #[inline]
    fn exhausted(&self) -> bool {
        self.used >= self.max
    }
}

#[inline]
fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

impl VectorIndex {
    /// K-nearest over internal ids, ascending by distance. Deleted nodes are
    /// traversed for connectivity but never returned. Early-termination
    /// limits produce best-so-far results, not errors; an empty graph yields
    /// an empty result.
    pub fn search_internal(
        &self,
        query: &[f32],
        k: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<(NodeId, f64)>> {
        if query.len() != self.opts.dim {
            return Err(Error::DimensionMismatch {
                expected: self.opts.dim,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let entry = self.edges.entry_point();
        if entry == NO_ENTRY_POINT {
            return Ok(Vec::new());
        }
        let entry = entry as NodeId;
        let query = self.prepared_query(query);

        let deadline = opts
            .timeout_nanos
            .map(|n| Instant::now() + Duration::from_nanos(n));
        let mut budget = Budget {
            used: 0,
            max: opts.max_distance_computations.unwrap_or(u64::MAX),
        };
        // Effective beam: the per-query override never narrows below the
        // configured default, and never below k.
        let ef_default = self.runtime.ef_search();
        let ef = opts.ef.unwrap_or(ef_default).max(ef_default).max(k);

        // Zoom in: greedy descent from the top layer down to layer 1.
        let max_level = self.edges.current_max_level();
        let mut cur = entry;
        let mut cur_dist = self.counted_dist(&mut budget, cur, &query);
        let mut neighbors = Vec::new();
        'descent: for layer in (1..=max_level).rev() {
            loop {
                if expired(deadline) || budget.exhausted() {
                    break 'descent;
                }
                let mut improved = false;
                neighbors.clear();
                self.edges.get_neighbors_into(layer, cur, &mut neighbors)?;
                for &n in &neighbors {
                    if budget.exhausted() {
                        break;
                    }
                    let d = self.counted_dist(&mut budget, n, &query);
                    if d < cur_dist {
                        cur_dist = d;
                        cur = n;
                        improved = true;
                    }
                }
                if !improved {
                    break;
                }
            }
        }

        self.beam_layer0(cur, cur_dist, &query, k, ef, opts, deadline, &mut budget)
    }

    #[inline]
    fn counted_dist(&self, budget: &mut Budget, id: NodeId, query: &[f32]) -> f64 {
        budget.used += 1;
        self.dist_to_query(id, query)
    }

    #[allow(clippy::too_many_arguments)]
    fn beam_layer0(
        &self,
        start: NodeId,
        start_dist: f64,
        query: &[f32],
        k: usize,
        ef: usize,
        opts: &SearchOptions,
        deadline: Option<Instant>,
        budget: &mut Budget,
    ) -> Result<Vec<(NodeId, f64)>> {
        let allow = opts.allow.as_deref();
        let admissible = |id: NodeId| -> bool {
            !self.edges.is_deleted(id) && allow.is_none_or(|a| a.contains(id))
        };

        let patience_cfg = opts.patience.map(|p| {
            let needed = p
                .patience
                .unwrap_or_else(|| 7.max((0.3 * k as f64).ceil() as usize));
            (p.saturation, needed.max(1))
        });
        let mut saturated_streak = 0usize;

        let geo = self.edges.geometry().clone();

        SCRATCH.with(|cell| {
            let mut scratch = cell.borrow_mut();
            // Sized to the fixed capacity, not the live count: a racing
            // insert can hand us a neighbor id at the old count's edge.
            scratch.prepare(self.opts.capacity);

            let mut candidates = std::mem::take(&mut scratch.candidates);
            let mut results = std::mem::take(&mut scratch.results);
            let mut neighbors = std::mem::take(&mut scratch.neighbors);
            candidates.clear();
            results.clear();

            let first = Candidate {
                id: start,
                distance: start_dist,
            };
            candidates.push(first);
            if admissible(start) {
                results.push(std::cmp::Reverse(first));
            }
            scratch.mark_visited(start);

            while let Some(cand) = candidates.pop() {
                // Per-outer-iteration termination checks.
                if expired(deadline) || budget.exhausted() {
                    break;
                }
                if results.len() >= ef {
                    let worst = results.peek().map_or(f64::INFINITY, |r| r.0.distance);
                    if cand.distance > worst {
                        break;
                    }
                }

                // Zero-copy neighbor iteration straight off the chunk.
                let (ci, local) = geo.locate(cand.id);
                let Some(chunk) = self.edges.get_raw_chunk(0, ci)? else {
                    continue;
                };
                neighbors.clear();
                chunk.read_neighbors(local, &mut neighbors);

                let mut displacements = 0usize;
                for i in 0..neighbors.len() {
                    let n = neighbors[i];
                    if !scratch.mark_visited(n) {
                        continue;
                    }
                    if budget.exhausted() {
                        break;
                    }
                    let d = self.counted_dist(budget, n, query);
                    let worst = results.peek().map_or(f64::INFINITY, |r| r.0.distance);
                    if results.len() < ef || d < worst {
                        let c = Candidate { id: n, distance: d };
                        candidates.push(c);
                        if admissible(n) {
                            results.push(std::cmp::Reverse(c));
                            if results.len() > ef {
                                results.pop();
                                displacements += 1;
                            }
                        }
                    }
                }

                // Patience: stop once the top of the result set has been
                // stable for enough consecutive iterations.
                if let Some((saturation, needed)) = patience_cfg {
                    if results.len() >= k {
                        let displaced = displacements.min(k) as f64;
                        let overlap = (k as f64 - displaced) / k as f64;
                        if overlap >= saturation {
                            saturated_streak += 1;
                            if saturated_streak >= needed {
                                break;
                            }
                        } else {
                            saturated_streak = 0;
                        }
                    }
                }
            }

            let mut out: Vec<(NodeId, f64)> =
                results.drain().map(|r| (r.0.id, r.0.distance)).collect();
            out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            out.truncate(k);

            candidates.clear();
            neighbors.clear();
            scratch.candidates = candidates;
            scratch.results = results;
            scratch.neighbors = neighbors;
            Ok(out)
        })
    }
}
