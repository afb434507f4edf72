//! Layered insertion, reverse-edge installation, and delete repair.

use super::{Candidate, SCRATCH};
use crate::{inflight, VectorIndex};
use chronovec_core::{NodeId, Result, NO_ENTRY_POINT};
use rand::Rng;
use std::collections::HashSet;

impl VectorIndex {
    /// Geometric level assignment: `floor(-ln(u) / ln(M))`, clamped.
    pub(crate) fn sample_level(&self) -> usize {
        let mut rng = rand::thread_rng();
        let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
        let level = (-u.ln() * (1.0 / (self.opts.m as f64).ln())) as usize;
        level.min(self.opts.max_level)
    }

    /// Inserts an already-appended vector into the graph.
    pub(crate) fn hnsw_insert(&self, id: NodeId, vector: &[f32]) -> Result<()> {
        let _inflight = inflight::register(self.identity, id);
        let node_level = self.sample_level();

        // Empty-graph fast path; on a lost race fall through to the normal
        // insert against the winner.
        loop {
            let entry = self.edges.entry_point();
            if entry != NO_ENTRY_POINT {
                break;
            }
            if self.edges.cas_entry_point(NO_ENTRY_POINT, i64::from(id)) {
                self.edges.set_max_level(node_level);
                return Ok(());
            }
        }

        let entry = self.edges.entry_point() as NodeId;
        let current_max = self.edges.current_max_level();

        // Phase 1: greedy descent through the layers above the node's level.
        let mut cur = if current_max > node_level {
            self.greedy_descent(entry, vector, current_max, node_level + 1)?.0
        } else {
            entry
        };

        // Phase 2: beam search and connect, from the top of the node down.
        let ef_construction = self.runtime.ef_construction().max(1);
        let peers = inflight::peers(self.identity, id);

        for layer in (0..=node_level.min(current_max)).rev() {
            let mut candidates = self.search_layer(cur, vector, layer, ef_construction)?;

            // Merge concurrent in-flight inserts as link candidates.
            for &peer in &peers {
                candidates.push(Candidate {
                    id: peer,
                    distance: self.dist_to_query(peer, vector),
                });
            }
            candidates.sort();
            candidates.reverse(); // Candidate orders as a min-heap; this is ascending.

            let m_max = self.opts.max_neighbors(layer);
            let selected = self.select_diverse(&candidates, m_max, id);
            self.edges.set_neighbors(layer, id, &selected)?;

            for &nbr in &selected {
                self.link_back(layer, nbr, id, m_max)?;
            }
            if let Some(&first) = selected.first() {
                cur = first;
            }
        }

        // Phase 3: entry-point promotion.
        if node_level > current_max {
            loop {
                let observed = self.edges.current_max_level();
                if node_level <= observed {
                    break;
                }
                if self.edges.cas_max_level(observed, node_level) {
                    self.edges.set_entry_point(i64::from(id));
                    break;
                }
            }
        }
        Ok(())
    }

    /// Installs `id` into `nbr`'s neighbor list; if the list is at capacity,
    /// re-runs diversity selection over the union.
    fn link_back(&self, layer: usize, nbr: NodeId, id: NodeId, m_max: usize) -> Result<()> {
        self.edges.update_neighbors(layer, nbr, |current| {
            if current.contains(&id) {
                return current.to_vec();
            }
            if current.len() < m_max {
                let mut next = current.to_vec();
                next.push(id);
                return next;
            }
            let mut union: Vec<Candidate> = current
                .iter()
                .copied()
                .chain(std::iter::once(id))
                .map(|c| Candidate {
                    id: c,
                    distance: self.dist_between(nbr, c),
                })
                .collect();
            union.sort();
            union.reverse();
            self.select_diverse(&union, m_max, nbr)
        })
    }

    /// HNSW diversity heuristic over distance-ascending candidates: accept a
    /// candidate only if it is at least as close to the query node as to
    /// every already-selected neighbor. The inserted node itself is skipped
    /// so concurrent batch builds never produce self-loops.
    pub(crate) fn select_diverse(
        &self,
        sorted_ascending: &[Candidate],
        m: usize,
        self_id: NodeId,
    ) -> Vec<NodeId> {
        let mut selected: Vec<Candidate> = Vec::with_capacity(m);
        let mut seen: HashSet<NodeId> = HashSet::with_capacity(sorted_ascending.len());
        for cand in sorted_ascending {
            if selected.len() >= m {
                break;
            }
            if cand.id == self_id || !seen.insert(cand.id) {
                continue;
            }
            let diverse = selected
                .iter()
                .all(|s| self.dist_between(cand.id, s.id) >= cand.distance);
            if diverse {
                selected.push(*cand);
            }
        }
        selected.into_iter().map(|c| c.id).collect()
    }

    /// Greedy descent from `from_layer` down to `to_layer` inclusive,
    /// moving to the closest neighbor until no improvement.
    pub(crate) fn greedy_descent(
        &self,
        start: NodeId,
        query: &[f32],
        from_layer: usize,
        to_layer: usize,
    ) -> Result<(NodeId, f64)> {
        let mut cur = start;
        let mut cur_dist = self.dist_to_query(cur, query);
        let mut neighbors = Vec::new();
        for layer in (to_layer..=from_layer).rev() {
            loop {
                let mut improved = false;
                neighbors.clear();
                self.edges.get_neighbors_into(layer, cur, &mut neighbors)?;
                for &n in &neighbors {
                    let d = self.dist_to_query(n, query);
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
        Ok((cur, cur_dist))
    }

    /// Construction-time beam search at one layer. Returns candidates in
    /// ascending distance order.
    pub(crate) fn search_layer(
        &self,
        entry: NodeId,
        query: &[f32],
        layer: usize,
        ef: usize,
    ) -> Result<Vec<Candidate>> {
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
                id: entry,
                distance: self.dist_to_query(entry, query),
            };
            candidates.push(first);
            results.push(std::cmp::Reverse(first));
            scratch.mark_visited(entry);

            while let Some(cand) = candidates.pop() {
                if results.len() >= ef {
                    let worst = results.peek().map_or(f64::INFINITY, |r| r.0.distance);
                    if cand.distance > worst {
                        break;
                    }
                }

                neighbors.clear();
                self.edges.get_neighbors_into(layer, cand.id, &mut neighbors)?;
                for i in 0..neighbors.len() {
                    let n = neighbors[i];
                    if !scratch.mark_visited(n) {
                        continue;
                    }
                    let d = self.dist_to_query(n, query);
                    let worst = results.peek().map_or(f64::INFINITY, |r| r.0.distance);
                    if results.len() < ef || d < worst {
                        let c = Candidate { id: n, distance: d };
                        candidates.push(c);
                        results.push(std::cmp::Reverse(c));
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }

            let mut out: Vec<Candidate> = results.drain().map(|r| r.0).collect();
            out.sort();
            out.reverse();

            candidates.clear();
            neighbors.clear();
            scratch.candidates = candidates;
            scratch.results = results;
            scratch.neighbors = neighbors;
            Ok(out)
        })
    }

    /// Repairs the neighborhood of a freshly soft-deleted node: every live
    /// neighbor drops its edge to the node and re-selects over the union of
    /// its remaining neighbors and the deleted node's neighbors. The node
    /// itself keeps its edges so traversal through it stays possible.
    pub(crate) fn repair_after_delete(&self, id: NodeId) -> Result<()> {
        let max_level = self.edges.current_max_level();
        let mut node_neighbors = Vec::new();
        for layer in 0..=max_level {
            node_neighbors.clear();
            self.edges.get_neighbors_into(layer, id, &mut node_neighbors)?;
            if node_neighbors.is_empty() {
                continue;
            }
            let m_max = self.opts.max_neighbors(layer);
            let bridge = node_neighbors.clone();
            for &nbr in &bridge {
                if self.edges.is_deleted(nbr) {
                    continue;
                }
                self.edges.update_neighbors(layer, nbr, |current| {
                    if !current.contains(&id) {
                        return current.to_vec();
                    }
                    let mut union: Vec<Candidate> = current
                        .iter()
                        .copied()
                        .filter(|&c| c != id)
                        .chain(bridge.iter().copied().filter(|&c| c != nbr && c != id))
                        .map(|c| Candidate {
                            id: c,
                            distance: self.dist_between(nbr, c),
                        })
                        .collect();
                    union.sort();
                    union.reverse();
                    self.select_diverse(&union, m_max, nbr)
                })?;
            }
        }

        if self.edges.entry_point() == i64::from(id) {
            self.promote_replacement_entry(id)?;
        }
        Ok(())
    }

    /// Finds a live entry point after the current one was deleted: prefer
    /// the deleted node's own neighbors top-down, then any live node, else
    /// the empty-graph sentinel.
    fn promote_replacement_entry(&self, deleted: NodeId) -> Result<()> {
        let max_level = self.edges.current_max_level();
        for layer in (0..=max_level).rev() {
            for n in self.edges.get_neighbors(layer, deleted)? {
                if !self.edges.is_deleted(n) {
                    self.edges.set_entry_point(i64::from(n));
                    return Ok(());
                }
            }
        }
        if let Some(&live) = self.ids.live_nodes().first() {
            self.edges.set_entry_point(i64::from(live));
        } else {
            self.edges.set_entry_point(NO_ENTRY_POINT);
        }
        Ok(())
    }
}
