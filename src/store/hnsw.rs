//! Hierarchical navigable small world graph over cosine distance.
//!
//! One graph lives inside every owner partition. Inserts are incremental;
//! removals only tombstone a node, which keeps routing through it intact.
//! The partition decides when enough tombstones piled up to rebuild.
//!
//! Based on the paper: "Efficient and Robust Approximate Nearest Neighbor Search
//! Using Hierarchical Navigable Small World Graphs"

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::store::similarity::{cosine_with_norms, l2_norm};

/// Upper bound on generated levels.
const MAX_LEVEL: usize = 16;

/// Recall/throughput knobs of the graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Max links per node on upper layers; layer 0 allows twice as many
    #[serde(default = "default_m")]
    pub m: usize,

    /// Candidate list width while inserting
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,

    /// Candidate list width while querying
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
}

fn default_m() -> usize {
    16
}

fn default_ef_construction() -> usize {
    100
}

fn default_ef_search() -> usize {
    64
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: default_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
        }
    }
}

impl HnswParams {
    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m * 2
        } else {
            self.m
        }
    }

    fn level_mult(&self) -> f64 {
        1.0 / (self.m.max(2) as f64).ln()
    }
}

#[derive(Debug, Clone)]
struct Node {
    handle: u64,
    vector: Vec<f32>,
    norm: f32,
    links: Vec<Vec<usize>>,
    deleted: bool,
}

#[derive(Debug, Clone, Copy)]
struct Scored {
    dist: f32,
    idx: usize,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.idx.cmp(&other.idx))
    }
}

/// A neighbour returned by [`HnswGraph::search`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub handle: u64,
    pub similarity: f32,
}

pub struct HnswGraph {
    params: HnswParams,
    nodes: Vec<Node>,
    entry_point: Option<usize>,
    max_level: usize,
    tombstones: usize,
    rng: StdRng,
}

impl HnswGraph {
    pub fn new(params: HnswParams, seed: u64) -> Self {
        Self {
            params,
            nodes: Vec::new(),
            entry_point: None,
            max_level: 0,
            tombstones: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Total node count including tombstones.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn live_len(&self) -> usize {
        self.nodes.len() - self.tombstones
    }

    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    fn random_level(&mut self) -> usize {
        let u: f64 = self.rng.random();
        let level = (-(1.0 - u).ln() * self.params.level_mult()).floor() as usize;
        level.min(MAX_LEVEL)
    }

    fn distance_to(&self, query: &[f32], query_norm: f32, idx: usize) -> f32 {
        let node = &self.nodes[idx];
        1.0 - cosine_with_norms(query, query_norm, &node.vector, node.norm)
    }

    /// Insert a vector under a caller-chosen handle and return its node index.
    pub fn insert(&mut self, handle: u64, vector: Vec<f32>) -> usize {
        let level = self.random_level();
        let norm = l2_norm(&vector);
        let idx = self.nodes.len();

        self.nodes.push(Node {
            handle,
            vector,
            norm,
            links: vec![Vec::new(); level + 1],
            deleted: false,
        });

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(idx);
            self.max_level = level;
            return idx;
        };

        let query = self.nodes[idx].vector.clone();

        // greedy descent through the layers above the new node
        let mut current = Scored {
            dist: self.distance_to(&query, norm, entry),
            idx: entry,
        };
        for layer in ((level + 1)..=self.max_level).rev() {
            current = self.greedy_closest(&query, norm, current, layer);
        }

        let mut entry_points = vec![current];
        for layer in (0..=level.min(self.max_level)).rev() {
            let found =
                self.search_layer(&query, norm, &entry_points, self.params.ef_construction, layer);

            let max_links = self.params.max_links(layer);
            let selected: Vec<usize> = found
                .iter()
                .filter(|s| s.idx != idx)
                .take(max_links)
                .map(|s| s.idx)
                .collect();

            self.nodes[idx].links[layer] = selected.clone();

            for neighbor in selected {
                self.nodes[neighbor].links[layer].push(idx);
                if self.nodes[neighbor].links[layer].len() > max_links {
                    self.prune_links(neighbor, layer, max_links);
                }
            }

            entry_points = found;
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(idx);
        }

        idx
    }

    /// Tombstone a node. It keeps routing queries but is never returned.
    pub fn mark_deleted(&mut self, idx: usize) {
        if let Some(node) = self.nodes.get_mut(idx) {
            if !node.deleted {
                node.deleted = true;
                self.tombstones += 1;
            }
        }
    }

    /// Approximate `k` nearest live neighbours, closest first.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<Neighbor> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        let norm = l2_norm(query);
        let mut current = Scored {
            dist: self.distance_to(query, norm, entry),
            idx: entry,
        };
        for layer in (1..=self.max_level).rev() {
            current = self.greedy_closest(query, norm, current, layer);
        }

        // widen by the tombstone count so deleted nodes don't eat the budget
        let ef = ef.max(k).saturating_add(self.tombstones.min(ef));
        self.search_layer(query, norm, &[current], ef, 0)
            .into_iter()
            .filter(|s| !self.nodes[s.idx].deleted)
            .take(k)
            .map(|s| Neighbor {
                handle: self.nodes[s.idx].handle,
                similarity: 1.0 - s.dist,
            })
            .collect()
    }

    fn greedy_closest(&self, query: &[f32], norm: f32, start: Scored, layer: usize) -> Scored {
        let mut best = start;
        let mut changed = true;
        while changed {
            changed = false;
            let Some(links) = self.nodes[best.idx].links.get(layer) else {
                break;
            };
            for &neighbor in links {
                let dist = self.distance_to(query, norm, neighbor);
                if dist < best.dist {
                    best = Scored { dist, idx: neighbor };
                    changed = true;
                }
            }
        }
        best
    }

    /// Beam search on one layer. Returns up to `ef` nodes sorted by distance.
    fn search_layer(
        &self,
        query: &[f32],
        norm: f32,
        entry_points: &[Scored],
        ef: usize,
        layer: usize,
    ) -> Vec<Scored> {
        let ef = ef.max(1);
        let mut visited: HashSet<usize> = HashSet::new();
        let mut candidates: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        let mut results: BinaryHeap<Scored> = BinaryHeap::new();

        for &ep in entry_points {
            if visited.insert(ep.idx) {
                candidates.push(Reverse(ep));
                results.push(ep);
            }
        }
        while results.len() > ef {
            results.pop();
        }

        while let Some(Reverse(current)) = candidates.pop() {
            if let Some(worst) = results.peek() {
                if results.len() >= ef && current.dist > worst.dist {
                    break;
                }
            }

            let Some(links) = self.nodes[current.idx].links.get(layer) else {
                continue;
            };
            for &neighbor in links {
                if !visited.insert(neighbor) {
                    continue;
                }
                let dist = self.distance_to(query, norm, neighbor);
                let admit = results.len() < ef
                    || results.peek().map(|worst| dist < worst.dist).unwrap_or(true);
                if admit {
                    let scored = Scored { dist, idx: neighbor };
                    candidates.push(Reverse(scored));
                    results.push(scored);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    fn prune_links(&mut self, idx: usize, layer: usize, max_links: usize) {
        let base = &self.nodes[idx];
        let mut scored: Vec<Scored> = base.links[layer]
            .iter()
            .map(|&other| Scored {
                dist: self.distance_to(&base.vector, base.norm, other),
                idx: other,
            })
            .collect();
        scored.sort();
        scored.dedup_by_key(|s| s.idx);
        scored.truncate(max_links);
        self.nodes[idx].links[layer] = scored.into_iter().map(|s| s.idx).collect();
    }
}
