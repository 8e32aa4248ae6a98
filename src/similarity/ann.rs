//! # Global ANN Index
//!
//! ## Purpose
//! An opt-in corpus-wide similarity index: an HNSW (hierarchical
//! navigable small world) graph over TF-IDF vectors of every
//! non-reserved section in one period, answering nearest-neighbor
//! queries without scanning the whole corpus.
//!
//! ## Key Features
//! - Built explicitly and in batch; never constructed on a query path
//! - Deterministic layer assignment, so rebuilding the same corpus
//!   yields the same graph
//! - Distance is 1 - cosine over the shared capped vocabulary

use super::{build_tfidf, cosine, tokenize, SimilarSection, SparseVector};
use crate::config::SimilarityConfig;
use crate::{Section, SectionPath};
use rayon::prelude::*;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::info;

struct IndexNode {
    path: SectionPath,
    heading: String,
    vector: SparseVector,
    /// Neighbor lists, one per graph layer 0..=level
    neighbors: Vec<Vec<usize>>,
}

/// Corpus-wide nearest-neighbor index.
pub struct GlobalIndex {
    nodes: Vec<IndexNode>,
    by_path: HashMap<SectionPath, usize>,
    entry_point: Option<usize>,
    max_level: usize,
    m: usize,
    ef_search: usize,
    min_similarity: f32,
}

#[derive(PartialEq)]
struct Candidate {
    dist: f32,
    id: usize,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .partial_cmp(&other.dist)
            .unwrap_or(Ordering::Equal)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl GlobalIndex {
    /// Build the index over a section set in one batch. Reserved
    /// sections never enter the graph.
    pub fn build(sections: &[Section], config: &SimilarityConfig) -> Self {
        let members: Vec<&Section> = sections.iter().filter(|s| !s.reserved).collect();
        let documents: Vec<Vec<String>> = members
            .par_iter()
            .map(|s| tokenize(&format!("{} {}", s.heading, s.text)))
            .collect();
        let vectors = build_tfidf(&documents, config.max_features);

        let mut index = Self {
            nodes: Vec::with_capacity(members.len()),
            by_path: HashMap::with_capacity(members.len()),
            entry_point: None,
            max_level: 0,
            m: config.hnsw.m.max(2),
            ef_search: config.hnsw.ef_search.max(1),
            min_similarity: config.min_similarity,
        };

        let ef_construction = config.hnsw.ef_construction.max(index.m);
        for (section, vector) in members.into_iter().zip(vectors) {
            index.insert(section, vector, ef_construction);
        }

        info!(
            sections = index.nodes.len(),
            layers = index.max_level + 1,
            "built global similarity index"
        );
        index
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nearest neighbors of an indexed section across the whole corpus,
    /// best first, the query section excluded.
    pub fn similar(&self, path: &SectionPath, limit: usize) -> Vec<SimilarSection> {
        let query_id = match self.by_path.get(path) {
            Some(&id) => id,
            None => return Vec::new(),
        };
        let query = &self.nodes[query_id].vector;

        // one extra slot because the query node is its own nearest hit
        let found = self.search(query, limit + 1);
        found
            .into_iter()
            .filter(|(id, _)| *id != query_id)
            .map(|(id, score)| SimilarSection {
                path: self.nodes[id].path.clone(),
                heading: self.nodes[id].heading.clone(),
                score,
            })
            .filter(|s| s.score >= self.min_similarity)
            .take(limit)
            .collect()
    }

    /// Greedy descent through the upper layers, then a beam search on
    /// layer 0. Returns (node id, cosine score) pairs, best first.
    fn search(&self, query: &SparseVector, k: usize) -> Vec<(usize, f32)> {
        let mut ep = match self.entry_point {
            Some(ep) => ep,
            None => return Vec::new(),
        };

        for layer in (1..=self.max_level).rev() {
            ep = self.greedy_closest(query, ep, layer);
        }

        let ef = self.ef_search.max(k);
        let mut results: Vec<Candidate> = self.search_layer(query, ep, ef, 0).into_vec();
        results.sort();
        results
            .into_iter()
            .take(k)
            .map(|c| (c.id, 1.0 - c.dist))
            .collect()
    }

    fn insert(&mut self, section: &Section, vector: SparseVector, ef_construction: usize) {
        let id = self.nodes.len();
        let level = self.random_level(id);
        self.nodes.push(IndexNode {
            path: section.path.clone(),
            heading: section.heading.clone(),
            vector,
            neighbors: vec![Vec::new(); level + 1],
        });
        self.by_path.insert(section.path.clone(), id);

        let mut ep = match self.entry_point {
            Some(ep) => ep,
            None => {
                self.entry_point = Some(id);
                self.max_level = level;
                return;
            }
        };

        let query = self.nodes[id].vector.clone();
        for layer in ((level + 1)..=self.max_level).rev() {
            ep = self.greedy_closest(&query, ep, layer);
        }

        for layer in (0..=level.min(self.max_level)).rev() {
            let mut found: Vec<Candidate> =
                self.search_layer(&query, ep, ef_construction, layer).into_vec();
            found.sort();

            // layer 0 tolerates twice the fan-out
            let max_links = if layer == 0 { self.m * 2 } else { self.m };
            let chosen: Vec<usize> = found.iter().take(self.m).map(|c| c.id).collect();
            if let Some(best) = found.first() {
                ep = best.id;
            }

            for &neighbor in &chosen {
                self.nodes[id].neighbors[layer].push(neighbor);
                self.nodes[neighbor].neighbors[layer].push(id);
                if self.nodes[neighbor].neighbors[layer].len() > max_links {
                    self.prune_neighbors(neighbor, layer, max_links);
                }
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(id);
        }
    }

    /// Keep only the `max_links` closest links of a node on one layer.
    fn prune_neighbors(&mut self, node: usize, layer: usize, max_links: usize) {
        let origin = self.nodes[node].vector.clone();
        let mut links: Vec<Candidate> = self.nodes[node].neighbors[layer]
            .iter()
            .map(|&id| Candidate {
                dist: 1.0 - cosine(&origin, &self.nodes[id].vector),
                id,
            })
            .collect();
        links.sort();
        links.truncate(max_links);
        self.nodes[node].neighbors[layer] = links.into_iter().map(|c| c.id).collect();
    }

    fn greedy_closest(&self, query: &SparseVector, start: usize, layer: usize) -> usize {
        let mut current = start;
        let mut current_dist = 1.0 - cosine(query, &self.nodes[current].vector);
        loop {
            let mut improved = false;
            for &neighbor in self.neighbors_at(current, layer) {
                let dist = 1.0 - cosine(query, &self.nodes[neighbor].vector);
                if dist < current_dist {
                    current = neighbor;
                    current_dist = dist;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search on one layer, returning up to `ef` closest candidates
    /// as a max-heap (worst on top).
    fn search_layer(
        &self,
        query: &SparseVector,
        entry: usize,
        ef: usize,
        layer: usize,
    ) -> BinaryHeap<Candidate> {
        let mut visited: HashSet<usize> = HashSet::new();
        visited.insert(entry);
        let entry_dist = 1.0 - cosine(query, &self.nodes[entry].vector);

        let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        frontier.push(Reverse(Candidate { dist: entry_dist, id: entry }));
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();
        results.push(Candidate { dist: entry_dist, id: entry });

        while let Some(Reverse(candidate)) = frontier.pop() {
            let worst = results.peek().map(|c| c.dist).unwrap_or(f32::MAX);
            if candidate.dist > worst && results.len() >= ef {
                break;
            }
            for &neighbor in self.neighbors_at(candidate.id, layer) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let dist = 1.0 - cosine(query, &self.nodes[neighbor].vector);
                let worst = results.peek().map(|c| c.dist).unwrap_or(f32::MAX);
                if results.len() < ef || dist < worst {
                    frontier.push(Reverse(Candidate { dist, id: neighbor }));
                    results.push(Candidate { dist, id: neighbor });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
        results
    }

    fn neighbors_at(&self, node: usize, layer: usize) -> &[usize] {
        self.nodes[node].neighbors.get(layer).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Geometric layer assignment, derived from the node id so the same
    /// corpus always builds the same graph.
    fn random_level(&self, id: usize) -> usize {
        let mut x = (id as u64).wrapping_add(0x9e37_79b9_7f4a_7c15);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        let unit = (x >> 11) as f64 / (1u64 << 53) as f64;
        let ml = 1.0 / (self.m as f64).ln();
        (-(unit.max(1e-12)).ln() * ml) as usize
    }
}
