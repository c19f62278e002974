// Copyright 2025 Rangekv Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HNSW (Hierarchical Navigable Small World) index for approximate
//! nearest neighbor search
//!
//! # Parameters
//! - `m`: max connections per node per layer (default: 16, doubled at
//!   layer 0)
//! - `ef_construction`: beam width during build (default: 200)
//! - `ef_search`: beam width during search (default: 200)
//!
//! Deletes tombstone the node: it keeps routing traffic through the graph
//! but never appears in results. Upserting an existing id tombstones the
//! old node and inserts a fresh one.

use std::collections::BinaryHeap;
use std::fs;
use std::path::Path;

use rustc_hash::FxHashMap;

use crate::core::{Error, Result};
use crate::storage::index::distance::{distance, normalize, MetricType};
use crate::storage::index::{PreFilter, VectorIndex};

const FILE_MAGIC: &[u8; 8] = b"RKVHNSW1";

pub const DEFAULT_M: usize = 16;
pub const DEFAULT_EF_CONSTRUCTION: usize = 200;
pub const DEFAULT_EF_SEARCH: usize = 200;

// ─────────────────────────────────────────────────────────────
// Heap helpers
// ─────────────────────────────────────────────────────────────

/// Max-heap entry (farthest first — for pruning the result set)
struct MaxEntry {
    distance: f32,
    node: u32,
}

impl PartialEq for MaxEntry {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}
impl Eq for MaxEntry {}
impl PartialOrd for MaxEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MaxEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance.total_cmp(&other.distance)
    }
}

/// Min-heap entry (closest first — for candidate exploration)
struct MinEntry {
    distance: f32,
    node: u32,
}

impl PartialEq for MinEntry {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}
impl Eq for MinEntry {}
impl PartialOrd for MinEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MinEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed for min-heap behavior in BinaryHeap (which is max-heap)
        other.distance.total_cmp(&self.distance)
    }
}

// ─────────────────────────────────────────────────────────────
// Graph
// ─────────────────────────────────────────────────────────────

struct HnswNode {
    /// neighbors[layer] = node ids connected at that layer
    neighbors: Vec<Vec<u32>>,
}

/// HNSW graph index
pub struct HnswIndex {
    dimension: usize,
    metric: MetricType,
    m: usize,
    ef_construction: usize,
    ef_search: usize,
    level_mult: f64,

    nodes: Vec<HnswNode>,
    /// Row-major vector data, parallel to `nodes`
    vectors: Vec<f32>,
    /// External ids, parallel to `nodes`
    node_ids: Vec<i64>,
    /// Live external id → node
    id_map: FxHashMap<i64, u32>,
    /// Tombstone bitset, 1 bit per node
    deleted: Vec<u64>,
    deleted_count: usize,

    entry_point: Option<u32>,
    max_level: usize,
}

impl HnswIndex {
    pub fn new(dimension: usize, metric: MetricType) -> Self {
        Self::with_params(dimension, metric, DEFAULT_M, DEFAULT_EF_CONSTRUCTION, DEFAULT_EF_SEARCH)
    }

    pub fn with_params(
        dimension: usize,
        metric: MetricType,
        m: usize,
        ef_construction: usize,
        ef_search: usize,
    ) -> Self {
        Self {
            dimension,
            metric,
            m: m.max(2),
            ef_construction: ef_construction.max(m),
            ef_search: ef_search.max(1),
            level_mult: 1.0 / (m.max(2) as f64).ln(),
            nodes: Vec::new(),
            vectors: Vec::new(),
            node_ids: Vec::new(),
            id_map: FxHashMap::default(),
            deleted: Vec::new(),
            deleted_count: 0,
            entry_point: None,
            max_level: 0,
        }
    }

    fn vector(&self, node: u32) -> &[f32] {
        let at = node as usize * self.dimension;
        &self.vectors[at..at + self.dimension]
    }

    fn node_distance(&self, node: u32, query: &[f32]) -> f32 {
        distance(self.metric, query, self.vector(node))
    }

    fn is_deleted(&self, node: u32) -> bool {
        let (word, bit) = (node as usize / 64, node as usize % 64);
        self.deleted.get(word).map(|w| w & (1 << bit) != 0).unwrap_or(false)
    }

    fn set_deleted(&mut self, node: u32) {
        let (word, bit) = (node as usize / 64, node as usize % 64);
        if word >= self.deleted.len() {
            self.deleted.resize(word + 1, 0);
        }
        self.deleted[word] |= 1 << bit;
    }

    fn max_neighbors(&self, level: usize) -> usize {
        if level == 0 {
            self.m * 2
        } else {
            self.m
        }
    }

    fn random_level(&self) -> usize {
        let r: f64 = rand::random::<f64>().max(1e-15);
        (-r.ln() * self.level_mult) as usize
    }

    /// Greedy descent toward the query on one layer
    fn greedy_closest(&self, query: &[f32], mut ep: u32, level: usize) -> u32 {
        let mut best = self.node_distance(ep, query);
        loop {
            let mut improved = false;
            for &neighbor in &self.nodes[ep as usize].neighbors[level] {
                let d = self.node_distance(neighbor, query);
                if d < best {
                    best = d;
                    ep = neighbor;
                    improved = true;
                }
            }
            if !improved {
                return ep;
            }
        }
    }

    /// Beam search on one layer. `keep` decides which visited nodes may
    /// enter the result set; every node still routes the traversal, so a
    /// filtered or tombstoned node never hides its neighborhood.
    fn search_layer(
        &self,
        query: &[f32],
        entry: u32,
        ef: usize,
        level: usize,
        keep: &dyn Fn(u32) -> bool,
    ) -> Vec<(u32, f32)> {
        let mut visited = vec![false; self.nodes.len()];
        let mut candidates: BinaryHeap<MinEntry> = BinaryHeap::new();
        let mut result: BinaryHeap<MaxEntry> = BinaryHeap::new();

        let entry_distance = self.node_distance(entry, query);
        visited[entry as usize] = true;
        candidates.push(MinEntry {
            distance: entry_distance,
            node: entry,
        });
        if keep(entry) {
            result.push(MaxEntry {
                distance: entry_distance,
                node: entry,
            });
        }

        while let Some(current) = candidates.pop() {
            if result.len() >= ef {
                if let Some(worst) = result.peek() {
                    if current.distance > worst.distance {
                        break;
                    }
                }
            }
            for &neighbor in &self.nodes[current.node as usize].neighbors[level] {
                if visited[neighbor as usize] {
                    continue;
                }
                visited[neighbor as usize] = true;
                let d = self.node_distance(neighbor, query);
                let admit = result.len() < ef
                    || result.peek().map(|w| d < w.distance).unwrap_or(true);
                if admit {
                    candidates.push(MinEntry {
                        distance: d,
                        node: neighbor,
                    });
                    if keep(neighbor) {
                        if result.len() >= ef {
                            result.pop();
                        }
                        result.push(MaxEntry {
                            distance: d,
                            node: neighbor,
                        });
                    }
                }
            }
        }

        let mut out: Vec<(u32, f32)> = result.into_iter().map(|e| (e.node, e.distance)).collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1));
        out
    }

    /// Keep the `m` closest candidates as neighbors
    fn select_neighbors(&self, candidates: &[(u32, f32)], m: usize) -> Vec<u32> {
        candidates.iter().take(m).map(|&(node, _)| node).collect()
    }

    /// Connect `node` to `neighbor` at `level`, pruning the neighbor's
    /// link list when it overflows
    fn connect(&mut self, node: u32, neighbor: u32, level: usize) {
        let cap = self.max_neighbors(level);
        {
            let links = &mut self.nodes[neighbor as usize].neighbors[level];
            if links.contains(&node) {
                return;
            }
            links.push(node);
            if links.len() <= cap {
                return;
            }
        }
        // Re-rank and keep the closest `cap`
        let base = self.vector(neighbor).to_vec();
        let mut ranked: Vec<(u32, f32)> = self.nodes[neighbor as usize].neighbors[level]
            .iter()
            .map(|&n| (n, distance(self.metric, &base, self.vector(n))))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        ranked.truncate(cap);
        self.nodes[neighbor as usize].neighbors[level] =
            ranked.into_iter().map(|(n, _)| n).collect();
    }

    fn insert(&mut self, id: i64, vector: Vec<f32>) {
        let node = self.nodes.len() as u32;
        let level = self.random_level();

        self.vectors.extend_from_slice(&vector);
        self.node_ids.push(id);
        self.nodes.push(HnswNode {
            neighbors: vec![Vec::new(); level + 1],
        });
        self.id_map.insert(id, node);

        let Some(mut ep) = self.entry_point else {
            self.entry_point = Some(node);
            self.max_level = level;
            return;
        };

        // Descend through layers above the new node's level
        for l in (level + 1..=self.max_level).rev() {
            ep = self.greedy_closest(&vector, ep, l);
        }

        // Link into each layer from the node's level down
        for l in (0..=level.min(self.max_level)).rev() {
            let candidates = self.search_layer(&vector, ep, self.ef_construction, l, &|_| true);
            let neighbors = self.select_neighbors(&candidates, self.max_neighbors(l));
            for &neighbor in &neighbors {
                self.connect(neighbor, node, l);
                self.connect(node, neighbor, l);
            }
            if let Some(&(closest, _)) = candidates.first() {
                ep = closest;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(node);
        }
    }

    fn prepared_query(&self, query: &[f32]) -> Result<Vec<f32>> {
        if query.len() != self.dimension {
            return Err(Error::illegal(format!(
                "vector dimension {} does not match index dimension {}",
                query.len(),
                self.dimension
            )));
        }
        let mut q = query.to_vec();
        if self.metric.normalizes() {
            normalize(&mut q);
        }
        Ok(q)
    }

    fn descend_to_bottom(&self, query: &[f32]) -> Option<u32> {
        let mut ep = self.entry_point?;
        for l in (1..=self.max_level).rev() {
            ep = self.greedy_closest(query, ep, l);
        }
        Some(ep)
    }
}

impl VectorIndex for HnswIndex {
    fn add_or_upsert(&mut self, rows: &[(i64, Vec<f32>)]) -> Result<()> {
        for (_, vector) in rows {
            if vector.len() != self.dimension {
                return Err(Error::illegal(format!(
                    "vector dimension {} does not match index dimension {}",
                    vector.len(),
                    self.dimension
                )));
            }
        }
        for (id, vector) in rows {
            if let Some(&old) = self.id_map.get(id) {
                self.set_deleted(old);
                self.deleted_count += 1;
            }
            let mut stored = vector.clone();
            if self.metric.normalizes() {
                normalize(&mut stored);
            }
            self.insert(*id, stored);
        }
        Ok(())
    }

    fn delete(&mut self, ids: &[i64]) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            if let Some(node) = self.id_map.remove(id) {
                self.set_deleted(node);
                self.deleted_count += 1;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&dyn PreFilter>,
    ) -> Result<Vec<(i64, f32)>> {
        if top_k == 0 || self.id_map.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.prepared_query(query)?;
        let Some(ep) = self.descend_to_bottom(&query) else {
            return Ok(Vec::new());
        };

        let ef = self.ef_search.max(top_k);
        let keep = |node: u32| -> bool {
            if self.is_deleted(node) {
                return false;
            }
            let id = self.node_ids[node as usize];
            // Stale nodes for re-inserted ids are tombstoned, so the map
            // always points at the live node
            if self.id_map.get(&id) != Some(&node) {
                return false;
            }
            filter.map(|f| f.matches(id)).unwrap_or(true)
        };
        let found = self.search_layer(&query, ep, ef, 0, &keep);
        Ok(found
            .into_iter()
            .take(top_k)
            .map(|(node, d)| (self.node_ids[node as usize], d))
            .collect())
    }

    fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        filter: Option<&dyn PreFilter>,
    ) -> Result<Vec<(i64, f32)>> {
        // Beam out with the construction width, then cut by radius
        let query = self.prepared_query(query)?;
        let Some(ep) = self.descend_to_bottom(&query) else {
            return Ok(Vec::new());
        };
        let keep = |node: u32| -> bool {
            if self.is_deleted(node) {
                return false;
            }
            let id = self.node_ids[node as usize];
            if self.id_map.get(&id) != Some(&node) {
                return false;
            }
            filter.map(|f| f.matches(id)).unwrap_or(true)
        };
        let found = self.search_layer(&query, ep, self.ef_search.max(self.ef_construction), 0, &keep);
        Ok(found
            .into_iter()
            .filter(|&(_, d)| d <= radius)
            .map(|(node, d)| (self.node_ids[node as usize], d))
            .collect())
    }

    fn count(&self) -> usize {
        self.id_map.len()
    }

    fn deleted_count(&self) -> usize {
        self.deleted_count
    }

    fn memory_size(&self) -> usize {
        let links: usize = self
            .nodes
            .iter()
            .map(|n| n.neighbors.iter().map(|l| l.len() * 4 + 24).sum::<usize>())
            .sum();
        self.vectors.len() * 4 + self.node_ids.len() * 8 + links + self.deleted.len() * 8
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn metric_type(&self) -> MetricType {
        self.metric
    }

    fn save(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::with_capacity(64 + self.vectors.len() * 4);
        buf.extend_from_slice(FILE_MAGIC);
        buf.push(self.metric.as_u8());
        buf.extend_from_slice(&(self.dimension as u32).to_be_bytes());
        buf.extend_from_slice(&(self.m as u32).to_be_bytes());
        buf.extend_from_slice(&(self.ef_construction as u32).to_be_bytes());
        buf.extend_from_slice(&(self.ef_search as u32).to_be_bytes());
        buf.extend_from_slice(&(self.nodes.len() as u64).to_be_bytes());
        buf.extend_from_slice(&(self.max_level as u32).to_be_bytes());
        buf.extend_from_slice(&self.entry_point.map(|e| e as i64).unwrap_or(-1).to_be_bytes());

        for id in &self.node_ids {
            buf.extend_from_slice(&id.to_be_bytes());
        }
        for component in &self.vectors {
            buf.extend_from_slice(&component.to_be_bytes());
        }
        for node in &self.nodes {
            buf.extend_from_slice(&(node.neighbors.len() as u32).to_be_bytes());
            for level in &node.neighbors {
                buf.extend_from_slice(&(level.len() as u32).to_be_bytes());
                for &link in level {
                    buf.extend_from_slice(&link.to_be_bytes());
                }
            }
        }
        let deleted_nodes: Vec<u32> = (0..self.nodes.len() as u32)
            .filter(|&n| self.is_deleted(n))
            .collect();
        buf.extend_from_slice(&(deleted_nodes.len() as u32).to_be_bytes());
        for node in deleted_nodes {
            buf.extend_from_slice(&node.to_be_bytes());
        }

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        fs::write(path, buf)?;
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let data = fs::read(path)?;
        if data.len() < 8 + 33 + 4 {
            return Err(Error::internal("hnsw index file truncated"));
        }
        let (body, crc_raw) = data.split_at(data.len() - 4);
        let stored_crc = u32::from_le_bytes([crc_raw[0], crc_raw[1], crc_raw[2], crc_raw[3]]);
        if crc32fast::hash(body) != stored_crc {
            return Err(Error::internal("hnsw index file checksum mismatch"));
        }
        if &body[..8] != FILE_MAGIC {
            return Err(Error::internal("hnsw index file bad magic"));
        }

        let mut pos = 8usize;
        let u32_at = |pos: &mut usize| -> Result<u32> {
            if *pos + 4 > body.len() {
                return Err(Error::internal("hnsw index file truncated"));
            }
            let mut b = [0u8; 4];
            b.copy_from_slice(&body[*pos..*pos + 4]);
            *pos += 4;
            Ok(u32::from_be_bytes(b))
        };

        let metric = MetricType::from_u8(body[pos])?;
        pos += 1;
        if metric != self.metric {
            return Err(Error::internal(format!(
                "metric type not match, file {:?}, index {:?}",
                metric, self.metric
            )));
        }
        let dimension = u32_at(&mut pos)? as usize;
        if dimension != self.dimension {
            return Err(Error::internal(format!(
                "dimension not match, file {}, index {}",
                dimension, self.dimension
            )));
        }
        let m = u32_at(&mut pos)? as usize;
        let ef_construction = u32_at(&mut pos)? as usize;
        let ef_search = u32_at(&mut pos)? as usize;

        if pos + 8 > body.len() {
            return Err(Error::internal("hnsw index file truncated"));
        }
        let mut b8 = [0u8; 8];
        b8.copy_from_slice(&body[pos..pos + 8]);
        let node_count = u64::from_be_bytes(b8) as usize;
        pos += 8;
        let max_level = u32_at(&mut pos)? as usize;
        if pos + 8 > body.len() {
            return Err(Error::internal("hnsw index file truncated"));
        }
        b8.copy_from_slice(&body[pos..pos + 8]);
        let entry_raw = i64::from_be_bytes(b8);
        pos += 8;

        let mut node_ids = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            if pos + 8 > body.len() {
                return Err(Error::internal("hnsw index file truncated"));
            }
            b8.copy_from_slice(&body[pos..pos + 8]);
            node_ids.push(i64::from_be_bytes(b8));
            pos += 8;
        }
        let mut vectors = Vec::with_capacity(node_count * dimension);
        let mut b4 = [0u8; 4];
        for _ in 0..node_count * dimension {
            if pos + 4 > body.len() {
                return Err(Error::internal("hnsw index file truncated"));
            }
            b4.copy_from_slice(&body[pos..pos + 4]);
            vectors.push(f32::from_be_bytes(b4));
            pos += 4;
        }
        let mut nodes = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let level_count = u32_at(&mut pos)? as usize;
            let mut neighbors = Vec::with_capacity(level_count);
            for _ in 0..level_count {
                let link_count = u32_at(&mut pos)? as usize;
                let mut links = Vec::with_capacity(link_count);
                for _ in 0..link_count {
                    links.push(u32_at(&mut pos)?);
                }
                neighbors.push(links);
            }
            nodes.push(HnswNode { neighbors });
        }

        let deleted_count = u32_at(&mut pos)? as usize;
        let mut deleted = vec![0u64; node_count.div_ceil(64)];
        let mut deleted_nodes = Vec::with_capacity(deleted_count);
        for _ in 0..deleted_count {
            deleted_nodes.push(u32_at(&mut pos)?);
        }
        for node in &deleted_nodes {
            let (word, bit) = (*node as usize / 64, *node as usize % 64);
            deleted[word] |= 1 << bit;
        }

        let mut id_map = FxHashMap::default();
        for (slot, id) in node_ids.iter().enumerate() {
            let node = slot as u32;
            let is_dead = {
                let (word, bit) = (slot / 64, slot % 64);
                deleted.get(word).map(|w| w & (1 << bit) != 0).unwrap_or(false)
            };
            if !is_dead {
                id_map.insert(*id, node);
            }
        }

        self.m = m;
        self.ef_construction = ef_construction;
        self.ef_search = ef_search;
        self.level_mult = 1.0 / (m.max(2) as f64).ln();
        self.nodes = nodes;
        self.vectors = vectors;
        self.node_ids = node_ids;
        self.id_map = id_map;
        self.deleted = deleted;
        self.deleted_count = deleted_nodes.len();
        self.max_level = max_level;
        self.entry_point = if entry_raw < 0 {
            None
        } else {
            Some(entry_raw as u32)
        };
        Ok(())
    }

    fn need_to_save(&self, log_behind: i64, threshold: i64) -> bool {
        !self.id_map.is_empty() && log_behind > threshold
    }
}
