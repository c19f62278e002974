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

//! Flat (brute-force) vector index
//!
//! Exact search over a dense row store. Upsert removes the old row for an
//! existing id before appending the new one; delete swaps the tail row
//! into the hole so the store stays dense. Search fans out over row
//! chunks with rayon and merges per-chunk top-k heaps.

use std::collections::BinaryHeap;
use std::fs;
use std::path::Path;

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::core::{Error, Result};
use crate::storage::index::distance::{distance, normalize, MetricType};
use crate::storage::index::{PreFilter, VectorIndex};

const FILE_MAGIC: &[u8; 8] = b"RKVFLAT1";

/// Rows per rayon work unit during search
const SEARCH_CHUNK: usize = 4096;

/// Max-heap entry so the heap top is the *worst* kept candidate
struct Candidate {
    distance: f32,
    id: i64,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance.total_cmp(&other.distance)
    }
}

/// Dense exact-search index
pub struct FlatIndex {
    dimension: usize,
    metric: MetricType,
    ids: Vec<i64>,
    /// Row-major vector data, `dimension` floats per row
    vectors: Vec<f32>,
    id_map: FxHashMap<i64, usize>,
}

impl FlatIndex {
    pub fn new(dimension: usize, metric: MetricType) -> Self {
        Self {
            dimension,
            metric,
            ids: Vec::new(),
            vectors: Vec::new(),
            id_map: FxHashMap::default(),
        }
    }

    fn row(&self, slot: usize) -> &[f32] {
        &self.vectors[slot * self.dimension..(slot + 1) * self.dimension]
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::illegal(format!(
                "vector dimension {} does not match index dimension {}",
                vector.len(),
                self.dimension
            )));
        }
        Ok(())
    }

    fn remove_slot(&mut self, slot: usize) {
        let last = self.ids.len() - 1;
        let removed_id = self.ids[slot];
        self.id_map.remove(&removed_id);
        if slot != last {
            let moved_id = self.ids[last];
            self.ids.swap(slot, last);
            let (head, tail) = self.vectors.split_at_mut(last * self.dimension);
            head[slot * self.dimension..(slot + 1) * self.dimension]
                .copy_from_slice(&tail[..self.dimension]);
            self.id_map.insert(moved_id, slot);
        }
        self.ids.pop();
        self.vectors.truncate(last * self.dimension);
    }

    /// Top-k over one chunk of rows, filter applied during enumeration
    fn chunk_top_k(
        &self,
        chunk_start: usize,
        chunk_len: usize,
        query: &[f32],
        top_k: usize,
        filter: Option<&dyn PreFilter>,
    ) -> BinaryHeap<Candidate> {
        let mut heap = BinaryHeap::with_capacity(top_k + 1);
        for slot in chunk_start..chunk_start + chunk_len {
            let id = self.ids[slot];
            if let Some(f) = filter {
                if !f.matches(id) {
                    continue;
                }
            }
            let d = distance(self.metric, query, self.row(slot));
            if heap.len() < top_k {
                heap.push(Candidate { distance: d, id });
            } else if let Some(worst) = heap.peek() {
                if d < worst.distance {
                    heap.pop();
                    heap.push(Candidate { distance: d, id });
                }
            }
        }
        heap
    }

    fn prepared_query(&self, query: &[f32]) -> Result<Vec<f32>> {
        self.check_dimension(query)?;
        let mut q = query.to_vec();
        if self.metric.normalizes() {
            normalize(&mut q);
        }
        Ok(q)
    }
}

impl VectorIndex for FlatIndex {
    fn add_or_upsert(&mut self, rows: &[(i64, Vec<f32>)]) -> Result<()> {
        for (_, vector) in rows {
            self.check_dimension(vector)?;
        }
        for (id, vector) in rows {
            if let Some(&slot) = self.id_map.get(id) {
                self.remove_slot(slot);
            }
            let mut stored = vector.clone();
            if self.metric.normalizes() {
                normalize(&mut stored);
            }
            self.id_map.insert(*id, self.ids.len());
            self.ids.push(*id);
            self.vectors.extend_from_slice(&stored);
        }
        Ok(())
    }

    fn delete(&mut self, ids: &[i64]) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            if let Some(&slot) = self.id_map.get(id) {
                self.remove_slot(slot);
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
        if top_k == 0 || self.ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.prepared_query(query)?;

        let chunk_bounds: Vec<(usize, usize)> = (0..self.ids.len())
            .step_by(SEARCH_CHUNK)
            .map(|start| (start, SEARCH_CHUNK.min(self.ids.len() - start)))
            .collect();
        let heaps: Vec<BinaryHeap<Candidate>> = chunk_bounds
            .par_iter()
            .map(|&(start, len)| self.chunk_top_k(start, len, &query, top_k, filter))
            .collect();

        let mut merged = BinaryHeap::with_capacity(top_k + 1);
        for heap in heaps {
            for candidate in heap {
                if merged.len() < top_k {
                    merged.push(candidate);
                } else if let Some(worst) = merged.peek() {
                    if candidate.distance < worst.distance {
                        merged.pop();
                        merged.push(candidate);
                    }
                }
            }
        }
        let mut results: Vec<(i64, f32)> =
            merged.into_iter().map(|c| (c.id, c.distance)).collect();
        results.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(results)
    }

    fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        filter: Option<&dyn PreFilter>,
    ) -> Result<Vec<(i64, f32)>> {
        let query = self.prepared_query(query)?;
        let mut results = Vec::new();
        for slot in 0..self.ids.len() {
            let id = self.ids[slot];
            if let Some(f) = filter {
                if !f.matches(id) {
                    continue;
                }
            }
            let d = distance(self.metric, &query, self.row(slot));
            if d <= radius {
                results.push((id, d));
            }
        }
        Ok(results)
    }

    fn count(&self) -> usize {
        self.ids.len()
    }

    fn deleted_count(&self) -> usize {
        0
    }

    fn memory_size(&self) -> usize {
        self.ids.len() * 8 + self.vectors.len() * 4 + self.id_map.len() * 24
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn metric_type(&self) -> MetricType {
        self.metric
    }

    fn save(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::with_capacity(32 + self.ids.len() * (8 + self.dimension * 4));
        buf.extend_from_slice(FILE_MAGIC);
        buf.push(self.metric.as_u8());
        buf.extend_from_slice(&(self.dimension as u32).to_be_bytes());
        buf.extend_from_slice(&(self.ids.len() as u64).to_be_bytes());
        for id in &self.ids {
            buf.extend_from_slice(&id.to_be_bytes());
        }
        for component in &self.vectors {
            buf.extend_from_slice(&component.to_be_bytes());
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        fs::write(path, buf)?;
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let data = fs::read(path)?;
        if data.len() < FILE_MAGIC.len() + 13 + 4 {
            return Err(Error::internal("flat index file truncated"));
        }
        let (body, crc_raw) = data.split_at(data.len() - 4);
        let stored_crc = u32::from_le_bytes([crc_raw[0], crc_raw[1], crc_raw[2], crc_raw[3]]);
        if crc32fast::hash(body) != stored_crc {
            return Err(Error::internal("flat index file checksum mismatch"));
        }
        if &body[..8] != FILE_MAGIC {
            return Err(Error::internal("flat index file bad magic"));
        }
        let metric = MetricType::from_u8(body[8])?;
        if metric != self.metric {
            return Err(Error::internal(format!(
                "metric type not match, file {:?}, index {:?}",
                metric, self.metric
            )));
        }
        let mut buf4 = [0u8; 4];
        buf4.copy_from_slice(&body[9..13]);
        let dimension = u32::from_be_bytes(buf4) as usize;
        if dimension != self.dimension {
            return Err(Error::internal(format!(
                "dimension not match, file {}, index {}",
                dimension, self.dimension
            )));
        }
        let mut buf8 = [0u8; 8];
        buf8.copy_from_slice(&body[13..21]);
        let count = u64::from_be_bytes(buf8) as usize;

        let expected = 21 + count * 8 + count * dimension * 4;
        if body.len() != expected {
            return Err(Error::internal("flat index file length mismatch"));
        }
        let mut ids = Vec::with_capacity(count);
        let mut pos = 21;
        for _ in 0..count {
            buf8.copy_from_slice(&body[pos..pos + 8]);
            ids.push(i64::from_be_bytes(buf8));
            pos += 8;
        }
        let mut vectors = Vec::with_capacity(count * dimension);
        for _ in 0..count * dimension {
            buf4.copy_from_slice(&body[pos..pos + 4]);
            vectors.push(f32::from_be_bytes(buf4));
            pos += 4;
        }
        let id_map = ids.iter().enumerate().map(|(slot, &id)| (id, slot)).collect();
        self.ids = ids;
        self.vectors = vectors;
        self.id_map = id_map;
        Ok(())
    }

    fn need_to_save(&self, log_behind: i64, threshold: i64) -> bool {
        !self.ids.is_empty() && log_behind > threshold
    }
}
