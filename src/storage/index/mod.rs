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

//! Secondary index wrappers
//!
//! A wrapper owns one in-memory index (vector or document) and keeps it on
//! the region's MVCC timeline: the transaction engine calls `on_commit`
//! exactly once per key per commit, in commit order. A reader-writer lock
//! guards the index — upserts take the writer side, searches the reader
//! side — and a small state machine gates availability:
//!
//! ```text
//! NotReady → Building → Ready → (BuildError | Rebuilding → Ready)
//! ```
//!
//! Wrappers never hold their region; they carry the region id and the key
//! range they were built for.

pub mod distance;
pub mod document;
pub mod flat;
pub mod hnsw;
pub mod rowcodec;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{info, warn};

use crate::core::{
    check_entity_id, check_ids_unique, DocumentWithId, Error, Result, ScalarValue, Ts,
    VectorWithId,
};
use crate::storage::engine::SnapshotView;
use crate::storage::mvcc::codec::decode_entity_id;
use crate::storage::mvcc::MvccReader;

pub use distance::MetricType;
pub use document::{tokenize, DocumentHit, DocumentIndex};
pub use flat::FlatIndex;
pub use hnsw::HnswIndex;
pub use rowcodec::{
    decode_document_row, decode_vector_row, encode_document_row, encode_vector_row,
};

/// Predicate consulted while the index enumerates candidates. Top-k is
/// taken over the set that passes, never filtered afterwards.
pub trait PreFilter: Send + Sync {
    fn matches(&self, id: i64) -> bool;
}

/// Allowlist filter over a resolved id set
pub struct SetFilter {
    ids: FxHashSet<i64>,
}

impl PreFilter for SetFilter {
    fn matches(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }
}

/// Client-supplied pre-filters: an explicit id allowlist and/or scalar
/// field equality predicates
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub id_allowlist: Option<Vec<i64>>,
    pub scalar_eq: Vec<(String, ScalarValue)>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.id_allowlist.is_none() && self.scalar_eq.is_empty()
    }
}

/// The capability set every vector index variant provides
pub trait VectorIndex: Send + Sync {
    fn add_or_upsert(&mut self, rows: &[(i64, Vec<f32>)]) -> Result<()>;
    fn delete(&mut self, ids: &[i64]) -> Result<usize>;
    fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&dyn PreFilter>,
    ) -> Result<Vec<(i64, f32)>>;
    fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        filter: Option<&dyn PreFilter>,
    ) -> Result<Vec<(i64, f32)>>;
    fn count(&self) -> usize;
    fn deleted_count(&self) -> usize;
    fn memory_size(&self) -> usize;
    fn dimension(&self) -> usize;
    fn metric_type(&self) -> MetricType;
    fn save(&self, path: &Path) -> Result<()>;
    fn load(&mut self, path: &Path) -> Result<()>;
    fn need_to_save(&self, log_behind: i64, threshold: i64) -> bool;
}

/// Vector index variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorIndexType {
    Flat,
    Hnsw,
}

/// Construction parameters for a region's vector index
#[derive(Debug, Clone)]
pub struct VectorIndexParameter {
    pub index_type: VectorIndexType,
    pub dimension: usize,
    pub metric: MetricType,
    /// HNSW: max connections per node per layer
    pub hnsw_m: usize,
    /// HNSW: beam width during build
    pub hnsw_ef_construction: usize,
    /// HNSW: beam width during search
    pub hnsw_ef_search: usize,
}

impl VectorIndexParameter {
    pub fn flat(dimension: usize, metric: MetricType) -> Self {
        Self {
            index_type: VectorIndexType::Flat,
            dimension,
            metric,
            hnsw_m: hnsw::DEFAULT_M,
            hnsw_ef_construction: hnsw::DEFAULT_EF_CONSTRUCTION,
            hnsw_ef_search: hnsw::DEFAULT_EF_SEARCH,
        }
    }

    pub fn hnsw(dimension: usize, metric: MetricType) -> Self {
        Self {
            index_type: VectorIndexType::Hnsw,
            ..Self::flat(dimension, metric)
        }
    }

    pub fn build(&self) -> Box<dyn VectorIndex> {
        match self.index_type {
            VectorIndexType::Flat => Box::new(FlatIndex::new(self.dimension, self.metric)),
            VectorIndexType::Hnsw => Box::new(HnswIndex::with_params(
                self.dimension,
                self.metric,
                self.hnsw_m,
                self.hnsw_ef_construction,
                self.hnsw_ef_search,
            )),
        }
    }
}

/// Wrapper lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IndexState {
    NotReady = 0,
    Building = 1,
    Ready = 2,
    Rebuilding = 3,
    BuildError = 4,
}

impl IndexState {
    fn from_u8(v: u8) -> IndexState {
        match v {
            1 => IndexState::Building,
            2 => IndexState::Ready,
            3 => IndexState::Rebuilding,
            4 => IndexState::BuildError,
            _ => IndexState::NotReady,
        }
    }
}

/// Shared lifecycle plumbing for both wrapper kinds
struct WrapperCore {
    region_id: i64,
    state: AtomicU8,
    last_error: Mutex<Option<String>>,
    /// Mutations applied since the last save
    writes_since_save: AtomicI64,
    /// Save-file generation counter
    generation: AtomicI64,
    /// Applied-log lag that triggers a save
    save_threshold: i64,
}

impl WrapperCore {
    fn new(region_id: i64, save_threshold: i64) -> Self {
        Self {
            region_id,
            state: AtomicU8::new(IndexState::NotReady as u8),
            last_error: Mutex::new(None),
            writes_since_save: AtomicI64::new(0),
            generation: AtomicI64::new(0),
            save_threshold,
        }
    }

    fn state(&self) -> IndexState {
        IndexState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: IndexState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn is_ready(&self) -> bool {
        self.state() == IndexState::Ready
    }

    fn check_ready(&self) -> Result<()> {
        match self.state() {
            IndexState::Ready => Ok(()),
            IndexState::BuildError => Err(Error::IndexBuildError {
                region_id: self.region_id,
                message: self
                    .last_error
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "build failed".to_string()),
            }),
            _ => Err(Error::IndexNotReady(self.region_id)),
        }
    }

    fn record_build_error(&self, message: String) {
        warn!(
            region_id = self.region_id,
            %message,
            "index build failed"
        );
        *self.last_error.lock() = Some(message);
        self.set_state(IndexState::BuildError);
    }

    fn begin_build(&self) -> IndexState {
        let next = if self.state() == IndexState::NotReady {
            IndexState::Building
        } else {
            IndexState::Rebuilding
        };
        self.set_state(next);
        next
    }
}

/// Resolve filters into one candidate id set (scalar predicates are
/// evaluated against the wrapper's scalar side-table)
fn resolve_filters(
    filters: &SearchFilters,
    scalars: &FxHashMap<i64, FxHashMap<String, ScalarValue>>,
) -> Option<SetFilter> {
    if filters.is_empty() {
        return None;
    }
    let mut ids: Option<FxHashSet<i64>> = filters
        .id_allowlist
        .as_ref()
        .map(|list| list.iter().copied().collect());

    if !filters.scalar_eq.is_empty() {
        let matching: FxHashSet<i64> = scalars
            .iter()
            .filter(|(_, fields)| {
                filters
                    .scalar_eq
                    .iter()
                    .all(|(name, want)| fields.get(name).map(|v| v.matches(want)).unwrap_or(false))
            })
            .map(|(&id, _)| id)
            .collect();
        ids = Some(match ids {
            Some(allow) => allow.intersection(&matching).copied().collect(),
            None => matching,
        });
    }
    ids.map(|ids| SetFilter { ids })
}

// =========================================================================
// Vector wrapper
// =========================================================================

/// A region's vector index plus its MVCC subscription state
pub struct VectorIndexWrapper {
    core: WrapperCore,
    parameter: VectorIndexParameter,
    index: RwLock<Box<dyn VectorIndex>>,
    /// id → scalar fields, for pre-filter resolution
    scalars: RwLock<FxHashMap<i64, FxHashMap<String, ScalarValue>>>,
}

impl VectorIndexWrapper {
    pub fn new(region_id: i64, parameter: VectorIndexParameter, save_threshold: i64) -> Arc<Self> {
        let index = parameter.build();
        Arc::new(Self {
            core: WrapperCore::new(region_id, save_threshold),
            parameter,
            index: RwLock::new(index),
            scalars: RwLock::new(FxHashMap::default()),
        })
    }

    pub fn region_id(&self) -> i64 {
        self.core.region_id
    }

    pub fn parameter(&self) -> &VectorIndexParameter {
        &self.parameter
    }

    pub fn state(&self) -> IndexState {
        self.core.state()
    }

    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    pub fn check_ready(&self) -> Result<()> {
        self.core.check_ready()
    }

    pub fn generation(&self) -> i64 {
        self.core.generation.load(Ordering::Acquire)
    }

    /// Mark a freshly created empty index as serving (new regions start
    /// with nothing to build from)
    pub fn mark_ready(&self) {
        self.core.set_state(IndexState::Ready);
    }

    /// Committed write subscription. `value` None means the key was
    /// deleted. Called in commit order per region.
    pub fn on_commit(&self, user_key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if !matches!(self.core.state(), IndexState::Ready | IndexState::Rebuilding) {
            // The next build pass reads this commit from the data CF
            return Ok(());
        }
        let id = decode_entity_id(user_key)?;
        match value {
            Some(raw) => {
                let row = decode_vector_row(raw)?;
                let mut index = self.index.write();
                index.add_or_upsert(&[(id, row.vector)])?;
                self.scalars.write().insert(id, row.scalar_fields);
            }
            None => {
                let removed = self.index.write().delete(&[id])?;
                self.scalars.write().remove(&id);
                if removed == 0 {
                    warn!(
                        region_id = self.core.region_id,
                        id, "delete for id not present in vector index"
                    );
                }
            }
        }
        self.core.writes_since_save.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Validated batch upsert used by the build paths and tests
    pub fn upsert_batch(&self, rows: &[VectorWithId]) -> Result<()> {
        if rows.is_empty() {
            return Err(Error::illegal("vector rows are empty"));
        }
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        for &id in &ids {
            check_entity_id(id)?;
        }
        check_ids_unique(&ids)?;

        let pairs: Vec<(i64, Vec<f32>)> =
            rows.iter().map(|r| (r.id, r.vector.clone())).collect();
        let mut index = self.index.write();
        index.add_or_upsert(&pairs)?;
        let mut scalars = self.scalars.write();
        for row in rows {
            scalars.insert(row.id, row.scalar_fields.clone());
        }
        self.core
            .writes_since_save
            .fetch_add(rows.len() as i64, Ordering::Relaxed);
        Ok(())
    }

    /// Ranked nearest neighbors over the filtered candidate set
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<(i64, f32)>> {
        self.check_ready()?;
        let filter = resolve_filters(filters, &self.scalars.read());
        self.index
            .read()
            .search(query, top_k, filter.as_ref().map(|f| f as &dyn PreFilter))
    }

    /// Unordered results within `radius`. For inner-product and cosine the
    /// radius arrives in similarity space and is flipped to distance space
    /// (`1 - r`) before traversal.
    pub fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        filters: &SearchFilters,
    ) -> Result<Vec<(i64, f32)>> {
        self.check_ready()?;
        let effective = match self.parameter.metric {
            MetricType::L2 => radius,
            MetricType::InnerProduct | MetricType::Cosine => 1.0 - radius,
        };
        let filter = resolve_filters(filters, &self.scalars.read());
        self.index.read().range_search(
            query,
            effective,
            filter.as_ref().map(|f| f as &dyn PreFilter),
        )
    }

    pub fn count(&self) -> usize {
        self.index.read().count()
    }

    pub fn deleted_count(&self) -> usize {
        self.index.read().deleted_count()
    }

    pub fn memory_size(&self) -> usize {
        self.index.read().memory_size()
    }

    pub fn dimension(&self) -> usize {
        self.parameter.dimension
    }

    pub fn metric_type(&self) -> MetricType {
        self.parameter.metric
    }

    fn file_path(&self, dir: &Path, generation: i64) -> PathBuf {
        dir.join(format!(
            "vector_{}_g{}.idx",
            self.core.region_id, generation
        ))
    }

    /// Persist under the next generation. Returns the written path.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let generation = self.core.generation.load(Ordering::Acquire) + 1;
        let path = self.file_path(dir, generation);
        self.index.read().save(&path)?;
        self.core.generation.store(generation, Ordering::Release);
        self.core.writes_since_save.store(0, Ordering::Relaxed);
        info!(
            region_id = self.core.region_id,
            generation,
            path = %path.display(),
            "vector index saved"
        );
        Ok(path)
    }

    /// Load the file for `expected_generation`. A missing or mismatched
    /// file is an error; callers fall back to [`Self::rebuild_from_range`].
    pub fn load(&self, dir: &Path, expected_generation: i64) -> Result<()> {
        let path = self.file_path(dir, expected_generation);
        if !path.exists() {
            return Err(Error::internal(format!(
                "vector index generation {} missing at {}",
                expected_generation,
                path.display()
            )));
        }
        {
            let mut index = self.index.write();
            index.load(&path)?;
        }
        self.core
            .generation
            .store(expected_generation, Ordering::Release);
        self.core.writes_since_save.store(0, Ordering::Relaxed);
        self.core.set_state(IndexState::Ready);
        Ok(())
    }

    /// Whether the applied-log lag warrants a save
    pub fn need_to_save(&self, log_behind: i64) -> bool {
        self.index
            .read()
            .need_to_save(log_behind, self.core.save_threshold)
            || self.core.writes_since_save.load(Ordering::Relaxed) > self.core.save_threshold
    }

    /// Rebuild from the live data CF: scan `[start_key, end_key)` at
    /// `read_ts` and replace the in-memory index wholesale. Used after
    /// split/merge, load failure, or corruption.
    pub fn rebuild_from_range(
        &self,
        snapshot: Arc<dyn SnapshotView>,
        start_key: &[u8],
        end_key: &[u8],
        read_ts: Ts,
    ) -> Result<usize> {
        let state = self.core.begin_build();
        info!(
            region_id = self.core.region_id,
            ?state,
            "vector index build from range started"
        );

        let mut index = self.index.write();
        let outcome = (|| -> Result<(Box<dyn VectorIndex>, FxHashMap<i64, FxHashMap<String, ScalarValue>>, usize)> {
            let mut fresh = self.parameter.build();
            let mut scalars = FxHashMap::default();
            let reader = MvccReader::new(snapshot);
            let mut cursor = start_key.to_vec();
            let mut total = 0usize;
            loop {
                let (rows, resume, _) = reader.scan(&cursor, end_key, read_ts, 1024, &[])?;
                for (key, value) in &rows {
                    let id = decode_entity_id(key)?;
                    let row = decode_vector_row(value)?;
                    fresh.add_or_upsert(&[(id, row.vector)])?;
                    scalars.insert(id, row.scalar_fields);
                    total += 1;
                }
                match resume {
                    Some(next) => cursor = next,
                    None => break,
                }
            }
            Ok((fresh, scalars, total))
        })();

        match outcome {
            Ok((fresh, scalars, total)) => {
                *index = fresh;
                *self.scalars.write() = scalars;
                drop(index);
                self.core.set_state(IndexState::Ready);
                *self.core.last_error.lock() = None;
                info!(
                    region_id = self.core.region_id,
                    rows = total,
                    "vector index build finished"
                );
                Ok(total)
            }
            Err(e) => {
                drop(index);
                self.core.record_build_error(e.to_string());
                Err(e)
            }
        }
    }
}

// =========================================================================
// Document wrapper
// =========================================================================

/// A region's document index plus its MVCC subscription state
pub struct DocumentIndexWrapper {
    core: WrapperCore,
    index: RwLock<DocumentIndex>,
}

impl DocumentIndexWrapper {
    pub fn new(region_id: i64, save_threshold: i64) -> Arc<Self> {
        Arc::new(Self {
            core: WrapperCore::new(region_id, save_threshold),
            index: RwLock::new(DocumentIndex::new()),
        })
    }

    pub fn region_id(&self) -> i64 {
        self.core.region_id
    }

    pub fn state(&self) -> IndexState {
        self.core.state()
    }

    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    pub fn check_ready(&self) -> Result<()> {
        self.core.check_ready()
    }

    pub fn generation(&self) -> i64 {
        self.core.generation.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.core.set_state(IndexState::Ready);
    }

    /// Committed write subscription, mirroring the vector wrapper
    pub fn on_commit(&self, user_key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if !matches!(self.core.state(), IndexState::Ready | IndexState::Rebuilding) {
            return Ok(());
        }
        let id = decode_entity_id(user_key)?;
        match value {
            Some(raw) => {
                let row = decode_document_row(raw)?;
                self.index.write().add_or_upsert(&[row])?;
            }
            None => {
                self.index.write().delete(&[id])?;
            }
        }
        self.core.writes_since_save.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Validated batch upsert used by the build paths and tests
    pub fn upsert_batch(&self, rows: &[DocumentWithId]) -> Result<()> {
        if rows.is_empty() {
            return Err(Error::illegal("document rows are empty"));
        }
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        for &id in &ids {
            check_entity_id(id)?;
        }
        check_ids_unique(&ids)?;
        self.index.write().add_or_upsert(rows)?;
        self.core
            .writes_since_save
            .fetch_add(rows.len() as i64, Ordering::Relaxed);
        Ok(())
    }

    /// Term search over one field; filters resolve against document fields
    pub fn search(
        &self,
        field: &str,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<DocumentHit>> {
        self.check_ready()?;
        let index = self.index.read();
        let filter = if filters.is_empty() {
            None
        } else {
            let allow: Option<FxHashSet<i64>> = filters
                .id_allowlist
                .as_ref()
                .map(|l| l.iter().copied().collect());
            let scalar_eq = &filters.scalar_eq;
            let mut ids = FxHashSet::default();
            for hit_id in index_ids(&index) {
                if let Some(allow) = &allow {
                    if !allow.contains(&hit_id) {
                        continue;
                    }
                }
                let doc = index.get(hit_id);
                let passes = doc
                    .map(|d| {
                        scalar_eq.iter().all(|(name, want)| {
                            d.fields.get(name).map(|v| v.matches(want)).unwrap_or(false)
                        })
                    })
                    .unwrap_or(false);
                if passes {
                    ids.insert(hit_id);
                }
            }
            Some(SetFilter { ids })
        };
        index.search(
            field,
            query,
            top_k,
            filter.as_ref().map(|f| f as &dyn PreFilter),
        )
    }

    pub fn get(&self, id: i64) -> Result<Option<DocumentWithId>> {
        self.check_ready()?;
        Ok(self.index.read().get(id).cloned())
    }

    pub fn count(&self) -> usize {
        self.index.read().count()
    }

    pub fn memory_size(&self) -> usize {
        self.index.read().memory_size()
    }

    fn file_path(&self, dir: &Path, generation: i64) -> PathBuf {
        dir.join(format!(
            "document_{}_g{}.idx",
            self.core.region_id, generation
        ))
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let generation = self.core.generation.load(Ordering::Acquire) + 1;
        let path = self.file_path(dir, generation);
        self.index.read().save(&path)?;
        self.core.generation.store(generation, Ordering::Release);
        self.core.writes_since_save.store(0, Ordering::Relaxed);
        info!(
            region_id = self.core.region_id,
            generation,
            path = %path.display(),
            "document index saved"
        );
        Ok(path)
    }

    pub fn load(&self, dir: &Path, expected_generation: i64) -> Result<()> {
        let path = self.file_path(dir, expected_generation);
        if !path.exists() {
            return Err(Error::internal(format!(
                "document index generation {} missing at {}",
                expected_generation,
                path.display()
            )));
        }
        self.index.write().load(&path)?;
        self.core
            .generation
            .store(expected_generation, Ordering::Release);
        self.core.writes_since_save.store(0, Ordering::Relaxed);
        self.core.set_state(IndexState::Ready);
        Ok(())
    }

    pub fn need_to_save(&self, log_behind: i64) -> bool {
        self.index
            .read()
            .need_to_save(log_behind, self.core.save_threshold)
            || self.core.writes_since_save.load(Ordering::Relaxed) > self.core.save_threshold
    }

    /// Rebuild from the live data CF, mirroring the vector wrapper
    pub fn rebuild_from_range(
        &self,
        snapshot: Arc<dyn SnapshotView>,
        start_key: &[u8],
        end_key: &[u8],
        read_ts: Ts,
    ) -> Result<usize> {
        let state = self.core.begin_build();
        info!(
            region_id = self.core.region_id,
            ?state,
            "document index build from range started"
        );

        let mut index = self.index.write();
        let outcome = (|| -> Result<(DocumentIndex, usize)> {
            let mut fresh = DocumentIndex::new();
            let reader = MvccReader::new(snapshot);
            let mut cursor = start_key.to_vec();
            let mut total = 0usize;
            loop {
                let (rows, resume, _) = reader.scan(&cursor, end_key, read_ts, 1024, &[])?;
                for (_, value) in &rows {
                    let row = decode_document_row(value)?;
                    fresh.add_or_upsert(std::slice::from_ref(&row))?;
                    total += 1;
                }
                match resume {
                    Some(next) => cursor = next,
                    None => break,
                }
            }
            Ok((fresh, total))
        })();

        match outcome {
            Ok((fresh, total)) => {
                *index = fresh;
                drop(index);
                self.core.set_state(IndexState::Ready);
                *self.core.last_error.lock() = None;
                info!(
                    region_id = self.core.region_id,
                    rows = total,
                    "document index build finished"
                );
                Ok(total)
            }
            Err(e) => {
                drop(index);
                self.core.record_build_error(e.to_string());
                Err(e)
            }
        }
    }
}

/// All live document ids (helper for filter resolution)
fn index_ids(index: &DocumentIndex) -> Vec<i64> {
    index.ids()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mvcc::codec::{encode_entity_key, PREFIX_CLIENT_TXN};

    fn vector_wrapper() -> Arc<VectorIndexWrapper> {
        let wrapper =
            VectorIndexWrapper::new(1, VectorIndexParameter::flat(4, MetricType::L2), 10000);
        wrapper.mark_ready();
        wrapper
    }

    #[test]
    fn test_state_gates_search() {
        let wrapper =
            VectorIndexWrapper::new(1, VectorIndexParameter::flat(4, MetricType::L2), 10000);
        assert_eq!(wrapper.state(), IndexState::NotReady);
        assert!(matches!(
            wrapper.search(&[0.0; 4], 1, &SearchFilters::default()),
            Err(Error::IndexNotReady(1))
        ));
        wrapper.mark_ready();
        assert!(wrapper.search(&[0.0; 4], 1, &SearchFilters::default()).is_ok());
    }

    #[test]
    fn test_on_commit_upsert_and_delete() {
        let wrapper = vector_wrapper();
        let key = encode_entity_key(PREFIX_CLIENT_TXN, 1, 42);
        let row = VectorWithId::new(42, vec![1.0, 0.0, 0.0, 0.0]);
        wrapper
            .on_commit(&key, Some(&encode_vector_row(&row)))
            .unwrap();
        assert_eq!(wrapper.count(), 1);

        let hits = wrapper
            .search(&[1.0, 0.0, 0.0, 0.0], 1, &SearchFilters::default())
            .unwrap();
        assert_eq!(hits[0], (42, 0.0));

        wrapper.on_commit(&key, None).unwrap();
        assert_eq!(wrapper.count(), 0);
    }

    #[test]
    fn test_upsert_batch_validation() {
        let wrapper = vector_wrapper();
        assert!(wrapper.upsert_batch(&[]).is_err());
        assert!(wrapper
            .upsert_batch(&[VectorWithId::new(0, vec![0.0; 4])])
            .is_err());
        assert!(wrapper
            .upsert_batch(&[
                VectorWithId::new(1, vec![0.0; 4]),
                VectorWithId::new(1, vec![1.0; 4]),
            ])
            .is_err());
    }

    #[test]
    fn test_scalar_prefilter() {
        let wrapper = vector_wrapper();
        wrapper
            .upsert_batch(&[
                VectorWithId::new(1, vec![0.0, 0.0, 0.0, 0.0])
                    .with_scalar("color", ScalarValue::Text("red".to_string())),
                VectorWithId::new(2, vec![0.1, 0.0, 0.0, 0.0])
                    .with_scalar("color", ScalarValue::Text("blue".to_string())),
            ])
            .unwrap();

        let filters = SearchFilters {
            id_allowlist: None,
            scalar_eq: vec![("color".to_string(), ScalarValue::Text("blue".to_string()))],
        };
        let hits = wrapper
            .search(&[0.0, 0.0, 0.0, 0.0], 1, &filters)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 2);
    }

    #[test]
    fn test_range_search_radius_flip_for_ip() {
        let wrapper = VectorIndexWrapper::new(
            1,
            VectorIndexParameter::flat(2, MetricType::InnerProduct),
            10000,
        );
        wrapper.mark_ready();
        wrapper
            .upsert_batch(&[
                VectorWithId::new(1, vec![1.0, 0.0]),
                VectorWithId::new(2, vec![0.0, 1.0]),
            ])
            .unwrap();
        // Similarity-space radius 0.5: only vectors with dot >= 0.5 qualify
        let hits = wrapper
            .range_search(&[1.0, 0.0], 0.5, &SearchFilters::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 1);
    }

    #[test]
    fn test_save_load_generation() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = vector_wrapper();
        wrapper
            .upsert_batch(&[VectorWithId::new(1, vec![1.0, 0.0, 0.0, 0.0])])
            .unwrap();
        wrapper.save(dir.path()).unwrap();
        assert_eq!(wrapper.generation(), 1);

        let restored =
            VectorIndexWrapper::new(1, VectorIndexParameter::flat(4, MetricType::L2), 10000);
        // Wrong generation: caller must fall back to rebuild
        assert!(restored.load(dir.path(), 2).is_err());
        restored.load(dir.path(), 1).unwrap();
        assert!(restored.is_ready());
        assert_eq!(restored.count(), 1);
    }

    #[test]
    fn test_document_wrapper_roundtrip() {
        let wrapper = DocumentIndexWrapper::new(1, 10000);
        wrapper.mark_ready();
        wrapper
            .upsert_batch(&[DocumentWithId::new(1)
                .with_field("title", ScalarValue::Text("storage engines".to_string()))
                .with_field("stars", ScalarValue::Int(5))])
            .unwrap();

        let hits = wrapper
            .search("title", "storage", 10, &SearchFilters::default())
            .unwrap();
        assert_eq!(hits.len(), 1);

        let filters = SearchFilters {
            id_allowlist: None,
            scalar_eq: vec![("stars".to_string(), ScalarValue::Int(4))],
        };
        assert!(wrapper.search("title", "storage", 10, &filters).unwrap().is_empty());
    }
}
