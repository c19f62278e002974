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

//! Store facade
//!
//! One entry point per RPC. Every operation validates first — region
//! existence, epoch, leadership, state gate, batch and size caps — and
//! only then touches the engine; a validation failure never reaches a
//! worker queue. Reads and searches route through the read pool, index
//! mutations through the write pool, and long-running maintenance
//! (index build, GC, backup) through a bounded background pool whose
//! depth backpressures new writes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::core::{
    DocumentWithId, Error, LockInfo, RequestContext, Result, Ts, TxnResultInfo, VectorWithId,
};
use crate::storage::backup::{BackupRunner, BackupStats};
use crate::storage::config::Config;
use crate::storage::engine::{MemEngine, RawEngine};
use crate::storage::index::{
    DocumentHit, DocumentIndexWrapper, SearchFilters, VectorIndexParameter, VectorIndexWrapper,
};
use crate::storage::mvcc::codec::{encode_entity_key, PREFIX_CLIENT_TXN};
use crate::storage::mvcc::{MvccReader, ReadOutcome};
use crate::storage::raftlog::{LocalLog, ReplicatedLog};
use crate::storage::region::{Region, RegionDefinition, RegionState, StoreMetaManager};
use crate::storage::scheduler::WorkerSet;
use crate::storage::stream::StreamManager;
use crate::storage::txn::{
    GcRunner, PessimisticLockRequest, PessimisticLockResult, PrewriteRequest, TxnEngine,
    TxnStatus,
};

/// Response of a (possibly streamed) scan
#[derive(Debug, Clone, Default)]
pub struct ScanResponse {
    pub rows: Vec<(Vec<u8>, Vec<u8>)>,
    /// Set when the scan continues server-side
    pub stream_id: Option<u64>,
    pub has_more: bool,
    /// Locks encountered; the client resolves and retries
    pub locks: Vec<LockInfo>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The per-store engine facade
pub struct Store {
    config: Config,
    engine: Arc<dyn RawEngine>,
    log: Arc<dyn ReplicatedLog>,
    txn: TxnEngine,
    meta: StoreMetaManager,
    backup: BackupRunner,
    read_workers: Arc<WorkerSet>,
    write_workers: Arc<WorkerSet>,
    background_workers: Arc<WorkerSet>,
    streams: StreamManager,
    cluster_read_only: AtomicBool,
}

impl Store {
    /// Open a store over the in-memory engine with inline replication
    pub fn open(config: Config) -> Arc<Self> {
        let engine: Arc<dyn RawEngine> = Arc::new(MemEngine::new());
        Self::open_with_engine(config, engine)
    }

    /// Open over a caller-supplied byte engine
    pub fn open_with_engine(config: Config, engine: Arc<dyn RawEngine>) -> Arc<Self> {
        let log: Arc<dyn ReplicatedLog> = Arc::new(LocalLog::new(engine.clone()));
        let read_workers = WorkerSet::new(
            "read",
            config.read_worker_count,
            config.worker_queue_capacity,
        );
        let write_workers = WorkerSet::new(
            "write",
            config.write_worker_count,
            config.worker_queue_capacity,
        );
        let background_workers = WorkerSet::new(
            "background",
            config.background_worker_count,
            config.worker_queue_capacity,
        );
        let streams = StreamManager::new(config.stream_ttl);
        Arc::new(Self {
            txn: TxnEngine::new(engine.clone(), log.clone()),
            meta: StoreMetaManager::new(engine.clone()),
            backup: BackupRunner::new(engine.clone(), log.clone()),
            engine,
            log,
            read_workers,
            write_workers,
            background_workers,
            streams,
            cluster_read_only: AtomicBool::new(false),
            config,
        })
    }

    /// Replay persisted metadata after restart
    pub fn recover(&self) -> Result<()> {
        self.meta.recover()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn meta(&self) -> &StoreMetaManager {
        &self.meta
    }

    pub fn raw_engine(&self) -> &Arc<dyn RawEngine> {
        &self.engine
    }

    pub fn set_cluster_read_only(&self, read_only: bool) {
        self.cluster_read_only.store(read_only, Ordering::Release);
    }

    pub fn shutdown(&self) {
        self.read_workers.shutdown();
        self.write_workers.shutdown();
        self.background_workers.shutdown();
    }

    // =========================================================================
    // Region administration
    // =========================================================================

    /// Register a new plain region in Normal state
    pub fn create_region(&self, definition: RegionDefinition) -> Result<Arc<Region>> {
        let region = Region::new(definition);
        region.set_state(RegionState::Normal);
        self.meta.region_meta().add_region(region.clone())?;
        info!(region_id = region.id(), "region created");
        Ok(region)
    }

    /// Register a region carrying a vector index (starts empty and Ready)
    pub fn create_vector_region(
        &self,
        definition: RegionDefinition,
        parameter: VectorIndexParameter,
    ) -> Result<Arc<Region>> {
        let region = self.create_region(definition)?;
        let wrapper = VectorIndexWrapper::new(
            region.id(),
            parameter,
            self.config.flat_need_save_count,
        );
        wrapper.mark_ready();
        region.set_vector_index(wrapper);
        Ok(region)
    }

    /// Register a region carrying a document index (starts empty and Ready)
    pub fn create_document_region(&self, definition: RegionDefinition) -> Result<Arc<Region>> {
        let region = self.create_region(definition)?;
        let wrapper = DocumentIndexWrapper::new(region.id(), self.config.flat_need_save_count);
        wrapper.mark_ready();
        region.set_document_index(wrapper);
        Ok(region)
    }

    /// Tear a region down through Tombstone → Deleting → Deleted
    pub fn drop_region(&self, region_id: i64) -> Result<()> {
        self.meta
            .region_meta()
            .update_state(region_id, RegionState::Tombstone)?;
        self.meta
            .region_meta()
            .update_state(region_id, RegionState::Deleting)?;
        self.meta
            .region_meta()
            .update_state(region_id, RegionState::Deleted)?;
        self.meta.raft_meta().delete(region_id)?;
        info!(region_id, "region dropped");
        Ok(())
    }

    /// Split `region_id` at `split_key`: the parent keeps the left half,
    /// the child serves `[split_key, old_end)`. Both epochs advance; both
    /// indexes (when present) rebuild from their new ranges.
    pub fn split_region(
        &self,
        region_id: i64,
        new_region_id: i64,
        split_key: Vec<u8>,
        job_id: i64,
    ) -> Result<Arc<Region>> {
        let parent = self
            .meta
            .region_meta()
            .get_region(region_id)
            .ok_or(Error::RegionNotFound(region_id))?;
        if !parent.check_key_in_range(&split_key) {
            return Err(Error::RangeInvalid(
                "split key outside parent range".to_string(),
            ));
        }
        let recorder = self.meta.change_recorder();
        recorder.add_event(job_id, region_id, "split begin")?;

        parent.set_state(RegionState::Splitting);
        parent.set_disable_change(true);

        let parent_def = parent.definition();
        let new_version = parent_def.epoch.version + 1;
        let child_def = RegionDefinition {
            id: new_region_id,
            epoch: crate::core::RegionEpoch::new(new_version, parent_def.epoch.conf_version),
            start_key: split_key.clone(),
            end_key: parent_def.end_key.clone(),
            peers: parent_def.peers.clone(),
            partition_id: parent_def.partition_id,
        };
        let child = Region::new(child_def);
        child.set_state(RegionState::Normal);
        self.meta.region_meta().add_region(child.clone())?;

        self.meta.region_meta().update_epoch_version_and_range(
            region_id,
            new_version,
            parent_def.start_key.clone(),
            split_key.clone(),
        )?;

        // The halves rebuild their secondary indexes from their new ranges
        if let Some(wrapper) = parent.vector_index() {
            let child_wrapper = VectorIndexWrapper::new(
                new_region_id,
                wrapper.parameter().clone(),
                self.config.flat_need_save_count,
            );
            child.set_vector_index(child_wrapper.clone());
            let snapshot = self.engine.snapshot();
            let read_ts = i64::MAX - 1;
            let (child_start, child_end) = child.range();
            child_wrapper.rebuild_from_range(snapshot.clone(), &child_start, &child_end, read_ts)?;
            let (parent_start, parent_end) = parent.range();
            wrapper.rebuild_from_range(snapshot, &parent_start, &parent_end, read_ts)?;
        }
        if let Some(wrapper) = parent.document_index() {
            let child_wrapper =
                DocumentIndexWrapper::new(new_region_id, self.config.flat_need_save_count);
            child.set_document_index(child_wrapper.clone());
            let snapshot = self.engine.snapshot();
            let read_ts = i64::MAX - 1;
            let (child_start, child_end) = child.range();
            child_wrapper.rebuild_from_range(snapshot.clone(), &child_start, &child_end, read_ts)?;
            let (parent_start, parent_end) = parent.range();
            wrapper.rebuild_from_range(snapshot, &parent_start, &parent_end, read_ts)?;
        }

        parent.set_disable_change(false);
        parent.set_state(RegionState::Normal);
        self.meta
            .region_meta()
            .update_state(region_id, RegionState::Normal)?;
        recorder.add_event(job_id, region_id, "split commit")?;
        info!(region_id, new_region_id, job_id, "region split");
        Ok(child)
    }

    // =========================================================================
    // Validation helpers
    // =========================================================================

    fn get_region_checked(&self, ctx: &RequestContext) -> Result<Arc<Region>> {
        if ctx.expired(now_ms()) {
            return Err(Error::Cancelled);
        }
        if ctx.region_id == 0 {
            return Err(Error::illegal("region_id is zero"));
        }
        let region = self
            .meta
            .region_meta()
            .get_region(ctx.region_id)
            .ok_or(Error::RegionNotFound(ctx.region_id))?;
        region.validate_epoch(ctx)?;
        region.validate_leader()?;
        region.update_last_serving_time(now_ms());
        Ok(region)
    }

    fn validate_write(&self, region: &Region, key_count: usize, payload: usize) -> Result<()> {
        if self.cluster_read_only.load(Ordering::Acquire) {
            return Err(Error::ClusterReadOnly);
        }
        region.validate_for_write()?;
        if key_count == 0 {
            return Err(Error::illegal("no keys in request"));
        }
        if key_count > self.config.max_batch_count {
            return Err(Error::BatchExceeded {
                got: key_count,
                max: self.config.max_batch_count,
            });
        }
        if payload > self.config.max_request_size {
            return Err(Error::RequestSizeExceeded {
                got: payload,
                max: self.config.max_request_size,
            });
        }
        if self.background_workers.pending_task_count() > self.config.max_background_task_count {
            return Err(Error::request_full("background tasks piled up"));
        }
        Ok(())
    }

    fn validate_read_ts(&self, region: &Region, read_ts: Ts) -> Result<()> {
        if read_ts < 0 {
            return Err(Error::illegal("read ts is negative"));
        }
        self.meta.safe_points().check_read_ts(region.id(), read_ts)
    }

    // =========================================================================
    // Transactional KV surface
    // =========================================================================

    pub fn txn_prewrite(
        &self,
        ctx: &RequestContext,
        req: PrewriteRequest,
    ) -> Result<Vec<TxnResultInfo>> {
        let region = self.get_region_checked(ctx)?;
        if req.mutations.len() > self.config.max_prewrite_count {
            return Err(Error::BatchExceeded {
                got: req.mutations.len(),
                max: self.config.max_prewrite_count,
            });
        }
        let payload: usize = req
            .mutations
            .iter()
            .map(|m| m.key.len() + m.value.len())
            .sum();
        self.validate_write(&region, req.mutations.len(), payload)?;
        let keys: Vec<Vec<u8>> = req.mutations.iter().map(|m| m.key.clone()).collect();
        region.validate_keys_in_range(&keys)?;
        if req.primary_lock.is_empty() {
            return Err(Error::KeyEmpty);
        }
        region.inc_serving_request_count();
        let outcome = self.txn.prewrite(&region, &req);
        region.dec_serving_request_count();
        outcome
    }

    pub fn txn_commit(
        &self,
        ctx: &RequestContext,
        keys: Vec<Vec<u8>>,
        start_ts: Ts,
        commit_ts: Ts,
    ) -> Result<()> {
        let region = self.get_region_checked(ctx)?;
        let payload: usize = keys.iter().map(|k| k.len()).sum();
        self.validate_write(&region, keys.len(), payload)?;
        region.validate_keys_in_range(&keys)?;
        self.txn.commit(&region, &keys, start_ts, commit_ts)
    }

    pub fn txn_pessimistic_lock(
        &self,
        ctx: &RequestContext,
        req: PessimisticLockRequest,
    ) -> Result<PessimisticLockResult> {
        let region = self.get_region_checked(ctx)?;
        let payload: usize = req.mutations.iter().map(|m| m.key.len()).sum();
        self.validate_write(&region, req.mutations.len(), payload)?;
        let keys: Vec<Vec<u8>> = req.mutations.iter().map(|m| m.key.clone()).collect();
        region.validate_keys_in_range(&keys)?;
        self.txn.pessimistic_lock(&region, &req)
    }

    pub fn txn_pessimistic_rollback(
        &self,
        ctx: &RequestContext,
        keys: Vec<Vec<u8>>,
        start_ts: Ts,
        for_update_ts: Ts,
    ) -> Result<()> {
        let region = self.get_region_checked(ctx)?;
        let payload: usize = keys.iter().map(|k| k.len()).sum();
        self.validate_write(&region, keys.len(), payload)?;
        self.txn
            .pessimistic_rollback(&region, &keys, start_ts, for_update_ts)
    }

    pub fn txn_batch_rollback(
        &self,
        ctx: &RequestContext,
        keys: Vec<Vec<u8>>,
        start_ts: Ts,
    ) -> Result<()> {
        let region = self.get_region_checked(ctx)?;
        let payload: usize = keys.iter().map(|k| k.len()).sum();
        self.validate_write(&region, keys.len(), payload)?;
        self.txn.batch_rollback(&region, &keys, start_ts)
    }

    pub fn txn_check_status(
        &self,
        ctx: &RequestContext,
        primary_key: Vec<u8>,
        lock_ts: Ts,
        caller_start_ts: Ts,
        current_ts: Ts,
    ) -> Result<TxnStatus> {
        let region = self.get_region_checked(ctx)?;
        if primary_key.is_empty() {
            return Err(Error::KeyEmpty);
        }
        self.txn
            .check_txn_status(&region, &primary_key, lock_ts, caller_start_ts, current_ts)
    }

    pub fn txn_resolve_lock(
        &self,
        ctx: &RequestContext,
        start_ts: Ts,
        commit_ts: Ts,
        keys: Vec<Vec<u8>>,
    ) -> Result<()> {
        let region = self.get_region_checked(ctx)?;
        self.txn.resolve_lock(&region, start_ts, commit_ts, &keys)
    }

    pub fn txn_heart_beat(
        &self,
        ctx: &RequestContext,
        primary_key: Vec<u8>,
        start_ts: Ts,
        advise_ttl: i64,
    ) -> Result<i64> {
        let region = self.get_region_checked(ctx)?;
        if primary_key.is_empty() {
            return Err(Error::KeyEmpty);
        }
        self.txn
            .heart_beat(&region, &primary_key, start_ts, advise_ttl)
    }

    /// Snapshot point read. The in-memory lock table answers first so a
    /// conflicting in-flight write is seen without touching storage.
    pub fn kv_get(&self, ctx: &RequestContext, key: Vec<u8>, read_ts: Ts) -> Result<ReadOutcome> {
        let region = self.get_region_checked(ctx)?;
        if key.is_empty() {
            return Err(Error::KeyEmpty);
        }
        region.validate_keys_in_range(std::slice::from_ref(&key))?;
        self.validate_read_ts(&region, read_ts)?;
        if let Some(hit) = region.lock_table().check_keys(
            std::slice::from_ref(&key),
            ctx.isolation_level,
            read_ts,
            &ctx.resolved_locks,
        ) {
            return Ok(ReadOutcome::Locked(hit.locked.unwrap()));
        }
        self.txn.mvcc_get(&region, &key, read_ts, &ctx.resolved_locks)
    }

    /// Range scan. A limit above `stream_message_max_limit_size` is
    /// clamped into chunks behind a server-side stream.
    pub fn kv_scan(
        &self,
        ctx: &RequestContext,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        read_ts: Ts,
        limit: usize,
    ) -> Result<ScanResponse> {
        let region = self.get_region_checked(ctx)?;
        self.validate_read_ts(&region, read_ts)?;
        let (region_start, region_end) = region.range();
        if !end_key.is_empty() && start_key >= end_key {
            return Err(Error::RangeInvalid("start_key >= end_key".to_string()));
        }
        let start_key = if start_key.is_empty() || start_key < region_start {
            region_start
        } else {
            start_key
        };
        let end_key = if end_key.is_empty() || (!region_end.is_empty() && end_key > region_end) {
            region_end
        } else {
            end_key
        };
        region.set_txn_access_max_ts(read_ts);

        // A limit above the cap is served in capped chunks under a stream
        let chunk = limit.min(self.config.stream_message_max_limit_size);

        if let Some(hit) = region.lock_table().check_range(
            &start_key,
            &end_key,
            ctx.isolation_level,
            read_ts,
            &ctx.resolved_locks,
        ) {
            return Ok(ScanResponse {
                locks: vec![hit.locked.unwrap()],
                ..Default::default()
            });
        }

        let snapshot = self.engine.snapshot();
        let reader = MvccReader::new(snapshot.clone());
        let (rows, resume, locks) =
            reader.scan(&start_key, &end_key, read_ts, chunk, &ctx.resolved_locks)?;

        let (stream_id, has_more) = match &resume {
            Some(next) => {
                let id = self.streams.open(
                    region.id(),
                    snapshot,
                    read_ts,
                    next.clone(),
                    end_key,
                    ctx.resolved_locks.clone(),
                );
                (Some(id), true)
            }
            None => (None, false),
        };
        Ok(ScanResponse {
            rows,
            stream_id,
            has_more,
            locks,
        })
    }

    /// Resume a streamed scan from its server-side cursor
    pub fn kv_scan_continue(&self, stream_id: u64, limit: usize) -> Result<ScanResponse> {
        let chunk = limit
            .max(1)
            .min(self.config.stream_message_max_limit_size);
        let state = self.streams.resume(stream_id)?;
        let (snapshot, read_ts, next_key, end_key, resolved) = {
            let guard = state.lock();
            (
                Arc::clone(&guard.snapshot),
                guard.read_ts,
                guard.next_key.clone(),
                guard.end_key.clone(),
                guard.resolved_locks.clone(),
            )
        };
        let reader = MvccReader::new(snapshot);
        let (rows, resume, locks) = reader.scan(&next_key, &end_key, read_ts, chunk, &resolved)?;
        match resume {
            Some(next) => {
                self.streams.advance(stream_id, next);
                Ok(ScanResponse {
                    rows,
                    stream_id: Some(stream_id),
                    has_more: true,
                    locks,
                })
            }
            None => {
                self.streams.close(stream_id);
                Ok(ScanResponse {
                    rows,
                    stream_id: None,
                    has_more: false,
                    locks,
                })
            }
        }
    }

    /// Advance the region's GC safe point and schedule a background pass
    pub fn gc(&self, ctx: &RequestContext, safe_point: Ts) -> Result<()> {
        let region = self.get_region_checked(ctx)?;
        self.meta.safe_points().update(region.id(), safe_point)?;
        let gc = GcRunner::new(self.engine.clone(), self.log.clone());
        let region_for_task = region.clone();
        let accepted = self.background_workers.execute_rr(Box::new(move || {
            let _ = gc.gc_region(&region_for_task, safe_point);
        }));
        if !accepted {
            return Err(Error::request_full("gc task queue full"));
        }
        Ok(())
    }

    // =========================================================================
    // Vector surface
    // =========================================================================

    fn vector_wrapper(&self, region: &Region) -> Result<Arc<VectorIndexWrapper>> {
        region
            .vector_index()
            .ok_or_else(|| Error::illegal(format!("region {} has no vector index", region.id())))
    }

    fn document_wrapper(&self, region: &Region) -> Result<Arc<DocumentIndexWrapper>> {
        region
            .document_index()
            .ok_or_else(|| Error::illegal(format!("region {} has no document index", region.id())))
    }

    /// Encode the user key for an entity row in this region's keyspace
    pub fn entity_key(region: &Region, id: i64) -> Vec<u8> {
        encode_entity_key(PREFIX_CLIENT_TXN, region.partition_id(), id)
    }

    /// Bridge a closure onto a worker pool and wait for its result. The
    /// closure owns everything it needs; on enqueue failure the reply
    /// still fires, carrying `RequestFull`.
    fn run_pooled<T: Send + 'static>(
        &self,
        pool: &WorkerSet,
        least_queue: bool,
        task: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> Result<T> {
        let (reply, inbox) = mpsc::channel::<Result<T>>();
        let done = reply.clone();
        let boxed: crate::storage::scheduler::Task = Box::new(move || {
            let _ = done.send(task());
        });
        let accepted = if least_queue {
            pool.execute_least_queue(boxed)
        } else {
            pool.execute_rr(boxed)
        };
        if !accepted {
            let _ = reply.send(Err(Error::request_full("worker queue full")));
        }
        inbox
            .recv()
            .unwrap_or_else(|_| Err(Error::internal("worker dropped reply")))
    }

    fn batch_checks(&self, count: usize) -> Result<()> {
        if count == 0 {
            return Err(Error::illegal("batch is empty"));
        }
        if count > self.config.max_batch_count {
            return Err(Error::BatchExceeded {
                got: count,
                max: self.config.max_batch_count,
            });
        }
        Ok(())
    }

    /// Ranked nearest-neighbor search. Expensive, so it dispatches via
    /// least-loaded queue when async search is enabled.
    pub fn vector_search(
        &self,
        ctx: &RequestContext,
        query: Vec<f32>,
        top_k: usize,
        filters: SearchFilters,
    ) -> Result<Vec<(i64, f32)>> {
        let region = self.get_region_checked(ctx)?;
        let wrapper = self.vector_wrapper(&region)?;
        wrapper.check_ready()?;
        if self.config.enable_async_search {
            self.run_pooled(&self.read_workers, true, move || {
                wrapper.search(&query, top_k, &filters)
            })
        } else {
            wrapper.search(&query, top_k, &filters)
        }
    }

    /// Nearest-neighbor search pinned to an MVCC timestamp. The in-memory
    /// index only mirrors the latest committed state, so a timestamped
    /// search runs exact over the MVCC view at `read_ts` instead — older
    /// history stays answerable until GC reclaims it.
    pub fn vector_search_at(
        &self,
        ctx: &RequestContext,
        query: Vec<f32>,
        top_k: usize,
        filters: SearchFilters,
        read_ts: Ts,
    ) -> Result<Vec<(i64, f32)>> {
        let region = self.get_region_checked(ctx)?;
        let wrapper = self.vector_wrapper(&region)?;
        wrapper.check_ready()?;
        self.validate_read_ts(&region, read_ts)?;
        let metric = wrapper.metric_type();
        let (start_key, end_key) = region.range();
        let snapshot = self.engine.snapshot();
        let resolved = ctx.resolved_locks.clone();

        let task = move || -> Result<Vec<(i64, f32)>> {
            use crate::storage::index::distance;
            let mut prepared = query.clone();
            if metric.normalizes() {
                distance::normalize(&mut prepared);
            }
            let reader = MvccReader::new(snapshot);
            let mut results: Vec<(i64, f32)> = Vec::new();
            let mut cursor = start_key;
            loop {
                let (rows, resume, _) = reader.scan(&cursor, &end_key, read_ts, 1024, &resolved)?;
                for (_, value) in &rows {
                    let row = crate::storage::index::decode_vector_row(value)?;
                    if let Some(allow) = &filters.id_allowlist {
                        if !allow.contains(&row.id) {
                            continue;
                        }
                    }
                    let passes = filters.scalar_eq.iter().all(|(name, want)| {
                        row.scalar_fields
                            .get(name)
                            .map(|v| v.matches(want))
                            .unwrap_or(false)
                    });
                    if !passes {
                        continue;
                    }
                    let mut stored = row.vector.clone();
                    if metric.normalizes() {
                        distance::normalize(&mut stored);
                    }
                    results.push((row.id, distance::distance(metric, &prepared, &stored)));
                }
                match resume {
                    Some(next) => cursor = next,
                    None => break,
                }
            }
            results.sort_by(|a, b| a.1.total_cmp(&b.1));
            results.truncate(top_k);
            Ok(results)
        };

        if self.config.enable_async_search {
            self.run_pooled(&self.read_workers, true, task)
        } else {
            task()
        }
    }

    /// Unordered within-radius search
    pub fn vector_range_search(
        &self,
        ctx: &RequestContext,
        query: Vec<f32>,
        radius: f32,
        filters: SearchFilters,
    ) -> Result<Vec<(i64, f32)>> {
        let region = self.get_region_checked(ctx)?;
        let wrapper = self.vector_wrapper(&region)?;
        wrapper.check_ready()?;
        if self.config.enable_async_search {
            self.run_pooled(&self.read_workers, true, move || {
                wrapper.range_search(&query, radius, &filters)
            })
        } else {
            wrapper.range_search(&query, radius, &filters)
        }
    }

    pub fn vector_count(&self, ctx: &RequestContext) -> Result<usize> {
        let region = self.get_region_checked(ctx)?;
        let wrapper = self.vector_wrapper(&region)?;
        wrapper.check_ready()?;
        if self.config.enable_async_count {
            self.run_pooled(&self.read_workers, false, move || Ok(wrapper.count()))
        } else {
            Ok(wrapper.count())
        }
    }

    /// Transactionally upsert vector rows: prewrite + commit over the
    /// entity keys, which drives the index through on_commit.
    pub fn vector_upsert(
        self: &Arc<Self>,
        ctx: &RequestContext,
        rows: Vec<VectorWithId>,
        start_ts: Ts,
        commit_ts: Ts,
    ) -> Result<Vec<TxnResultInfo>> {
        self.batch_checks(rows.len())?;
        let region = self.get_region_checked(ctx)?;
        let wrapper = self.vector_wrapper(&region)?;
        for row in &rows {
            crate::core::check_entity_id(row.id)?;
            if row.vector.len() != wrapper.dimension() {
                return Err(Error::illegal(format!(
                    "vector dimension {} does not match index dimension {}",
                    row.vector.len(),
                    wrapper.dimension()
                )));
            }
        }
        crate::core::check_ids_unique(&rows.iter().map(|r| r.id).collect::<Vec<_>>())?;

        let mutations: Vec<crate::core::Mutation> = rows
            .iter()
            .map(|row| {
                crate::core::Mutation::put(
                    Self::entity_key(&region, row.id),
                    crate::storage::index::encode_vector_row(row),
                )
            })
            .collect();
        self.transactional_apply(ctx, mutations, start_ts, commit_ts)
    }

    /// Transactionally delete vector rows by id
    pub fn vector_delete(
        self: &Arc<Self>,
        ctx: &RequestContext,
        ids: Vec<i64>,
        start_ts: Ts,
        commit_ts: Ts,
    ) -> Result<Vec<TxnResultInfo>> {
        self.batch_checks(ids.len())?;
        let region = self.get_region_checked(ctx)?;
        for &id in &ids {
            crate::core::check_entity_id(id)?;
        }
        crate::core::check_ids_unique(&ids)?;
        let mutations: Vec<crate::core::Mutation> = ids
            .iter()
            .map(|&id| crate::core::Mutation::delete(Self::entity_key(&region, id)))
            .collect();
        self.transactional_apply(ctx, mutations, start_ts, commit_ts)
    }

    fn transactional_apply(
        self: &Arc<Self>,
        ctx: &RequestContext,
        mutations: Vec<crate::core::Mutation>,
        start_ts: Ts,
        commit_ts: Ts,
    ) -> Result<Vec<TxnResultInfo>> {
        let primary = mutations[0].key.clone();
        let keys: Vec<Vec<u8>> = mutations.iter().map(|m| m.key.clone()).collect();
        let req = PrewriteRequest::new(mutations, primary, start_ts, 3000);
        let store = Arc::clone(self);
        let task_ctx = ctx.clone();
        let run = move || -> Result<Vec<TxnResultInfo>> {
            let results = store.txn_prewrite(&task_ctx, req)?;
            if !results.is_empty() {
                return Ok(results);
            }
            store.txn_commit(&task_ctx, keys, start_ts, commit_ts)?;
            Ok(Vec::new())
        };
        if self.config.enable_async_operation {
            self.run_pooled(&self.write_workers, false, run)
        } else {
            run()
        }
    }

    // =========================================================================
    // Document surface
    // =========================================================================

    pub fn document_search(
        &self,
        ctx: &RequestContext,
        field: String,
        query: String,
        top_k: usize,
        filters: SearchFilters,
    ) -> Result<Vec<DocumentHit>> {
        let region = self.get_region_checked(ctx)?;
        let wrapper = self.document_wrapper(&region)?;
        wrapper.check_ready()?;
        if self.config.enable_async_search {
            self.run_pooled(&self.read_workers, true, move || {
                wrapper.search(&field, &query, top_k, &filters)
            })
        } else {
            wrapper.search(&field, &query, top_k, &filters)
        }
    }

    pub fn document_count(&self, ctx: &RequestContext) -> Result<usize> {
        let region = self.get_region_checked(ctx)?;
        let wrapper = self.document_wrapper(&region)?;
        wrapper.check_ready()?;
        if self.config.enable_async_count {
            self.run_pooled(&self.read_workers, false, move || Ok(wrapper.count()))
        } else {
            Ok(wrapper.count())
        }
    }

    pub fn document_upsert(
        self: &Arc<Self>,
        ctx: &RequestContext,
        rows: Vec<DocumentWithId>,
        start_ts: Ts,
        commit_ts: Ts,
    ) -> Result<Vec<TxnResultInfo>> {
        self.batch_checks(rows.len())?;
        let region = self.get_region_checked(ctx)?;
        self.document_wrapper(&region)?;
        for row in &rows {
            crate::core::check_entity_id(row.id)?;
        }
        crate::core::check_ids_unique(&rows.iter().map(|r| r.id).collect::<Vec<_>>())?;
        let mutations: Vec<crate::core::Mutation> = rows
            .iter()
            .map(|row| {
                crate::core::Mutation::put(
                    Self::entity_key(&region, row.id),
                    crate::storage::index::encode_document_row(row),
                )
            })
            .collect();
        self.transactional_apply(ctx, mutations, start_ts, commit_ts)
    }

    pub fn document_delete(
        self: &Arc<Self>,
        ctx: &RequestContext,
        ids: Vec<i64>,
        start_ts: Ts,
        commit_ts: Ts,
    ) -> Result<Vec<TxnResultInfo>> {
        self.batch_checks(ids.len())?;
        let region = self.get_region_checked(ctx)?;
        self.document_wrapper(&region)?;
        for &id in &ids {
            crate::core::check_entity_id(id)?;
        }
        crate::core::check_ids_unique(&ids)?;
        let mutations: Vec<crate::core::Mutation> = ids
            .iter()
            .map(|&id| crate::core::Mutation::delete(Self::entity_key(&region, id)))
            .collect();
        self.transactional_apply(ctx, mutations, start_ts, commit_ts)
    }

    // =========================================================================
    // Index maintenance
    // =========================================================================

    /// Persist the region's vector index under the next generation
    pub fn vector_index_save(&self, ctx: &RequestContext, dir: PathBuf) -> Result<PathBuf> {
        let region = self.get_region_checked(ctx)?;
        let wrapper = self.vector_wrapper(&region)?;
        self.run_pooled(&self.background_workers, false, move || {
            wrapper.save(&dir)
        })
    }

    /// Load a saved generation; on failure callers rebuild from range
    pub fn vector_index_load(
        &self,
        ctx: &RequestContext,
        dir: PathBuf,
        generation: i64,
    ) -> Result<()> {
        let region = self.get_region_checked(ctx)?;
        let wrapper = self.vector_wrapper(&region)?;
        self.run_pooled(&self.background_workers, false, move || {
            wrapper.load(&dir, generation)
        })
    }

    /// Rebuild the vector index from the live data CF
    pub fn vector_index_rebuild(&self, ctx: &RequestContext) -> Result<usize> {
        let region = self.get_region_checked(ctx)?;
        let wrapper = self.vector_wrapper(&region)?;
        let snapshot = self.engine.snapshot();
        let (start_key, end_key) = region.range();
        self.run_pooled(&self.background_workers, false, move || {
            wrapper.rebuild_from_range(snapshot, &start_key, &end_key, i64::MAX - 1)
        })
    }

    /// Whether the index should be saved given the applied-log lag
    pub fn vector_index_need_save(&self, ctx: &RequestContext, log_behind: i64) -> Result<bool> {
        let region = self.get_region_checked(ctx)?;
        let wrapper = self.vector_wrapper(&region)?;
        Ok(wrapper.need_to_save(log_behind))
    }

    // =========================================================================
    // Backup / restore
    // =========================================================================

    pub fn backup_region(
        &self,
        ctx: &RequestContext,
        backup_ts: Ts,
        path: &Path,
    ) -> Result<BackupStats> {
        let region = self.get_region_checked(ctx)?;
        self.validate_read_ts(&region, backup_ts)?;
        self.backup.backup_region(&region, backup_ts, path)
    }

    pub fn restore_region(&self, ctx: &RequestContext, path: &Path) -> Result<BackupStats> {
        let region = self.get_region_checked(ctx)?;
        if self.cluster_read_only.load(Ordering::Acquire) {
            return Err(Error::ClusterReadOnly);
        }
        region.validate_for_write()?;
        self.backup.restore_region(&region, path)
    }
}
