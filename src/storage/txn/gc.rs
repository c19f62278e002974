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

//! MVCC garbage collection
//!
//! Walks the Write CF of one region and physically removes history below
//! the GC safe point. For each user key the newest visible record below
//! the safe point is retained — a read pinned exactly at the safe point
//! still needs it — everything older is deleted together with its Data CF
//! payload. Rollback and lock markers below the safe point are always
//! removable. The runner yields the thread between batches so a large
//! region cannot starve the write path.

use std::sync::Arc;

use tracing::{debug, info};

use crate::core::{Result, Ts};
use crate::storage::engine::{CfName, RawEngine, WriteBatch};
use crate::storage::mvcc::codec::{decode_ts_key, encode_data};
use crate::storage::mvcc::records::{WriteKind, WriteRecord};
use crate::storage::raftlog::ReplicatedLog;
use crate::storage::region::Region;

/// Records examined between cooperative yields
const YIELD_EVERY: usize = 512;

/// Deletions accumulated before a batch is proposed
const DELETE_BATCH: usize = 128;

/// Scan chunk size over the Write CF
const SCAN_BATCH: usize = 256;

/// Outcome counters for one GC pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub scanned: usize,
    pub deleted_writes: usize,
    pub deleted_data: usize,
}

/// Region GC executor
pub struct GcRunner {
    engine: Arc<dyn RawEngine>,
    log: Arc<dyn ReplicatedLog>,
}

impl GcRunner {
    pub fn new(engine: Arc<dyn RawEngine>, log: Arc<dyn ReplicatedLog>) -> Self {
        Self { engine, log }
    }

    /// One full pass over the region at `safe_point`
    pub fn gc_region(&self, region: &Region, safe_point: Ts) -> Result<GcStats> {
        let (range_start, range_end) = region.range();
        let snapshot = self.engine.snapshot();

        let mut stats = GcStats::default();
        let mut batch = WriteBatch::new();
        let mut pending_deletes = 0usize;
        let mut since_yield = 0usize;

        let mut cursor = range_start;
        // Per-key walk state: the key we're inside, and whether its
        // retained below-safe-point record has been seen
        let mut current_key: Vec<u8> = Vec::new();
        let mut retained_below = false;

        loop {
            let pairs = snapshot.scan(CfName::Write, &cursor, &range_end, SCAN_BATCH)?;
            if pairs.is_empty() {
                break;
            }
            for (internal_key, raw) in &pairs {
                stats.scanned += 1;
                since_yield += 1;
                if since_yield >= YIELD_EVERY {
                    since_yield = 0;
                    std::thread::yield_now();
                }

                let (user_key, commit_ts) = decode_ts_key(internal_key)?;
                if user_key != current_key.as_slice() {
                    current_key = user_key.to_vec();
                    retained_below = false;
                }
                if commit_ts >= safe_point {
                    continue;
                }

                let record = WriteRecord::from_bytes(raw)?;
                let keep = record.is_visible_kind() && !retained_below;
                if keep {
                    retained_below = true;
                    continue;
                }

                batch.delete(CfName::Write, internal_key.clone());
                stats.deleted_writes += 1;
                if record.kind == WriteKind::Put && record.short_value.is_none() {
                    batch.delete(CfName::Data, encode_data(user_key, record.start_ts));
                    stats.deleted_data += 1;
                }
                pending_deletes += 1;
                if pending_deletes >= DELETE_BATCH {
                    self.log.propose(region.id(), std::mem::take(&mut batch))?;
                    pending_deletes = 0;
                }
            }

            let (last, _) = pairs.last().unwrap();
            cursor = last.clone();
            cursor.push(0x00);
        }

        if !batch.is_empty() {
            self.log.propose(region.id(), batch)?;
        }
        if stats.deleted_writes > 0 {
            info!(
                region_id = region.id(),
                safe_point,
                deleted_writes = stats.deleted_writes,
                deleted_data = stats.deleted_data,
                "gc pass finished"
            );
        } else {
            debug!(region_id = region.id(), safe_point, "gc pass found nothing");
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RegionEpoch;
    use crate::storage::engine::MemEngine;
    use crate::storage::mvcc::codec::{encode_entity_key, encode_write, PREFIX_CLIENT_TXN};
    use crate::storage::mvcc::{MvccReader, ReadOutcome};
    use crate::storage::raftlog::LocalLog;
    use crate::storage::region::{Peer, RegionDefinition};

    fn region() -> Arc<Region> {
        Region::new(RegionDefinition {
            id: 1,
            epoch: RegionEpoch::new(1, 1),
            start_key: vec![],
            end_key: vec![],
            peers: vec![Peer { store_id: 1 }],
            partition_id: 1,
        })
    }

    fn key(id: i64) -> Vec<u8> {
        encode_entity_key(PREFIX_CLIENT_TXN, 1, id)
    }

    fn put(engine: &MemEngine, key: &[u8], value: &[u8], start_ts: Ts, commit_ts: Ts) {
        let mut batch = WriteBatch::new();
        let record =
            WriteRecord::new(WriteKind::Put, start_ts).with_short_value(Some(value.to_vec()));
        batch.put(CfName::Write, encode_write(key, commit_ts), record.to_bytes());
        engine.write(batch).unwrap();
    }

    #[test]
    fn test_gc_removes_superseded_versions_only() {
        let engine = Arc::new(MemEngine::new());
        let log = Arc::new(LocalLog::new(engine.clone()));
        let region = region();
        let k = key(1);

        put(&engine, &k, b"v1", 10, 20);
        put(&engine, &k, b"v2", 30, 40);
        put(&engine, &k, b"v3", 50, 60);

        let runner = GcRunner::new(engine.clone(), log);
        let stats = runner.gc_region(&region, 50).unwrap();
        // v2 (commit 40) is the newest below the safe point: retained.
        // v1 (commit 20) is superseded: deleted.
        assert_eq!(stats.deleted_writes, 1);

        let reader = MvccReader::new(engine.snapshot());
        assert_eq!(
            reader.get(&k, 55, &[]).unwrap(),
            ReadOutcome::Value(Some(b"v2".to_vec()))
        );
        assert_eq!(
            reader.get(&k, 65, &[]).unwrap(),
            ReadOutcome::Value(Some(b"v3".to_vec()))
        );
    }

    #[test]
    fn test_gc_reads_at_safe_point_survive() {
        let engine = Arc::new(MemEngine::new());
        let log = Arc::new(LocalLog::new(engine.clone()));
        let region = region();
        let k = key(1);

        put(&engine, &k, b"old", 10, 20);
        put(&engine, &k, b"new", 90, 100);

        let runner = GcRunner::new(engine.clone(), log);
        runner.gc_region(&region, 50).unwrap();

        // A read pinned exactly at the safe point still sees the retained
        // below-safe-point version
        let reader = MvccReader::new(engine.snapshot());
        assert_eq!(
            reader.get(&k, 50, &[]).unwrap(),
            ReadOutcome::Value(Some(b"old".to_vec()))
        );
    }

    #[test]
    fn test_gc_drops_rollback_markers() {
        let engine = Arc::new(MemEngine::new());
        let log = Arc::new(LocalLog::new(engine.clone()));
        let region = region();
        let k = key(1);

        let mut batch = WriteBatch::new();
        let rollback = WriteRecord::new(WriteKind::Rollback, 15);
        batch.put(CfName::Write, encode_write(&k, 15), rollback.to_bytes());
        engine.write(batch).unwrap();
        put(&engine, &k, b"v", 30, 40);

        let runner = GcRunner::new(engine.clone(), log);
        let stats = runner.gc_region(&region, 100).unwrap();
        // The rollback marker goes; the sole visible version is retained
        assert_eq!(stats.deleted_writes, 1);

        let reader = MvccReader::new(engine.snapshot());
        assert_eq!(
            reader.get(&k, 200, &[]).unwrap(),
            ReadOutcome::Value(Some(b"v".to_vec()))
        );
    }

    #[test]
    fn test_gc_deletes_orphan_data_records() {
        let engine = Arc::new(MemEngine::new());
        let log = Arc::new(LocalLog::new(engine.clone()));
        let region = region();
        let k = key(1);

        // Large value: write record without short value + Data CF payload
        let mut batch = WriteBatch::new();
        let record = WriteRecord::new(WriteKind::Put, 10);
        batch.put(CfName::Write, encode_write(&k, 20), record.to_bytes());
        batch.put(CfName::Data, encode_data(&k, 10), vec![0u8; 1024]);
        engine.write(batch).unwrap();
        put(&engine, &k, b"v2", 30, 40);
        put(&engine, &k, b"v3", 50, 60);

        let runner = GcRunner::new(engine.clone(), log);
        let stats = runner.gc_region(&region, 70).unwrap();
        assert_eq!(stats.deleted_writes, 2);
        assert_eq!(stats.deleted_data, 1);
        assert_eq!(engine.get(CfName::Data, &encode_data(&k, 10)).unwrap(), None);
    }
}
