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

//! In-memory multi-CF engine
//!
//! Each column family is an `Arc`-shared ordered map. Snapshots clone the
//! four root `Arc`s (O(1)); a writer that finds a root shared with an
//! outstanding snapshot pays a copy-on-write clone of that CF before
//! mutating. Write batches apply under one mutex, so a snapshot can never
//! observe half a batch.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::core::Result;
use crate::storage::engine::{BatchEntry, CfName, KvPair, RawEngine, SnapshotView, WriteBatch};

type CfMap = BTreeMap<Vec<u8>, Vec<u8>>;

fn scan_map(map: &CfMap, start: &[u8], end: &[u8], limit: usize) -> Vec<KvPair> {
    let upper = if end.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(end.to_vec())
    };
    map.range((Bound::Included(start.to_vec()), upper))
        .take(limit)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// A frozen view: the CF roots captured at snapshot time
struct MemSnapshot {
    cfs: [Arc<CfMap>; 4],
}

impl SnapshotView for MemSnapshot {
    fn get(&self, cf: CfName, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.cfs[cf.index()].get(key).cloned())
    }

    fn scan(&self, cf: CfName, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>> {
        Ok(scan_map(&self.cfs[cf.index()], start, end, limit))
    }
}

/// In-memory engine with copy-on-write snapshots
pub struct MemEngine {
    cfs: [RwLock<Arc<CfMap>>; 4],
    /// Serializes batch application; scans and gets stay lock-free on the
    /// shared roots
    write_mutex: Mutex<()>,
}

impl MemEngine {
    pub fn new() -> Self {
        Self {
            cfs: [
                RwLock::new(Arc::new(CfMap::new())),
                RwLock::new(Arc::new(CfMap::new())),
                RwLock::new(Arc::new(CfMap::new())),
                RwLock::new(Arc::new(CfMap::new())),
            ],
            write_mutex: Mutex::new(()),
        }
    }

    /// Number of live keys in a CF
    pub fn cf_len(&self, cf: CfName) -> usize {
        self.cfs[cf.index()].read().len()
    }
}

impl Default for MemEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RawEngine for MemEngine {
    fn write(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = self.write_mutex.lock();

        // Group entries per CF so each CF root swaps at most once
        let mut staged: [Option<CfMap>; 4] = [None, None, None, None];
        for entry in batch.into_entries() {
            let (cf, is_put) = match &entry {
                BatchEntry::Put { cf, .. } => (*cf, true),
                BatchEntry::Delete { cf, .. } => (*cf, false),
            };
            let idx = cf.index();
            if staged[idx].is_none() {
                staged[idx] = Some((**self.cfs[idx].read()).clone());
            }
            let map = staged[idx].as_mut().unwrap();
            match entry {
                BatchEntry::Put { key, value, .. } => {
                    debug_assert!(is_put);
                    map.insert(key, value);
                }
                BatchEntry::Delete { key, .. } => {
                    map.remove(&key);
                }
            }
        }

        for (idx, map) in staged.into_iter().enumerate() {
            if let Some(map) = map {
                *self.cfs[idx].write() = Arc::new(map);
            }
        }
        Ok(())
    }

    fn get(&self, cf: CfName, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.cfs[cf.index()].read().get(key).cloned())
    }

    fn scan(&self, cf: CfName, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>> {
        let root = Arc::clone(&self.cfs[cf.index()].read());
        Ok(scan_map(&root, start, end, limit))
    }

    fn snapshot(&self) -> Arc<dyn SnapshotView> {
        let _guard = self.write_mutex.lock();
        Arc::new(MemSnapshot {
            cfs: [
                Arc::clone(&self.cfs[0].read()),
                Arc::clone(&self.cfs[1].read()),
                Arc::clone(&self.cfs[2].read()),
                Arc::clone(&self.cfs[3].read()),
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_atomicity_across_cfs() {
        let engine = MemEngine::new();
        let mut batch = WriteBatch::new();
        batch.put(CfName::Data, b"d".to_vec(), b"1".to_vec());
        batch.put(CfName::Lock, b"l".to_vec(), b"2".to_vec());
        batch.delete(CfName::Write, b"absent".to_vec());
        engine.write(batch).unwrap();

        assert_eq!(engine.get(CfName::Data, b"d").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(CfName::Lock, b"l").unwrap(), Some(b"2".to_vec()));
        assert_eq!(engine.get(CfName::Write, b"absent").unwrap(), None);
    }

    #[test]
    fn test_snapshot_isolation_from_later_writes() {
        let engine = MemEngine::new();
        let mut batch = WriteBatch::new();
        batch.put(CfName::Data, b"k".to_vec(), b"old".to_vec());
        engine.write(batch).unwrap();

        let snap = engine.snapshot();

        let mut batch = WriteBatch::new();
        batch.put(CfName::Data, b"k".to_vec(), b"new".to_vec());
        batch.put(CfName::Data, b"k2".to_vec(), b"x".to_vec());
        engine.write(batch).unwrap();

        assert_eq!(snap.get(CfName::Data, b"k").unwrap(), Some(b"old".to_vec()));
        assert_eq!(snap.get(CfName::Data, b"k2").unwrap(), None);
        assert_eq!(
            engine.get(CfName::Data, b"k").unwrap(),
            Some(b"new".to_vec())
        );
    }

    #[test]
    fn test_scan_bounds_and_limit() {
        let engine = MemEngine::new();
        let mut batch = WriteBatch::new();
        for i in 0u8..10 {
            batch.put(CfName::Data, vec![i], vec![i]);
        }
        engine.write(batch).unwrap();

        let pairs = engine.scan(CfName::Data, &[2], &[7], 100).unwrap();
        assert_eq!(pairs.len(), 5);
        assert_eq!(pairs[0].0, vec![2]);
        assert_eq!(pairs.last().unwrap().0, vec![6]);

        let limited = engine.scan(CfName::Data, &[0], &[], 3).unwrap();
        assert_eq!(limited.len(), 3);
    }
}
