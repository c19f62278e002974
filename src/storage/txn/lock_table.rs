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

//! In-memory lock table
//!
//! Mirrors the durable Lock CF for in-flight prewrites so the read path
//! can detect conflicts without touching storage. Writers publish an
//! entry before proposing to the log and clear it after apply; readers
//! consult the table per key or per range. A conflict is surfaced to the
//! client as structured lock info — never blocked on.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::{IsolationLevel, LockInfo, Ts, TxnResultInfo};
use crate::storage::mvcc::LockRecord;

/// Advisory read-side lock table, one per region
pub struct MemoryLockTable {
    locks: RwLock<BTreeMap<Vec<u8>, Arc<LockRecord>>>,
}

impl MemoryLockTable {
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(BTreeMap::new()),
        }
    }

    /// Publish an in-flight lock for a key. Replaces any previous entry.
    pub fn lock_key(&self, key: &[u8], record: Arc<LockRecord>) {
        self.locks.write().insert(key.to_vec(), record);
    }

    /// Clear entries after apply, rollback, or resolve
    pub fn unlock_keys(&self, keys: &[Vec<u8>]) {
        let mut locks = self.locks.write();
        for key in keys {
            locks.remove(key);
        }
    }

    /// Clear every entry belonging to one transaction
    pub fn unlock_txn(&self, start_ts: Ts) {
        self.locks.write().retain(|_, rec| rec.start_ts != start_ts);
    }

    pub fn get(&self, key: &[u8]) -> Option<Arc<LockRecord>> {
        self.locks.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.read().is_empty()
    }

    fn conflicts(
        record: &LockRecord,
        key: &[u8],
        isolation_level: IsolationLevel,
        read_ts: Ts,
        resolved_locks: &[Ts],
    ) -> Option<LockInfo> {
        // Read-committed readers only collide with locks that may commit
        // below their read point too, same rule — pessimistic placeholders
        // carry no pending write and never block reads.
        let _ = isolation_level;
        if record.is_pessimistic() {
            return None;
        }
        if record.start_ts > read_ts {
            return None;
        }
        if resolved_locks.contains(&record.start_ts) {
            return None;
        }
        Some(record.to_lock_info(key))
    }

    /// Check a set of keys for read conflicts at `read_ts`.
    ///
    /// Returns a populated [`TxnResultInfo`] for the first conflicting key,
    /// or `None` when the read may proceed.
    pub fn check_keys(
        &self,
        keys: &[Vec<u8>],
        isolation_level: IsolationLevel,
        read_ts: Ts,
        resolved_locks: &[Ts],
    ) -> Option<TxnResultInfo> {
        let locks = self.locks.read();
        for key in keys {
            if let Some(record) = locks.get(key) {
                if let Some(info) =
                    Self::conflicts(record, key, isolation_level, read_ts, resolved_locks)
                {
                    return Some(TxnResultInfo::locked(info));
                }
            }
        }
        None
    }

    /// Check every key in `[start_key, end_key)` for read conflicts
    pub fn check_range(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        isolation_level: IsolationLevel,
        read_ts: Ts,
        resolved_locks: &[Ts],
    ) -> Option<TxnResultInfo> {
        let locks = self.locks.read();
        let upper = if end_key.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end_key.to_vec())
        };
        for (key, record) in locks.range((Bound::Included(start_key.to_vec()), upper)) {
            if let Some(info) =
                Self::conflicts(record, key, isolation_level, read_ts, resolved_locks)
            {
                return Some(TxnResultInfo::locked(info));
            }
        }
        None
    }
}

impl Default for MemoryLockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mvcc::LockType;

    fn record(start_ts: Ts, lock_type: LockType) -> Arc<LockRecord> {
        Arc::new(LockRecord {
            lock_type,
            primary_lock: b"primary".to_vec(),
            start_ts,
            for_update_ts: 0,
            ttl_ms: 3000,
            txn_size: 1,
            min_commit_ts: 0,
            use_async_commit: false,
            secondaries: vec![],
            short_value: None,
        })
    }

    #[test]
    fn test_check_keys_conflict() {
        let table = MemoryLockTable::new();
        table.lock_key(b"k1", record(100, LockType::Put));

        let keys = vec![b"k1".to_vec()];
        let result = table
            .check_keys(&keys, IsolationLevel::SnapshotIsolation, 120, &[])
            .expect("conflict expected");
        let info = result.locked.unwrap();
        assert_eq!(info.lock_ts, 100);
        assert_eq!(info.primary_lock, b"primary");

        // Below the lock's start_ts the read proceeds
        assert!(table
            .check_keys(&keys, IsolationLevel::SnapshotIsolation, 90, &[])
            .is_none());
        // Already-resolved locks are skipped
        assert!(table
            .check_keys(&keys, IsolationLevel::SnapshotIsolation, 120, &[100])
            .is_none());
    }

    #[test]
    fn test_pessimistic_locks_do_not_block_reads() {
        let table = MemoryLockTable::new();
        table.lock_key(b"k1", record(100, LockType::Pessimistic));
        assert!(table
            .check_keys(
                &[b"k1".to_vec()],
                IsolationLevel::SnapshotIsolation,
                200,
                &[]
            )
            .is_none());
    }

    #[test]
    fn test_check_range() {
        let table = MemoryLockTable::new();
        table.lock_key(b"b", record(50, LockType::Put));
        table.lock_key(b"d", record(60, LockType::Put));

        assert!(table
            .check_range(b"a", b"b", IsolationLevel::SnapshotIsolation, 100, &[])
            .is_none());
        let hit = table
            .check_range(b"a", b"c", IsolationLevel::SnapshotIsolation, 100, &[])
            .unwrap();
        assert_eq!(hit.locked.unwrap().lock_ts, 50);
        let hit = table
            .check_range(b"c", b"", IsolationLevel::SnapshotIsolation, 100, &[])
            .unwrap();
        assert_eq!(hit.locked.unwrap().lock_ts, 60);
    }

    #[test]
    fn test_unlock_paths() {
        let table = MemoryLockTable::new();
        table.lock_key(b"k1", record(100, LockType::Put));
        table.lock_key(b"k2", record(100, LockType::Put));
        table.lock_key(b"k3", record(200, LockType::Put));
        assert_eq!(table.len(), 3);

        table.unlock_keys(&[b"k1".to_vec()]);
        assert_eq!(table.len(), 2);

        table.unlock_txn(100);
        assert_eq!(table.len(), 1);
        assert!(table.get(b"k3").is_some());
    }
}
