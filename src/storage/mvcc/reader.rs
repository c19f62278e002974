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

//! MVCC read path
//!
//! [`MvccReader`] walks the Write CF newest-first per user key, chases
//! Put records into the Data CF when the value was not inlined, and
//! surfaces durable lock conflicts as structured [`LockInfo`] values.
//! Readers never block: a conflicting lock is returned to the client,
//! which resolves it via CheckTxnStatus + ResolveLock.

use std::sync::Arc;

use crate::core::{LockInfo, Result, Ts};
use crate::storage::engine::{prefix_end_key, CfName, SnapshotView};
use crate::storage::mvcc::codec::{decode_ts_key, encode_data, encode_lock, encode_write};
use crate::storage::mvcc::records::{LockRecord, WriteKind, WriteRecord};

/// Chunk size for range walks over the Write CF
const SCAN_BATCH: usize = 256;

/// Outcome of a point read: either a value set or a lock to resolve
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Value(Option<Vec<u8>>),
    Locked(LockInfo),
}

/// Read-only MVCC view over one engine snapshot
pub struct MvccReader {
    snapshot: Arc<dyn SnapshotView>,
}

impl MvccReader {
    pub fn new(snapshot: Arc<dyn SnapshotView>) -> Self {
        Self { snapshot }
    }

    /// Load the durable lock record for a user key, if any
    pub fn load_lock(&self, user_key: &[u8]) -> Result<Option<LockRecord>> {
        match self.snapshot.get(CfName::Lock, &encode_lock(user_key))? {
            Some(raw) => Ok(Some(LockRecord::from_bytes(&raw)?)),
            None => Ok(None),
        }
    }

    /// Whether a durable lock conflicts with a read at `read_ts`.
    ///
    /// Pessimistic placeholders never block reads (they carry no pending
    /// write), and locks the client already resolved are skipped.
    pub fn check_lock_conflict(
        &self,
        user_key: &[u8],
        read_ts: Ts,
        resolved_locks: &[Ts],
    ) -> Result<Option<LockInfo>> {
        if let Some(lock) = self.load_lock(user_key)? {
            if !lock.is_pessimistic()
                && lock.start_ts <= read_ts
                && !resolved_locks.contains(&lock.start_ts)
            {
                return Ok(Some(lock.to_lock_info(user_key)));
            }
        }
        Ok(None)
    }

    /// The newest write record at `commit_ts <= read_ts`, regardless of kind
    pub fn seek_write(&self, user_key: &[u8], read_ts: Ts) -> Result<Option<(Ts, WriteRecord)>> {
        let start = encode_write(user_key, read_ts);
        let pairs = self.snapshot.scan(CfName::Write, &start, &[], 1)?;
        if let Some((internal_key, raw)) = pairs.into_iter().next() {
            let (found_key, commit_ts) = decode_ts_key(&internal_key)?;
            if found_key == user_key {
                return Ok(Some((commit_ts, WriteRecord::from_bytes(&raw)?)));
            }
        }
        Ok(None)
    }

    /// The newest *visible* write record at `commit_ts <= read_ts`:
    /// Rollback and Lock records are skipped toward older history
    pub fn get_write(&self, user_key: &[u8], read_ts: Ts) -> Result<Option<(Ts, WriteRecord)>> {
        let mut cursor = encode_write(user_key, read_ts);
        loop {
            let pairs = self.snapshot.scan(CfName::Write, &cursor, &[], SCAN_BATCH)?;
            if pairs.is_empty() {
                return Ok(None);
            }
            for (internal_key, raw) in &pairs {
                let (found_key, commit_ts) = decode_ts_key(internal_key)?;
                if found_key != user_key {
                    return Ok(None);
                }
                let record = WriteRecord::from_bytes(raw)?;
                if record.is_visible_kind() {
                    return Ok(Some((commit_ts, record)));
                }
            }
            // All records in this chunk were rollbacks/locks; continue past
            // the last one
            let (last_key, _) = pairs.last().unwrap().clone();
            cursor = last_key;
            cursor.push(0x00);
        }
    }

    /// Resolve a write record to its user value
    pub fn load_value(
        &self,
        user_key: &[u8],
        commit_record: &WriteRecord,
    ) -> Result<Option<Vec<u8>>> {
        match commit_record.kind {
            WriteKind::Put => {
                if let Some(short) = &commit_record.short_value {
                    return Ok(Some(short.clone()));
                }
                let data_key = encode_data(user_key, commit_record.start_ts);
                self.snapshot.get(CfName::Data, &data_key)
            }
            WriteKind::Delete => Ok(None),
            WriteKind::Rollback | WriteKind::Lock => Ok(None),
        }
    }

    /// Point read at `read_ts`, surfacing lock conflicts
    pub fn get(&self, user_key: &[u8], read_ts: Ts, resolved_locks: &[Ts]) -> Result<ReadOutcome> {
        if let Some(info) = self.check_lock_conflict(user_key, read_ts, resolved_locks)? {
            return Ok(ReadOutcome::Locked(info));
        }
        match self.get_write(user_key, read_ts)? {
            Some((_, record)) => Ok(ReadOutcome::Value(self.load_value(user_key, &record)?)),
            None => Ok(ReadOutcome::Value(None)),
        }
    }

    /// Range scan at `read_ts`: up to `limit` live (non-deleted) rows
    /// starting at `start_key`, stopping before `end_key`.
    ///
    /// Returns the pairs plus the key to resume from, when the scan was cut
    /// off by `limit` rather than by range exhaustion.
    #[allow(clippy::type_complexity)]
    pub fn scan(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        read_ts: Ts,
        limit: usize,
        resolved_locks: &[Ts],
    ) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, Option<Vec<u8>>, Vec<LockInfo>)> {
        let mut rows = Vec::new();
        let mut locks = Vec::new();
        let mut cursor = start_key.to_vec();

        'outer: while rows.len() < limit {
            let pairs = self
                .snapshot
                .scan(CfName::Write, &cursor, end_key, SCAN_BATCH)?;
            if pairs.is_empty() {
                return Ok((rows, None, locks));
            }

            let mut current_key: Option<Vec<u8>> = None;
            let mut satisfied = false;
            for (internal_key, raw) in &pairs {
                let (user_key, commit_ts) = decode_ts_key(internal_key)?;
                if current_key.as_deref() != Some(user_key) {
                    current_key = Some(user_key.to_vec());
                    satisfied = false;
                    if let Some(info) =
                        self.check_lock_conflict(user_key, read_ts, resolved_locks)?
                    {
                        locks.push(info);
                        satisfied = true;
                        continue;
                    }
                }
                if satisfied || commit_ts > read_ts {
                    continue;
                }
                let record = WriteRecord::from_bytes(raw)?;
                if !record.is_visible_kind() {
                    continue;
                }
                satisfied = true;
                if let Some(value) = self.load_value(user_key, &record)? {
                    rows.push((user_key.to_vec(), value));
                    if rows.len() >= limit {
                        // Resume past every timestamped record of this user
                        // key: the ~ts suffix always starts at or above
                        // 0x80, so the key's own increment is the first
                        // internal key of the next user key
                        let next = prefix_end_key(user_key);
                        if next.is_empty() {
                            return Ok((rows, None, locks));
                        }
                        // More data may remain in range
                        let more = self
                            .snapshot
                            .scan(CfName::Write, &next, end_key, 1)?
                            .into_iter()
                            .next()
                            .is_some();
                        return Ok((rows, if more { Some(next) } else { None }, locks));
                    }
                }
            }

            // Advance past the last internal key seen
            let (last_key, _) = pairs.last().unwrap();
            cursor = last_key.clone();
            cursor.push(0x00);
            if pairs.len() < SCAN_BATCH {
                break 'outer;
            }
        }
        Ok((rows, None, locks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::engine::{MemEngine, RawEngine, WriteBatch};
    use crate::storage::mvcc::codec::{encode_entity_key, PREFIX_CLIENT_TXN};
    use crate::storage::mvcc::records::LockType;

    fn put_committed(engine: &MemEngine, key: &[u8], value: &[u8], start_ts: Ts, commit_ts: Ts) {
        let mut batch = WriteBatch::new();
        let record = WriteRecord::new(WriteKind::Put, start_ts)
            .with_short_value(Some(value.to_vec()));
        batch.put(CfName::Write, encode_write(key, commit_ts), record.to_bytes());
        engine.write(batch).unwrap();
    }

    fn key(id: i64) -> Vec<u8> {
        encode_entity_key(PREFIX_CLIENT_TXN, 1, id)
    }

    #[test]
    fn test_point_read_visibility() {
        let engine = MemEngine::new();
        let k = key(1);
        put_committed(&engine, &k, b"v1", 100, 110);
        put_committed(&engine, &k, b"v2", 200, 210);

        let reader = MvccReader::new(engine.snapshot());
        assert_eq!(
            reader.get(&k, 300, &[]).unwrap(),
            ReadOutcome::Value(Some(b"v2".to_vec()))
        );
        assert_eq!(
            reader.get(&k, 150, &[]).unwrap(),
            ReadOutcome::Value(Some(b"v1".to_vec()))
        );
        assert_eq!(reader.get(&k, 105, &[]).unwrap(), ReadOutcome::Value(None));
    }

    #[test]
    fn test_rollback_records_skipped() {
        let engine = MemEngine::new();
        let k = key(1);
        put_committed(&engine, &k, b"v1", 100, 110);

        let mut batch = WriteBatch::new();
        let rollback = WriteRecord::new(WriteKind::Rollback, 150);
        batch.put(CfName::Write, encode_write(&k, 150), rollback.to_bytes());
        engine.write(batch).unwrap();

        let reader = MvccReader::new(engine.snapshot());
        assert_eq!(
            reader.get(&k, 200, &[]).unwrap(),
            ReadOutcome::Value(Some(b"v1".to_vec()))
        );
    }

    #[test]
    fn test_lock_conflict_surfaced_not_blocking() {
        let engine = MemEngine::new();
        let k = key(1);
        let lock = LockRecord {
            lock_type: LockType::Put,
            primary_lock: k.clone(),
            start_ts: 100,
            for_update_ts: 0,
            ttl_ms: 3000,
            txn_size: 1,
            min_commit_ts: 0,
            use_async_commit: false,
            secondaries: vec![],
            short_value: None,
        };
        let mut batch = WriteBatch::new();
        batch.put(CfName::Lock, encode_lock(&k), lock.to_bytes());
        engine.write(batch).unwrap();

        let reader = MvccReader::new(engine.snapshot());
        match reader.get(&k, 120, &[]).unwrap() {
            ReadOutcome::Locked(info) => {
                assert_eq!(info.lock_ts, 100);
                assert_eq!(info.lock_ttl, 3000);
            }
            other => panic!("expected lock conflict, got {:?}", other),
        }

        // Reads below the lock's start_ts pass through
        assert_eq!(reader.get(&k, 90, &[]).unwrap(), ReadOutcome::Value(None));

        // Resolved locks are skipped
        assert_eq!(
            reader.get(&k, 120, &[100]).unwrap(),
            ReadOutcome::Value(None)
        );
    }

    #[test]
    fn test_scan_newest_visible_per_key() {
        let engine = MemEngine::new();
        for id in 1..=5 {
            let k = key(id);
            put_committed(&engine, &k, format!("old{}", id).as_bytes(), 10, 20);
            put_committed(&engine, &k, format!("new{}", id).as_bytes(), 30, 40);
        }

        let reader = MvccReader::new(engine.snapshot());
        let (rows, resume, locks) = reader.scan(&key(1), &[], 100, 10, &[]).unwrap();
        assert!(locks.is_empty());
        assert!(resume.is_none());
        assert_eq!(rows.len(), 5);
        for (i, (_, v)) in rows.iter().enumerate() {
            assert_eq!(v, format!("new{}", i + 1).as_bytes());
        }
    }

    #[test]
    fn test_scan_limit_returns_resume_key() {
        let engine = MemEngine::new();
        for id in 1..=5 {
            put_committed(&engine, &key(id), b"v", 10, 20);
        }
        let reader = MvccReader::new(engine.snapshot());
        let (rows, resume, _) = reader.scan(&key(1), &[], 100, 2, &[]).unwrap();
        assert_eq!(rows.len(), 2);
        let resume = resume.expect("resume key expected");

        let (rest, resume2, _) = reader.scan(&resume, &[], 100, 10, &[]).unwrap();
        assert_eq!(rest.len(), 3);
        assert!(resume2.is_none());
    }

    #[test]
    fn test_scan_skips_deleted_rows() {
        let engine = MemEngine::new();
        put_committed(&engine, &key(1), b"v", 10, 20);
        let mut batch = WriteBatch::new();
        let del = WriteRecord::new(WriteKind::Delete, 30);
        batch.put(CfName::Write, encode_write(&key(1), 40), del.to_bytes());
        engine.write(batch).unwrap();
        put_committed(&engine, &key(2), b"v2", 10, 20);

        let reader = MvccReader::new(engine.snapshot());
        let (rows, _, _) = reader.scan(&key(1), &[], 100, 10, &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, key(2));
    }
}
