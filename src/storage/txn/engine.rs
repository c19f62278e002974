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

//! Percolator-style two-phase commit
//!
//! Every write operation follows the same shape: take latches on the
//! touched keys, read the current lock/write state off a fresh snapshot,
//! decide the batch, propose it through the replicated log, then publish
//! or clear memory-lock entries and release the latches. Transactional
//! conflicts come back as [`TxnResultInfo`] values inside `Ok` results;
//! `Err` is reserved for routing, validation, terminal-transaction and
//! engine failures.
//!
//! Observable transaction states per key: no trace → locked (optimistic
//! or pessimistic) → committed or rolled back. The terminal states are
//! absorbing; every operation here is idempotent against replays.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::core::{
    ConflictReason, Error, Mutation, Op, Result, Ts, TxnResultInfo, WriteConflictInfo,
};
use crate::storage::engine::{CfName, RawEngine, WriteBatch};
use crate::storage::mvcc::codec::{decode_lock_key, encode_data, encode_lock, encode_write};
use crate::storage::mvcc::records::{LockRecord, LockType, WriteKind, WriteRecord, SHORT_VALUE_MAX};
use crate::storage::mvcc::MvccReader;
use crate::storage::raftlog::ReplicatedLog;
use crate::storage::region::Region;

/// Status of a probed transaction, as told by its primary key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnStatus {
    /// The lock is still live; `lock_ttl` tells the caller how long to wait
    Locked { lock_ttl: i64, min_commit_ts: Ts },
    /// The transaction committed at `commit_ts`
    Committed { commit_ts: Ts },
    /// A rollback record exists
    RolledBack,
    /// No trace existed; a protective rollback has been written
    LockNotExist,
}

/// Prewrite request, one per region
#[derive(Debug, Clone)]
pub struct PrewriteRequest {
    pub mutations: Vec<Mutation>,
    pub primary_lock: Vec<u8>,
    pub start_ts: Ts,
    pub lock_ttl: i64,
    pub txn_size: u64,
    /// Per-mutation: true when this key holds a pessimistic lock that must
    /// be converted
    pub pessimistic_checks: Vec<bool>,
    /// Per-mutation for_update_ts recorded at pessimistic-lock time;
    /// consulted only where `pessimistic_checks` is set
    pub for_update_ts_checks: Vec<Ts>,
    /// Async-commit secondaries; empty means plain 2PC
    pub secondaries: Vec<Vec<u8>>,
    pub use_async_commit: bool,
    pub min_commit_ts: Ts,
}

impl PrewriteRequest {
    pub fn new(mutations: Vec<Mutation>, primary_lock: Vec<u8>, start_ts: Ts, lock_ttl: i64) -> Self {
        let txn_size = mutations.len() as u64;
        Self {
            mutations,
            primary_lock,
            start_ts,
            lock_ttl,
            txn_size,
            pessimistic_checks: Vec::new(),
            for_update_ts_checks: Vec::new(),
            secondaries: Vec::new(),
            use_async_commit: false,
            min_commit_ts: 0,
        }
    }
}

/// Pessimistic lock request
#[derive(Debug, Clone)]
pub struct PessimisticLockRequest {
    pub mutations: Vec<Mutation>,
    pub primary_lock: Vec<u8>,
    pub start_ts: Ts,
    pub for_update_ts: Ts,
    pub lock_ttl: i64,
    pub return_values: bool,
}

/// Result of a pessimistic lock: conflicts plus (optionally) current values
#[derive(Debug, Clone, Default)]
pub struct PessimisticLockResult {
    pub txn_results: Vec<TxnResultInfo>,
    pub values: Vec<Option<Vec<u8>>>,
}

/// The per-region transaction executor
pub struct TxnEngine {
    engine: Arc<dyn RawEngine>,
    log: Arc<dyn ReplicatedLog>,
    /// Latch ticket source; unique per in-flight write request
    next_who: AtomicU64,
}

impl TxnEngine {
    pub fn new(engine: Arc<dyn RawEngine>, log: Arc<dyn ReplicatedLog>) -> Self {
        Self {
            engine,
            log,
            next_who: AtomicU64::new(1),
        }
    }

    pub fn raw_engine(&self) -> &Arc<dyn RawEngine> {
        &self.engine
    }

    fn claim_ticket(&self) -> u64 {
        self.next_who.fetch_add(1, Ordering::Relaxed)
    }

    fn reader(&self) -> MvccReader {
        MvccReader::new(self.engine.snapshot())
    }

    /// Find the commit (or rollback) record a transaction left on a key
    fn txn_commit_record(
        &self,
        reader: &MvccReader,
        key: &[u8],
        start_ts: Ts,
    ) -> Result<Option<(Ts, WriteRecord)>> {
        let mut read_ts = i64::MAX - 1;
        loop {
            match reader.seek_write(key, read_ts)? {
                Some((commit_ts, record)) => {
                    if record.start_ts == start_ts {
                        return Ok(Some((commit_ts, record)));
                    }
                    if commit_ts <= start_ts {
                        // Older history can't belong to this transaction
                        return Ok(None);
                    }
                    read_ts = commit_ts - 1;
                }
                None => return Ok(None),
            }
        }
    }

    // =========================================================================
    // Prewrite
    // =========================================================================

    /// First phase of 2PC. Conflicts are collected per key and returned in
    /// `Ok`; nothing is written when any key conflicts.
    pub fn prewrite(&self, region: &Region, req: &PrewriteRequest) -> Result<Vec<TxnResultInfo>> {
        let mut order: Vec<usize> = (0..req.mutations.len()).collect();
        order.sort_by(|&a, &b| req.mutations[a].key.cmp(&req.mutations[b].key));

        let keys: Vec<Vec<u8>> = req.mutations.iter().map(|m| m.key.clone()).collect();
        let ticket = self.claim_ticket();
        region.latches().acquire(&keys, ticket);
        let outcome = self.prewrite_locked(region, req, &order);
        region.latches().release(&keys, ticket);
        outcome
    }

    fn prewrite_locked(
        &self,
        region: &Region,
        req: &PrewriteRequest,
        order: &[usize],
    ) -> Result<Vec<TxnResultInfo>> {
        let reader = self.reader();
        let mut results = Vec::new();
        let mut batch = WriteBatch::new();
        let mut locked_keys: Vec<(Vec<u8>, Arc<LockRecord>)> = Vec::new();

        for &i in order {
            let mutation = &req.mutations[i];
            let key = &mutation.key;
            let pessimistic = req.pessimistic_checks.get(i).copied().unwrap_or(false);

            let existing_lock = reader.load_lock(key)?;
            if let Some(lock) = &existing_lock {
                if lock.start_ts != req.start_ts {
                    results.push(TxnResultInfo::locked(lock.to_lock_info(key)));
                    continue;
                }
                if !lock.is_pessimistic() {
                    // Same transaction already prewrote this key: idempotent
                    continue;
                }
            }

            let latest_write = reader.seek_write(key, i64::MAX - 1)?;

            if pessimistic {
                let for_update_check = req.for_update_ts_checks.get(i).copied().unwrap_or(0);
                let lock = match &existing_lock {
                    Some(lock) if lock.is_pessimistic() => lock,
                    Some(_) => unreachable!("non-pessimistic own lock handled above"),
                    None => {
                        // The pessimistic lock we were supposed to convert is
                        // gone (expired and resolved)
                        results.push(TxnResultInfo::txn_not_found(req.start_ts));
                        continue;
                    }
                };
                let newer_commit = latest_write
                    .as_ref()
                    .map(|(commit_ts, _)| *commit_ts)
                    .unwrap_or(0);
                if lock.for_update_ts != for_update_check || newer_commit > for_update_check {
                    results.push(TxnResultInfo::write_conflict(WriteConflictInfo {
                        start_ts: req.start_ts,
                        conflict_ts: newer_commit.max(lock.for_update_ts),
                        key: key.clone(),
                        primary_key: req.primary_lock.clone(),
                        reason: ConflictReason::PessimisticRetry,
                    }));
                    continue;
                }
            } else if let Some((conflict_ts, _)) = &latest_write {
                // Classic percolator write-write conflict
                if *conflict_ts >= req.start_ts {
                    results.push(TxnResultInfo::write_conflict(WriteConflictInfo {
                        start_ts: req.start_ts,
                        conflict_ts: *conflict_ts,
                        key: key.clone(),
                        primary_key: req.primary_lock.clone(),
                        reason: ConflictReason::Optimistic,
                    }));
                    continue;
                }
            }

            let lock_type = match mutation.op {
                Op::Put => LockType::Put,
                Op::Delete => LockType::Delete,
                Op::Lock => LockType::Lock,
            };
            let short_value = if mutation.op == Op::Put && mutation.value.len() <= SHORT_VALUE_MAX {
                Some(mutation.value.clone())
            } else {
                None
            };

            let for_update_ts = if pessimistic {
                req.for_update_ts_checks.get(i).copied().unwrap_or(0)
            } else {
                0
            };
            let lock = LockRecord {
                lock_type,
                primary_lock: req.primary_lock.clone(),
                start_ts: req.start_ts,
                for_update_ts,
                ttl_ms: req.lock_ttl,
                txn_size: req.txn_size,
                min_commit_ts: req.min_commit_ts,
                use_async_commit: req.use_async_commit,
                secondaries: if key == &req.primary_lock {
                    req.secondaries.clone()
                } else {
                    Vec::new()
                },
                short_value,
            };
            batch.put(CfName::Lock, encode_lock(key), lock.to_bytes());
            if mutation.op == Op::Put && mutation.value.len() > SHORT_VALUE_MAX {
                batch.put(
                    CfName::Data,
                    encode_data(key, req.start_ts),
                    mutation.value.clone(),
                );
            }
            locked_keys.push((key.clone(), Arc::new(lock)));
        }

        if !results.is_empty() {
            return Ok(results);
        }
        if !batch.is_empty() {
            self.log.propose(region.id(), batch)?;
            for (key, lock) in locked_keys {
                region.lock_table().lock_key(&key, lock);
            }
            region.set_txn_access_max_ts(req.start_ts);
        }
        debug!(
            region_id = region.id(),
            start_ts = req.start_ts,
            keys = req.mutations.len(),
            "prewrite applied"
        );
        Ok(results)
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Second phase of 2PC. Idempotent for already-committed keys; fails
    /// the whole call when the transaction left no lock and no commit.
    pub fn commit(
        &self,
        region: &Region,
        keys: &[Vec<u8>],
        start_ts: Ts,
        commit_ts: Ts,
    ) -> Result<()> {
        if commit_ts <= start_ts {
            return Err(Error::illegal(format!(
                "commit_ts {} must exceed start_ts {}",
                commit_ts, start_ts
            )));
        }
        let ticket = self.claim_ticket();
        let key_vec: Vec<Vec<u8>> = keys.to_vec();
        region.latches().acquire(&key_vec, ticket);
        let outcome = self.commit_locked(region, keys, start_ts, commit_ts);
        region.latches().release(&key_vec, ticket);
        outcome
    }

    fn commit_locked(
        &self,
        region: &Region,
        keys: &[Vec<u8>],
        start_ts: Ts,
        commit_ts: Ts,
    ) -> Result<()> {
        let reader = self.reader();
        let mut batch = WriteBatch::new();
        let mut committed_entities: Vec<Vec<u8>> = Vec::new();

        for key in keys {
            match reader.load_lock(key)? {
                Some(lock) if lock.start_ts == start_ts => {
                    if lock.is_pessimistic() {
                        // Commit must follow prewrite conversion
                        return Err(Error::TxnLockNotFound { start_ts });
                    }
                    if lock.min_commit_ts > commit_ts {
                        return Err(Error::CommitTsExpired {
                            commit_ts,
                            min_commit_ts: lock.min_commit_ts,
                        });
                    }
                    let kind = match lock.lock_type {
                        LockType::Put => WriteKind::Put,
                        LockType::Delete => WriteKind::Delete,
                        LockType::Lock => WriteKind::Lock,
                        LockType::Pessimistic => unreachable!(),
                    };
                    let record = WriteRecord::new(kind, start_ts)
                        .with_short_value(lock.short_value.clone());
                    batch.put(CfName::Write, encode_write(key, commit_ts), record.to_bytes());
                    batch.delete(CfName::Lock, encode_lock(key));
                    committed_entities.push(key.clone());
                }
                _ => {
                    // No lock of ours: either already settled, or we never
                    // prewrote this key
                    match self.txn_commit_record(&reader, key, start_ts)? {
                        Some((_, record)) if record.kind == WriteKind::Rollback => {
                            return Err(Error::TxnRolledBack { start_ts });
                        }
                        Some(_) => {
                            // Already committed: idempotent replay
                        }
                        None => {
                            return Err(Error::TxnLockNotFound { start_ts });
                        }
                    }
                }
            }
        }

        if !batch.is_empty() {
            self.log.propose(region.id(), batch)?;
            region.lock_table().unlock_keys(&committed_entities);
            region.set_txn_access_max_ts(commit_ts);
            self.notify_indexes(region, &committed_entities, commit_ts)?;
        }
        debug!(
            region_id = region.id(),
            start_ts, commit_ts, "commit applied"
        );
        Ok(())
    }

    /// Deliver committed key values to the region's index wrappers, in
    /// commit order (we hold the latches for these keys, and apply order
    /// per region is total).
    fn notify_indexes(&self, region: &Region, keys: &[Vec<u8>], commit_ts: Ts) -> Result<()> {
        let vector = region.vector_index();
        let document = region.document_index();
        if vector.is_none() && document.is_none() {
            return Ok(());
        }
        let reader = self.reader();
        for key in keys {
            let value = match reader.get_write(key, commit_ts)? {
                Some((found_ts, record)) if found_ts == commit_ts => {
                    reader.load_value(key, &record)?
                }
                // A newer commit for this key has already told the index
                _ => continue,
            };
            if let Some(wrapper) = &vector {
                wrapper.on_commit(key, value.as_deref())?;
            }
            if let Some(wrapper) = &document {
                wrapper.on_commit(key, value.as_deref())?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Pessimistic path
    // =========================================================================

    /// Take pessimistic locks ahead of prewrite. Idempotent for the same
    /// (key, start_ts, for_update_ts).
    pub fn pessimistic_lock(
        &self,
        region: &Region,
        req: &PessimisticLockRequest,
    ) -> Result<PessimisticLockResult> {
        let keys: Vec<Vec<u8>> = req.mutations.iter().map(|m| m.key.clone()).collect();
        let ticket = self.claim_ticket();
        region.latches().acquire(&keys, ticket);
        let outcome = self.pessimistic_lock_locked(region, req);
        region.latches().release(&keys, ticket);
        outcome
    }

    fn pessimistic_lock_locked(
        &self,
        region: &Region,
        req: &PessimisticLockRequest,
    ) -> Result<PessimisticLockResult> {
        let reader = self.reader();
        let mut result = PessimisticLockResult::default();
        let mut batch = WriteBatch::new();
        let mut locked_keys: Vec<(Vec<u8>, Arc<LockRecord>)> = Vec::new();

        for mutation in &req.mutations {
            let key = &mutation.key;

            if let Some(lock) = reader.load_lock(key)? {
                if lock.start_ts != req.start_ts {
                    result.txn_results.push(TxnResultInfo::locked(lock.to_lock_info(key)));
                    continue;
                }
                if lock.for_update_ts >= req.for_update_ts {
                    // Idempotent replay
                    if req.return_values {
                        result
                            .values
                            .push(self.read_value(&reader, key, req.for_update_ts)?);
                    }
                    continue;
                }
                // Same txn re-locking with a fresh for_update_ts falls through
                // to rewrite the record below
            }

            if let Some((conflict_ts, record)) = reader.seek_write(key, i64::MAX - 1)? {
                if record.kind == WriteKind::Rollback && record.start_ts == req.start_ts {
                    result.txn_results.push(TxnResultInfo::txn_not_found(req.start_ts));
                    continue;
                }
                if conflict_ts > req.for_update_ts {
                    result
                        .txn_results
                        .push(TxnResultInfo::write_conflict(WriteConflictInfo {
                            start_ts: req.start_ts,
                            conflict_ts,
                            key: key.clone(),
                            primary_key: req.primary_lock.clone(),
                            reason: ConflictReason::PessimisticRetry,
                        }));
                    continue;
                }
            }

            let lock = LockRecord {
                lock_type: LockType::Pessimistic,
                primary_lock: req.primary_lock.clone(),
                start_ts: req.start_ts,
                for_update_ts: req.for_update_ts,
                ttl_ms: req.lock_ttl,
                txn_size: req.mutations.len() as u64,
                min_commit_ts: 0,
                use_async_commit: false,
                secondaries: Vec::new(),
                short_value: None,
            };
            batch.put(CfName::Lock, encode_lock(key), lock.to_bytes());
            locked_keys.push((key.clone(), Arc::new(lock)));
            if req.return_values {
                result
                    .values
                    .push(self.read_value(&reader, key, req.for_update_ts)?);
            }
        }

        if !result.txn_results.is_empty() {
            result.values.clear();
            return Ok(result);
        }
        if !batch.is_empty() {
            self.log.propose(region.id(), batch)?;
            for (key, lock) in locked_keys {
                region.lock_table().lock_key(&key, lock);
            }
            region.set_txn_access_max_ts(req.for_update_ts);
        }
        Ok(result)
    }

    fn read_value(&self, reader: &MvccReader, key: &[u8], read_ts: Ts) -> Result<Option<Vec<u8>>> {
        match reader.get_write(key, read_ts)? {
            Some((_, record)) => reader.load_value(key, &record),
            None => Ok(None),
        }
    }

    /// Drop pessimistic locks only. Optimistic locks and write records are
    /// never touched.
    pub fn pessimistic_rollback(
        &self,
        region: &Region,
        keys: &[Vec<u8>],
        start_ts: Ts,
        for_update_ts: Ts,
    ) -> Result<()> {
        let key_vec: Vec<Vec<u8>> = keys.to_vec();
        let ticket = self.claim_ticket();
        region.latches().acquire(&key_vec, ticket);

        let outcome = (|| {
            let reader = self.reader();
            let mut batch = WriteBatch::new();
            let mut released: Vec<Vec<u8>> = Vec::new();
            for key in keys {
                if let Some(lock) = reader.load_lock(key)? {
                    if lock.is_pessimistic()
                        && lock.start_ts == start_ts
                        && lock.for_update_ts <= for_update_ts
                    {
                        batch.delete(CfName::Lock, encode_lock(key));
                        released.push(key.clone());
                    }
                }
            }
            if !batch.is_empty() {
                self.log.propose(region.id(), batch)?;
                region.lock_table().unlock_keys(&released);
            }
            Ok(())
        })();

        region.latches().release(&key_vec, ticket);
        outcome
    }

    // =========================================================================
    // Rollback / status / resolve
    // =========================================================================

    /// Write rollback records and clear matching locks. Refuses when the
    /// transaction already committed.
    pub fn batch_rollback(&self, region: &Region, keys: &[Vec<u8>], start_ts: Ts) -> Result<()> {
        let key_vec: Vec<Vec<u8>> = keys.to_vec();
        let ticket = self.claim_ticket();
        region.latches().acquire(&key_vec, ticket);
        let outcome = self.rollback_keys(region, keys, start_ts);
        region.latches().release(&key_vec, ticket);
        outcome
    }

    fn rollback_keys(&self, region: &Region, keys: &[Vec<u8>], start_ts: Ts) -> Result<()> {
        let reader = self.reader();
        let mut batch = WriteBatch::new();
        let mut released: Vec<Vec<u8>> = Vec::new();

        for key in keys {
            match reader.load_lock(key)? {
                Some(lock) if lock.start_ts == start_ts => {
                    batch.delete(CfName::Lock, encode_lock(key));
                    if lock.lock_type == LockType::Put && lock.short_value.is_none() {
                        batch.delete(CfName::Data, encode_data(key, start_ts));
                    }
                    let rollback = WriteRecord::new(WriteKind::Rollback, start_ts);
                    batch.put(CfName::Write, encode_write(key, start_ts), rollback.to_bytes());
                    released.push(key.clone());
                }
                _ => match self.txn_commit_record(&reader, key, start_ts)? {
                    Some((commit_ts, record)) if record.kind != WriteKind::Rollback => {
                        return Err(Error::TxnAlreadyCommitted { start_ts, commit_ts });
                    }
                    Some(_) => {
                        // Rollback record already present: idempotent
                    }
                    None => {
                        // No trace: write a protective rollback so a late
                        // prewrite cannot sneak in
                        let rollback = WriteRecord::new(WriteKind::Rollback, start_ts);
                        batch.put(
                            CfName::Write,
                            encode_write(key, start_ts),
                            rollback.to_bytes(),
                        );
                    }
                },
            }
        }

        if !batch.is_empty() {
            self.log.propose(region.id(), batch)?;
            region.lock_table().unlock_keys(&released);
        }
        debug!(region_id = region.id(), start_ts, "rollback applied");
        Ok(())
    }

    /// Probe a transaction through its primary lock, rolling it back when
    /// its TTL has lapsed.
    pub fn check_txn_status(
        &self,
        region: &Region,
        primary_key: &[u8],
        lock_ts: Ts,
        _caller_start_ts: Ts,
        current_ts: Ts,
    ) -> Result<TxnStatus> {
        let key_vec = vec![primary_key.to_vec()];
        let ticket = self.claim_ticket();
        region.latches().acquire(&key_vec, ticket);

        let outcome = (|| {
            let reader = self.reader();
            if let Some(lock) = reader.load_lock(primary_key)? {
                if lock.start_ts == lock_ts {
                    if current_ts < lock.start_ts + lock.ttl_ms {
                        return Ok(TxnStatus::Locked {
                            lock_ttl: lock.ttl_ms,
                            min_commit_ts: lock.min_commit_ts,
                        });
                    }
                    // Expired: roll the primary back ("protect primary")
                    self.rollback_keys(region, &key_vec, lock_ts)?;
                    return Ok(TxnStatus::LockNotExist);
                }
            }
            match self.txn_commit_record(&reader, primary_key, lock_ts)? {
                Some((_, record)) if record.kind == WriteKind::Rollback => {
                    Ok(TxnStatus::RolledBack)
                }
                Some((commit_ts, _)) => Ok(TxnStatus::Committed { commit_ts }),
                None => {
                    self.rollback_keys(region, &key_vec, lock_ts)?;
                    Ok(TxnStatus::LockNotExist)
                }
            }
        })();

        region.latches().release(&key_vec, ticket);
        outcome
    }

    /// Commit (`commit_ts > 0`) or roll back (`commit_ts == 0`) the locks a
    /// transaction left in this region. With `keys` empty the whole region
    /// range is resolved.
    pub fn resolve_lock(
        &self,
        region: &Region,
        start_ts: Ts,
        commit_ts: Ts,
        keys: &[Vec<u8>],
    ) -> Result<()> {
        let targets: Vec<Vec<u8>> = if keys.is_empty() {
            self.scan_txn_locks(region, start_ts)?
        } else {
            keys.to_vec()
        };
        if targets.is_empty() {
            return Ok(());
        }
        if commit_ts == 0 {
            self.batch_rollback(region, &targets, start_ts)
        } else {
            self.commit(region, &targets, start_ts, commit_ts)
        }
    }

    /// All keys in the region still locked by `start_ts`
    fn scan_txn_locks(&self, region: &Region, start_ts: Ts) -> Result<Vec<Vec<u8>>> {
        let (range_start, range_end) = region.range();
        let snapshot = self.engine.snapshot();
        let mut targets = Vec::new();
        let mut cursor = range_start;
        loop {
            let pairs = snapshot.scan(CfName::Lock, &cursor, &range_end, 256)?;
            if pairs.is_empty() {
                break;
            }
            for (lock_key, raw) in &pairs {
                let lock = LockRecord::from_bytes(raw)?;
                if lock.start_ts == start_ts {
                    targets.push(decode_lock_key(lock_key)?.to_vec());
                }
            }
            let (last, _) = pairs.last().unwrap();
            cursor = last.clone();
            cursor.push(0x00);
        }
        Ok(targets)
    }

    /// Extend the primary lock's TTL. Returns the TTL now in force.
    pub fn heart_beat(
        &self,
        region: &Region,
        primary_key: &[u8],
        start_ts: Ts,
        advise_ttl: i64,
    ) -> Result<i64> {
        let key_vec = vec![primary_key.to_vec()];
        let ticket = self.claim_ticket();
        region.latches().acquire(&key_vec, ticket);

        let outcome = (|| {
            let reader = self.reader();
            match reader.load_lock(primary_key)? {
                Some(mut lock) if lock.start_ts == start_ts => {
                    let new_ttl = lock.ttl_ms.max(advise_ttl);
                    if new_ttl != lock.ttl_ms {
                        lock.ttl_ms = new_ttl;
                        let mut batch = WriteBatch::new();
                        batch.put(CfName::Lock, encode_lock(primary_key), lock.to_bytes());
                        self.log.propose(region.id(), batch)?;
                        region
                            .lock_table()
                            .lock_key(primary_key, Arc::new(lock));
                    }
                    Ok(new_ttl)
                }
                _ => Err(Error::TxnLockNotFound { start_ts }),
            }
        })();

        region.latches().release(&key_vec, ticket);
        outcome
    }

    // =========================================================================
    // Read helpers used by the store facade
    // =========================================================================

    /// Snapshot point read honoring the durable lock table
    pub fn mvcc_get(
        &self,
        region: &Region,
        key: &[u8],
        read_ts: Ts,
        resolved_locks: &[Ts],
    ) -> Result<crate::storage::mvcc::ReadOutcome> {
        region.set_txn_access_max_ts(read_ts);
        self.reader().get(key, read_ts, resolved_locks)
    }

    /// List every live lock in the region (diagnostics, resolve support)
    pub fn scan_locks(
        &self,
        region: &Region,
        start_ts_filter: Option<Ts>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, LockRecord)>> {
        let (range_start, range_end) = region.range();
        let snapshot = self.engine.snapshot();
        let mut out = Vec::new();
        let mut cursor = range_start;
        while out.len() < limit {
            let pairs = snapshot.scan(CfName::Lock, &cursor, &range_end, 256)?;
            if pairs.is_empty() {
                break;
            }
            for (lock_key, raw) in &pairs {
                let lock = LockRecord::from_bytes(raw)?;
                if start_ts_filter.map(|ts| lock.start_ts == ts).unwrap_or(true) {
                    let user_key = decode_lock_key(lock_key)?.to_vec();
                    out.push((user_key, lock));
                    if out.len() >= limit {
                        break;
                    }
                }
            }
            let (last, _) = pairs.last().unwrap();
            cursor = last.clone();
            cursor.push(0x00);
        }
        Ok(out)
    }
}
