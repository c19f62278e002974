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

//! Request context and structured transaction results
//!
//! Every request carries a [`RequestContext`] naming the region and the
//! epoch the client routed with. Transactional conflicts come back as
//! [`TxnResultInfo`] values inside successful responses — the client acts
//! on them (resolve the lock, retry with a fresh timestamp), it does not
//! treat them as failures.

use crate::core::types::{IsolationLevel, Ts};

/// Logical configuration version of a region.
///
/// `version` moves on every range mutation (split/merge); `conf_version`
/// moves on peer membership changes. A request presenting a stale pair is
/// rejected with `EpochNotMatch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionEpoch {
    pub version: i64,
    pub conf_version: i64,
}

impl RegionEpoch {
    pub fn new(version: i64, conf_version: i64) -> Self {
        Self {
            version,
            conf_version,
        }
    }
}

/// Per-request routing and read context
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub region_id: i64,
    pub epoch: RegionEpoch,
    pub isolation_level: IsolationLevel,
    /// Locks the client has already resolved; reads skip conflicts whose
    /// start_ts appears here
    pub resolved_locks: Vec<Ts>,
    /// Wall-clock deadline (unix ms). Tasks check it before starting;
    /// cancellation is advisory once a write has been proposed.
    pub deadline_ms: Option<i64>,
}

impl RequestContext {
    pub fn new(region_id: i64, epoch: RegionEpoch) -> Self {
        Self {
            region_id,
            epoch,
            isolation_level: IsolationLevel::default(),
            resolved_locks: Vec::new(),
            deadline_ms: None,
        }
    }

    pub fn with_resolved_locks(mut self, resolved: Vec<Ts>) -> Self {
        self.resolved_locks = resolved;
        self
    }

    pub fn with_deadline_ms(mut self, deadline_ms: i64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    pub fn expired(&self, now_ms: i64) -> bool {
        self.deadline_ms.map(|d| now_ms > d).unwrap_or(false)
    }
}

/// Client-visible projection of a lock record, surfaced on conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub primary_lock: Vec<u8>,
    pub lock_ts: Ts,
    pub key: Vec<u8>,
    pub lock_ttl: i64,
    pub txn_size: u64,
    /// True when the conflicting lock is pessimistic
    pub is_pessimistic: bool,
    pub for_update_ts: Ts,
}

/// Write-write conflict detail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteConflictInfo {
    pub start_ts: Ts,
    pub conflict_ts: Ts,
    pub key: Vec<u8>,
    pub primary_key: Vec<u8>,
    pub reason: ConflictReason,
}

/// Why a write-write conflict was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Classic percolator conflict: a commit landed at or after start_ts
    Optimistic,
    /// A commit landed after for_update_ts; re-lock with a fresh
    /// for_update_ts and retry
    PessimisticRetry,
}

/// The probed transaction left no trace on the primary key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnNotFound {
    pub start_ts: Ts,
}

/// Structured transaction result attached to responses.
///
/// At most one field is set per affected key. An empty `TxnResultInfo`
/// (the default) means the operation took effect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxnResultInfo {
    pub locked: Option<LockInfo>,
    pub write_conflict: Option<WriteConflictInfo>,
    pub txn_not_found: Option<TxnNotFound>,
}

impl TxnResultInfo {
    pub fn locked(info: LockInfo) -> Self {
        Self {
            locked: Some(info),
            ..Default::default()
        }
    }

    pub fn write_conflict(info: WriteConflictInfo) -> Self {
        Self {
            write_conflict: Some(info),
            ..Default::default()
        }
    }

    pub fn txn_not_found(start_ts: Ts) -> Self {
        Self {
            txn_not_found: Some(TxnNotFound { start_ts }),
            ..Default::default()
        }
    }

    /// True when no conflict variant is set
    pub fn is_clean(&self) -> bool {
        self.locked.is_none() && self.write_conflict.is_none() && self.txn_not_found.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_result_clean() {
        assert!(TxnResultInfo::default().is_clean());
        assert!(!TxnResultInfo::txn_not_found(5).is_clean());
    }

    #[test]
    fn test_epoch_equality() {
        assert_eq!(RegionEpoch::new(7, 1), RegionEpoch::new(7, 1));
        assert_ne!(RegionEpoch::new(7, 1), RegionEpoch::new(8, 1));
    }
}
