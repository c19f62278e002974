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

//! Region: the unit of sharding
//!
//! A region owns one key range, its epoch, its admission state, the latch
//! table and memory lock table that order writers, and optional secondary
//! index wrappers. The definition sits behind a mutex; hot-path watermarks
//! and state live in atomics so readers never contend with meta updates.

pub mod meta;
pub mod safepoint;

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::core::{Error, RegionEpoch, RequestContext, Result, Ts};
use crate::storage::index::{DocumentIndexWrapper, VectorIndexWrapper};
use crate::storage::txn::latch::Latches;
use crate::storage::txn::lock_table::MemoryLockTable;

pub use meta::{RegionChangeRecorder, StoreMetaManager, StoreRegionMeta};
pub use safepoint::GcSafePointManager;

/// Region lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionState {
    New = 0,
    Normal = 1,
    Splitting = 2,
    Merging = 3,
    Tombstone = 4,
    Deleting = 5,
    Deleted = 6,
}

impl RegionState {
    pub fn from_u8(v: u8) -> RegionState {
        match v {
            0 => RegionState::New,
            1 => RegionState::Normal,
            2 => RegionState::Splitting,
            3 => RegionState::Merging,
            4 => RegionState::Tombstone,
            5 => RegionState::Deleting,
            _ => RegionState::Deleted,
        }
    }
}

/// A replica of the region on some store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub store_id: i64,
}

/// The coordinator-assigned shape of a region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionDefinition {
    pub id: i64,
    pub epoch: RegionEpoch,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub peers: Vec<Peer>,
    pub partition_id: i64,
}

impl RegionDefinition {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.epoch.version.to_be_bytes());
        buf.extend_from_slice(&self.epoch.conf_version.to_be_bytes());
        buf.extend_from_slice(&self.partition_id.to_be_bytes());
        buf.extend_from_slice(&(self.start_key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.start_key);
        buf.extend_from_slice(&(self.end_key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.end_key);
        buf.extend_from_slice(&(self.peers.len() as u32).to_be_bytes());
        for peer in &self.peers {
            buf.extend_from_slice(&peer.store_id.to_be_bytes());
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let i64_at = |pos: &mut usize| -> Result<i64> {
            if *pos + 8 > data.len() {
                return Err(Error::internal("region definition truncated"));
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[*pos..*pos + 8]);
            *pos += 8;
            Ok(i64::from_be_bytes(buf))
        };
        let id = i64_at(&mut pos)?;
        let version = i64_at(&mut pos)?;
        let conf_version = i64_at(&mut pos)?;
        let partition_id = i64_at(&mut pos)?;

        let bytes_at = |pos: &mut usize| -> Result<Vec<u8>> {
            if *pos + 4 > data.len() {
                return Err(Error::internal("region definition truncated"));
            }
            let mut lbuf = [0u8; 4];
            lbuf.copy_from_slice(&data[*pos..*pos + 4]);
            let len = u32::from_be_bytes(lbuf) as usize;
            *pos += 4;
            if *pos + len > data.len() {
                return Err(Error::internal("region definition truncated"));
            }
            let out = data[*pos..*pos + len].to_vec();
            *pos += len;
            Ok(out)
        };
        let start_key = bytes_at(&mut pos)?;
        let end_key = bytes_at(&mut pos)?;

        if pos + 4 > data.len() {
            return Err(Error::internal("region definition truncated"));
        }
        let mut lbuf = [0u8; 4];
        lbuf.copy_from_slice(&data[pos..pos + 4]);
        let peer_count = u32::from_be_bytes(lbuf) as usize;
        pos += 4;
        let mut peers = Vec::with_capacity(peer_count);
        for _ in 0..peer_count {
            peers.push(Peer {
                store_id: i64_at(&mut pos)?,
            });
        }

        Ok(Self {
            id,
            epoch: RegionEpoch::new(version, conf_version),
            start_key,
            end_key,
            peers,
            partition_id,
        })
    }
}

/// Serving-side counters reported to the coordinator
#[derive(Default)]
pub struct RegionStatistics {
    serving_request_count: AtomicI32,
    last_serving_time_ms: AtomicI64,
}

/// Runtime region object
pub struct Region {
    definition: Mutex<RegionDefinition>,
    state: AtomicU8,
    state_history: Mutex<Vec<RegionState>>,
    is_leader: AtomicBool,
    disable_change: AtomicBool,
    temporary_disable_change: AtomicBool,
    raw_applied_max_ts: AtomicI64,
    txn_access_max_ts: AtomicI64,
    statistics: RegionStatistics,
    latches: Latches,
    lock_table: MemoryLockTable,
    // The wrappers carry only this region's id back, never an Arc<Region>;
    // the region owns them and the cycle stays one-directional.
    vector_index: RwLock<Option<Arc<VectorIndexWrapper>>>,
    document_index: RwLock<Option<Arc<DocumentIndexWrapper>>>,
}

impl Region {
    pub fn new(definition: RegionDefinition) -> Arc<Self> {
        Arc::new(Self {
            definition: Mutex::new(definition),
            state: AtomicU8::new(RegionState::New as u8),
            state_history: Mutex::new(vec![RegionState::New]),
            is_leader: AtomicBool::new(true),
            disable_change: AtomicBool::new(false),
            temporary_disable_change: AtomicBool::new(false),
            raw_applied_max_ts: AtomicI64::new(0),
            txn_access_max_ts: AtomicI64::new(0),
            statistics: RegionStatistics::default(),
            latches: Latches::new(),
            lock_table: MemoryLockTable::new(),
            vector_index: RwLock::new(None),
            document_index: RwLock::new(None),
        })
    }

    pub fn id(&self) -> i64 {
        self.definition.lock().id
    }

    pub fn partition_id(&self) -> i64 {
        self.definition.lock().partition_id
    }

    pub fn epoch(&self) -> RegionEpoch {
        self.definition.lock().epoch
    }

    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        let def = self.definition.lock();
        (def.start_key.clone(), def.end_key.clone())
    }

    pub fn definition(&self) -> RegionDefinition {
        self.definition.lock().clone()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.definition.lock().peers.clone()
    }

    pub fn set_peers(&self, peers: Vec<Peer>) {
        self.definition.lock().peers = peers;
    }

    /// Raise the epoch version together with the new range (split/merge).
    /// The version only moves forward.
    pub fn set_epoch_version_and_range(&self, version: i64, start_key: Vec<u8>, end_key: Vec<u8>) {
        let mut def = self.definition.lock();
        if version > def.epoch.version {
            def.epoch.version = version;
            def.start_key = start_key;
            def.end_key = end_key;
        }
    }

    pub fn set_epoch_conf_version(&self, conf_version: i64) {
        let mut def = self.definition.lock();
        if conf_version > def.epoch.conf_version {
            def.epoch.conf_version = conf_version;
        }
    }

    pub fn state(&self) -> RegionState {
        RegionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: RegionState) {
        self.state.store(state as u8, Ordering::Release);
        self.state_history.lock().push(state);
    }

    pub fn state_history(&self) -> Vec<RegionState> {
        self.state_history.lock().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    pub fn set_leader(&self, leader: bool) {
        self.is_leader.store(leader, Ordering::Release);
    }

    pub fn disable_change(&self) -> bool {
        self.disable_change.load(Ordering::Acquire)
    }

    pub fn set_disable_change(&self, disable: bool) {
        self.disable_change.store(disable, Ordering::Release);
    }

    pub fn temporary_disable_change(&self) -> bool {
        self.temporary_disable_change.load(Ordering::Acquire)
    }

    pub fn set_temporary_disable_change(&self, disable: bool) {
        self.temporary_disable_change.store(disable, Ordering::Release);
    }

    /// Monotone high-water mark of applied raw timestamps
    pub fn raw_applied_max_ts(&self) -> Ts {
        self.raw_applied_max_ts.load(Ordering::Acquire)
    }

    pub fn set_raw_applied_max_ts(&self, ts: Ts) {
        self.raw_applied_max_ts.fetch_max(ts, Ordering::AcqRel);
    }

    /// Monotone high-water mark of transactional access timestamps
    pub fn txn_access_max_ts(&self) -> Ts {
        self.txn_access_max_ts.load(Ordering::Acquire)
    }

    pub fn set_txn_access_max_ts(&self, ts: Ts) {
        self.txn_access_max_ts.fetch_max(ts, Ordering::AcqRel);
    }

    pub fn latches(&self) -> &Latches {
        &self.latches
    }

    pub fn lock_table(&self) -> &MemoryLockTable {
        &self.lock_table
    }

    pub fn vector_index(&self) -> Option<Arc<VectorIndexWrapper>> {
        self.vector_index.read().clone()
    }

    pub fn set_vector_index(&self, wrapper: Arc<VectorIndexWrapper>) {
        *self.vector_index.write() = Some(wrapper);
    }

    pub fn document_index(&self) -> Option<Arc<DocumentIndexWrapper>> {
        self.document_index.read().clone()
    }

    pub fn set_document_index(&self, wrapper: Arc<DocumentIndexWrapper>) {
        *self.document_index.write() = Some(wrapper);
    }

    pub fn inc_serving_request_count(&self) {
        self.statistics
            .serving_request_count
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_serving_request_count(&self) {
        self.statistics
            .serving_request_count
            .fetch_sub(1, Ordering::Relaxed);
    }

    pub fn serving_request_count(&self) -> i32 {
        self.statistics
            .serving_request_count
            .load(Ordering::Relaxed)
    }

    pub fn update_last_serving_time(&self, now_ms: i64) {
        self.statistics
            .last_serving_time_ms
            .store(now_ms, Ordering::Relaxed);
    }

    pub fn last_serving_time_ms(&self) -> i64 {
        self.statistics.last_serving_time_ms.load(Ordering::Relaxed)
    }

    /// An encoded user key belongs to this region when it falls in
    /// `[start_key, end_key)`. An empty end_key is unbounded.
    pub fn check_key_in_range(&self, key: &[u8]) -> bool {
        let def = self.definition.lock();
        key >= def.start_key.as_slice() && (def.end_key.is_empty() || key < def.end_key.as_slice())
    }

    /// Validate the client's routing epoch against ours
    pub fn validate_epoch(&self, ctx: &RequestContext) -> Result<()> {
        let def = self.definition.lock();
        if ctx.epoch.version != def.epoch.version
            || ctx.epoch.conf_version != def.epoch.conf_version
        {
            return Err(Error::EpochNotMatch {
                region_id: def.id,
                request_version: ctx.epoch.version,
                request_conf_version: ctx.epoch.conf_version,
                current_version: def.epoch.version,
                current_conf_version: def.epoch.conf_version,
            });
        }
        Ok(())
    }

    /// Only the leader serves transactional operations
    pub fn validate_leader(&self) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::NotLeader(self.id()));
        }
        Ok(())
    }

    /// Gate writes on region lifecycle state
    pub fn validate_for_write(&self) -> Result<()> {
        let state = self.state();
        match state {
            RegionState::Normal => {}
            RegionState::Splitting | RegionState::Merging => {
                if self.disable_change() || self.temporary_disable_change() {
                    return Err(Error::RegionNotReady(
                        self.id(),
                        format!("{:?} with change disabled", state),
                    ));
                }
            }
            other => {
                return Err(Error::RegionNotReady(self.id(), format!("state {:?}", other)));
            }
        }
        Ok(())
    }

    /// Validate that every key of a request lies in this region's range
    pub fn validate_keys_in_range(&self, keys: &[Vec<u8>]) -> Result<()> {
        for key in keys {
            if key.is_empty() {
                return Err(Error::KeyEmpty);
            }
            if !self.check_key_in_range(key) {
                return Err(Error::RangeInvalid(format!(
                    "key outside region {} range",
                    self.id()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> RegionDefinition {
        RegionDefinition {
            id: 7,
            epoch: RegionEpoch::new(1, 1),
            start_key: vec![0x10],
            end_key: vec![0x20],
            peers: vec![Peer { store_id: 1 }, Peer { store_id: 2 }],
            partition_id: 3,
        }
    }

    #[test]
    fn test_definition_roundtrip() {
        let def = definition();
        let decoded = RegionDefinition::from_bytes(&def.to_bytes()).unwrap();
        assert_eq!(decoded, def);
    }

    #[test]
    fn test_definition_truncated() {
        let bytes = definition().to_bytes();
        assert!(RegionDefinition::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn test_key_in_range() {
        let region = Region::new(definition());
        assert!(region.check_key_in_range(&[0x10]));
        assert!(region.check_key_in_range(&[0x15]));
        assert!(!region.check_key_in_range(&[0x20]));
        assert!(!region.check_key_in_range(&[0x05]));
    }

    #[test]
    fn test_epoch_validation() {
        let region = Region::new(definition());
        let ok_ctx = RequestContext::new(7, RegionEpoch::new(1, 1));
        assert!(region.validate_epoch(&ok_ctx).is_ok());

        let stale_ctx = RequestContext::new(7, RegionEpoch::new(0, 1));
        match region.validate_epoch(&stale_ctx) {
            Err(Error::EpochNotMatch {
                current_version, ..
            }) => assert_eq!(current_version, 1),
            other => panic!("expected EpochNotMatch, got {:?}", other),
        }
    }

    #[test]
    fn test_split_raises_version_monotonically() {
        let region = Region::new(definition());
        region.set_epoch_version_and_range(5, vec![0x10], vec![0x18]);
        assert_eq!(region.epoch().version, 5);
        // Stale update is ignored
        region.set_epoch_version_and_range(3, vec![0x00], vec![0xFF]);
        assert_eq!(region.epoch().version, 5);
        assert_eq!(region.range(), (vec![0x10], vec![0x18]));
    }

    #[test]
    fn test_write_gate_by_state() {
        let region = Region::new(definition());
        assert!(region.validate_for_write().is_err()); // New

        region.set_state(RegionState::Normal);
        assert!(region.validate_for_write().is_ok());

        region.set_state(RegionState::Splitting);
        assert!(region.validate_for_write().is_ok());
        region.set_disable_change(true);
        assert!(matches!(
            region.validate_for_write(),
            Err(Error::RegionNotReady(7, _))
        ));

        region.set_state(RegionState::Tombstone);
        assert!(region.validate_for_write().is_err());
    }

    #[test]
    fn test_monotone_watermarks() {
        let region = Region::new(definition());
        region.set_raw_applied_max_ts(10);
        region.set_raw_applied_max_ts(5);
        assert_eq!(region.raw_applied_max_ts(), 10);
        region.set_txn_access_max_ts(42);
        region.set_txn_access_max_ts(41);
        assert_eq!(region.txn_access_max_ts(), 42);
    }
}
