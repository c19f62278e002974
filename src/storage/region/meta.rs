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

//! Persisted store metadata
//!
//! Region definitions, raft progress, and region-change job records live
//! under reserved prefixes in the Meta CF and are replayed on restart.
//! The in-memory maps are the source of truth while running; every
//! mutation writes through to the engine.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::core::{Error, Result};
use crate::storage::engine::{CfName, RawEngine, WriteBatch};
use crate::storage::region::safepoint::GcSafePointManager;
use crate::storage::region::{Region, RegionDefinition, RegionState};

const REGION_META_PREFIX: &[u8] = b"store_region_meta|";
const RAFT_META_PREFIX: &[u8] = b"store_raft_meta|";
const CHANGE_RECORD_PREFIX: &[u8] = b"region_change_record|";

fn prefixed_key(prefix: &[u8], id: i64) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn prefix_upper(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    *end.last_mut().unwrap() += 1;
    end
}

/// Raft progress for one region: term and highest applied log index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RaftMeta {
    pub region_id: i64,
    pub term: i64,
    pub applied_index: i64,
}

impl RaftMeta {
    fn to_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        buf.extend_from_slice(&self.region_id.to_be_bytes());
        buf.extend_from_slice(&self.term.to_be_bytes());
        buf.extend_from_slice(&self.applied_index.to_be_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != 24 {
            return Err(Error::internal("malformed raft meta record"));
        }
        let read = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[at..at + 8]);
            i64::from_be_bytes(buf)
        };
        Ok(Self {
            region_id: read(0),
            term: read(8),
            applied_index: read(16),
        })
    }
}

/// One split/merge job's event trail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionChangeRecord {
    pub job_id: i64,
    pub region_id: i64,
    pub events: Vec<String>,
}

impl RegionChangeRecord {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(&self.job_id.to_be_bytes());
        buf.extend_from_slice(&self.region_id.to_be_bytes());
        buf.extend_from_slice(&(self.events.len() as u32).to_be_bytes());
        for event in &self.events {
            let bytes = event.as_bytes();
            buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            buf.extend_from_slice(bytes);
        }
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 20 {
            return Err(Error::internal("malformed change record"));
        }
        let mut buf8 = [0u8; 8];
        buf8.copy_from_slice(&data[0..8]);
        let job_id = i64::from_be_bytes(buf8);
        buf8.copy_from_slice(&data[8..16]);
        let region_id = i64::from_be_bytes(buf8);
        let mut buf4 = [0u8; 4];
        buf4.copy_from_slice(&data[16..20]);
        let count = u32::from_be_bytes(buf4) as usize;
        let mut pos = 20;
        let mut events = Vec::with_capacity(count);
        for _ in 0..count {
            if pos + 4 > data.len() {
                return Err(Error::internal("malformed change record"));
            }
            buf4.copy_from_slice(&data[pos..pos + 4]);
            let len = u32::from_be_bytes(buf4) as usize;
            pos += 4;
            if pos + len > data.len() {
                return Err(Error::internal("malformed change record"));
            }
            events.push(String::from_utf8_lossy(&data[pos..pos + len]).into_owned());
            pos += len;
        }
        Ok(Self {
            job_id,
            region_id,
            events,
        })
    }
}

/// Tracks split/merge jobs so operators can reconstruct what happened
pub struct RegionChangeRecorder {
    engine: Arc<dyn RawEngine>,
    records: Mutex<FxHashMap<i64, RegionChangeRecord>>,
}

impl RegionChangeRecorder {
    pub fn new(engine: Arc<dyn RawEngine>) -> Self {
        Self {
            engine,
            records: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn recover(&self) -> Result<()> {
        let end = prefix_upper(CHANGE_RECORD_PREFIX);
        let mut records = self.records.lock();
        for (_, value) in
            self.engine
                .scan(CfName::Meta, CHANGE_RECORD_PREFIX, &end, usize::MAX)?
        {
            let record = RegionChangeRecord::from_bytes(&value)?;
            records.insert(record.job_id, record);
        }
        Ok(())
    }

    /// Append an event to a job's trail, creating the record on first use
    pub fn add_event(&self, job_id: i64, region_id: i64, event: impl Into<String>) -> Result<()> {
        let record = {
            let mut records = self.records.lock();
            let record = records.entry(job_id).or_insert_with(|| RegionChangeRecord {
                job_id,
                region_id,
                events: Vec::new(),
            });
            record.events.push(event.into());
            record.clone()
        };
        let mut batch = WriteBatch::new();
        batch.put(
            CfName::Meta,
            prefixed_key(CHANGE_RECORD_PREFIX, job_id),
            record.to_bytes(),
        );
        self.engine.write(batch)
    }

    pub fn record(&self, job_id: i64) -> Option<RegionChangeRecord> {
        self.records.lock().get(&job_id).cloned()
    }

    pub fn records_for_region(&self, region_id: i64) -> Vec<RegionChangeRecord> {
        self.records
            .lock()
            .values()
            .filter(|r| r.region_id == region_id)
            .cloned()
            .collect()
    }
}

/// All regions served by this store, write-through persisted
pub struct StoreRegionMeta {
    engine: Arc<dyn RawEngine>,
    regions: DashMap<i64, Arc<Region>>,
}

impl StoreRegionMeta {
    pub fn new(engine: Arc<dyn RawEngine>) -> Self {
        Self {
            engine,
            regions: DashMap::new(),
        }
    }

    fn persist(&self, region: &Region) -> Result<()> {
        let definition = region.definition();
        let mut value = vec![region.state() as u8];
        value.extend_from_slice(&definition.to_bytes());
        let mut batch = WriteBatch::new();
        batch.put(
            CfName::Meta,
            prefixed_key(REGION_META_PREFIX, definition.id),
            value,
        );
        self.engine.write(batch)
    }

    /// Replay persisted regions on restart. Regions that reached
    /// `Deleted` are dropped rather than revived.
    pub fn recover(&self) -> Result<usize> {
        let end = prefix_upper(REGION_META_PREFIX);
        let mut recovered = 0usize;
        for (_, value) in self
            .engine
            .scan(CfName::Meta, REGION_META_PREFIX, &end, usize::MAX)?
        {
            if value.is_empty() {
                return Err(Error::internal("empty region meta record"));
            }
            let state = RegionState::from_u8(value[0]);
            let definition = RegionDefinition::from_bytes(&value[1..])?;
            if state == RegionState::Deleted {
                continue;
            }
            let region = Region::new(definition);
            region.set_state(state);
            info!(region_id = region.id(), ?state, "recovered region");
            self.regions.insert(region.id(), region);
            recovered += 1;
        }
        Ok(recovered)
    }

    pub fn add_region(&self, region: Arc<Region>) -> Result<()> {
        self.persist(&region)?;
        self.regions.insert(region.id(), region);
        Ok(())
    }

    pub fn get_region(&self, region_id: i64) -> Option<Arc<Region>> {
        self.regions.get(&region_id).map(|r| r.clone())
    }

    pub fn is_exist_region(&self, region_id: i64) -> bool {
        self.regions.contains_key(&region_id)
    }

    pub fn get_all_regions(&self) -> Vec<Arc<Region>> {
        self.regions.iter().map(|r| r.clone()).collect()
    }

    /// Regions still serving traffic (not torn down)
    pub fn get_all_alive_regions(&self) -> Vec<Arc<Region>> {
        self.regions
            .iter()
            .filter(|r| {
                !matches!(
                    r.state(),
                    RegionState::Tombstone | RegionState::Deleting | RegionState::Deleted
                )
            })
            .map(|r| r.clone())
            .collect()
    }

    pub fn update_state(&self, region_id: i64, state: RegionState) -> Result<()> {
        let region = self
            .get_region(region_id)
            .ok_or(Error::RegionNotFound(region_id))?;
        region.set_state(state);
        self.persist(&region)?;
        if state == RegionState::Deleted {
            self.regions.remove(&region_id);
            let mut batch = WriteBatch::new();
            batch.delete(CfName::Meta, prefixed_key(REGION_META_PREFIX, region_id));
            self.engine.write(batch)?;
        }
        Ok(())
    }

    pub fn update_epoch_version_and_range(
        &self,
        region_id: i64,
        version: i64,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
    ) -> Result<()> {
        let region = self
            .get_region(region_id)
            .ok_or(Error::RegionNotFound(region_id))?;
        region.set_epoch_version_and_range(version, start_key, end_key);
        self.persist(&region)
    }

    pub fn update_epoch_conf_version(&self, region_id: i64, conf_version: i64) -> Result<()> {
        let region = self
            .get_region(region_id)
            .ok_or(Error::RegionNotFound(region_id))?;
        region.set_epoch_conf_version(conf_version);
        self.persist(&region)
    }
}

/// Raft progress map, write-through persisted
pub struct StoreRaftMeta {
    engine: Arc<dyn RawEngine>,
    metas: DashMap<i64, RaftMeta>,
}

impl StoreRaftMeta {
    pub fn new(engine: Arc<dyn RawEngine>) -> Self {
        Self {
            engine,
            metas: DashMap::new(),
        }
    }

    pub fn recover(&self) -> Result<()> {
        let end = prefix_upper(RAFT_META_PREFIX);
        for (_, value) in self
            .engine
            .scan(CfName::Meta, RAFT_META_PREFIX, &end, usize::MAX)?
        {
            let meta = RaftMeta::from_bytes(&value)?;
            self.metas.insert(meta.region_id, meta);
        }
        Ok(())
    }

    pub fn set_term_and_applied(&self, region_id: i64, term: i64, applied_index: i64) -> Result<()> {
        let meta = RaftMeta {
            region_id,
            term,
            applied_index,
        };
        self.metas.insert(region_id, meta);
        let mut batch = WriteBatch::new();
        batch.put(
            CfName::Meta,
            prefixed_key(RAFT_META_PREFIX, region_id),
            meta.to_bytes(),
        );
        self.engine.write(batch)
    }

    pub fn get(&self, region_id: i64) -> Option<RaftMeta> {
        self.metas.get(&region_id).map(|m| *m)
    }

    pub fn delete(&self, region_id: i64) -> Result<()> {
        self.metas.remove(&region_id);
        let mut batch = WriteBatch::new();
        batch.delete(CfName::Meta, prefixed_key(RAFT_META_PREFIX, region_id));
        self.engine.write(batch)
    }
}

/// Bundle of all store-level metadata services
pub struct StoreMetaManager {
    region_meta: Arc<StoreRegionMeta>,
    raft_meta: Arc<StoreRaftMeta>,
    change_recorder: Arc<RegionChangeRecorder>,
    safe_points: Arc<GcSafePointManager>,
}

impl StoreMetaManager {
    pub fn new(engine: Arc<dyn RawEngine>) -> Self {
        Self {
            region_meta: Arc::new(StoreRegionMeta::new(engine.clone())),
            raft_meta: Arc::new(StoreRaftMeta::new(engine.clone())),
            change_recorder: Arc::new(RegionChangeRecorder::new(engine.clone())),
            safe_points: Arc::new(GcSafePointManager::new(engine)),
        }
    }

    /// Replay all persisted metadata after restart
    pub fn recover(&self) -> Result<()> {
        let regions = self.region_meta.recover()?;
        self.raft_meta.recover()?;
        self.change_recorder.recover()?;
        self.safe_points.recover()?;
        if regions > 0 {
            info!(regions, "store meta recovered");
        } else {
            warn!("store meta recovery found no regions");
        }
        Ok(())
    }

    pub fn region_meta(&self) -> &Arc<StoreRegionMeta> {
        &self.region_meta
    }

    pub fn raft_meta(&self) -> &Arc<StoreRaftMeta> {
        &self.raft_meta
    }

    pub fn change_recorder(&self) -> &Arc<RegionChangeRecorder> {
        &self.change_recorder
    }

    pub fn safe_points(&self) -> &Arc<GcSafePointManager> {
        &self.safe_points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RegionEpoch;
    use crate::storage::engine::MemEngine;
    use crate::storage::region::Peer;

    fn definition(id: i64) -> RegionDefinition {
        RegionDefinition {
            id,
            epoch: RegionEpoch::new(1, 1),
            start_key: vec![0x00],
            end_key: vec![],
            peers: vec![Peer { store_id: 1 }],
            partition_id: id,
        }
    }

    #[test]
    fn test_region_meta_persist_and_recover() {
        let engine: Arc<dyn RawEngine> = Arc::new(MemEngine::new());
        {
            let meta = StoreRegionMeta::new(engine.clone());
            let region = Region::new(definition(1));
            region.set_state(RegionState::Normal);
            meta.add_region(region).unwrap();
            meta.add_region(Region::new(definition(2))).unwrap();
            meta.update_state(2, RegionState::Normal).unwrap();
            meta.update_epoch_version_and_range(1, 3, vec![0x00], vec![0x80])
                .unwrap();
        }

        let meta = StoreRegionMeta::new(engine);
        assert_eq!(meta.recover().unwrap(), 2);
        let region = meta.get_region(1).unwrap();
        assert_eq!(region.epoch().version, 3);
        assert_eq!(region.state(), RegionState::Normal);
        assert_eq!(region.range(), (vec![0x00], vec![0x80]));
    }

    #[test]
    fn test_deleted_region_not_recovered() {
        let engine: Arc<dyn RawEngine> = Arc::new(MemEngine::new());
        {
            let meta = StoreRegionMeta::new(engine.clone());
            meta.add_region(Region::new(definition(1))).unwrap();
            meta.update_state(1, RegionState::Tombstone).unwrap();
            meta.update_state(1, RegionState::Deleted).unwrap();
        }
        let meta = StoreRegionMeta::new(engine);
        assert_eq!(meta.recover().unwrap(), 0);
        assert!(!meta.is_exist_region(1));
    }

    #[test]
    fn test_raft_meta_roundtrip() {
        let engine: Arc<dyn RawEngine> = Arc::new(MemEngine::new());
        {
            let raft = StoreRaftMeta::new(engine.clone());
            raft.set_term_and_applied(1, 5, 42).unwrap();
        }
        let raft = StoreRaftMeta::new(engine);
        raft.recover().unwrap();
        let meta = raft.get(1).unwrap();
        assert_eq!(meta.term, 5);
        assert_eq!(meta.applied_index, 42);
    }

    #[test]
    fn test_change_recorder() {
        let engine: Arc<dyn RawEngine> = Arc::new(MemEngine::new());
        {
            let recorder = RegionChangeRecorder::new(engine.clone());
            recorder.add_event(100, 1, "split begin").unwrap();
            recorder.add_event(100, 1, "split commit").unwrap();
        }
        let recorder = RegionChangeRecorder::new(engine);
        recorder.recover().unwrap();
        let record = recorder.record(100).unwrap();
        assert_eq!(record.events, vec!["split begin", "split commit"]);
        assert_eq!(recorder.records_for_region(1).len(), 1);
    }
}
