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

//! Replicated-log seam
//!
//! Replication is an external collaborator: the engine hands a write
//! batch to [`ReplicatedLog::propose`] and regains control once the batch
//! is committed and applied to the byte store. Apply order per region is
//! total — the state machine applies one entry at a time — which is what
//! gives every key a single commit order.
//!
//! [`LocalLog`] is the in-process implementation: it applies inline under
//! a per-region mutex and tracks the applied index, standing in for a
//! real consensus stack behind the same seam.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::core::Result;
use crate::storage::engine::{RawEngine, WriteBatch};

/// Ordered, durable application of write batches per region
pub trait ReplicatedLog: Send + Sync {
    /// Propose a batch and wait for commit + apply.
    ///
    /// Returns the applied log index. Past this call the batch is visible
    /// to every reader taking a fresh snapshot.
    fn propose(&self, region_id: i64, batch: WriteBatch) -> Result<i64>;

    /// Highest applied log index for a region
    fn applied_index(&self, region_id: i64) -> i64;
}

struct RegionLog {
    apply_mutex: Mutex<()>,
    applied_index: AtomicI64,
}

/// Inline apply: proposal order == apply order, one batch at a time per region
pub struct LocalLog {
    engine: Arc<dyn RawEngine>,
    regions: DashMap<i64, Arc<RegionLog>>,
}

impl LocalLog {
    pub fn new(engine: Arc<dyn RawEngine>) -> Self {
        Self {
            engine,
            regions: DashMap::new(),
        }
    }

    fn region_log(&self, region_id: i64) -> Arc<RegionLog> {
        self.regions
            .entry(region_id)
            .or_insert_with(|| {
                Arc::new(RegionLog {
                    apply_mutex: Mutex::new(()),
                    applied_index: AtomicI64::new(0),
                })
            })
            .clone()
    }
}

impl ReplicatedLog for LocalLog {
    fn propose(&self, region_id: i64, batch: WriteBatch) -> Result<i64> {
        let log = self.region_log(region_id);
        let _apply_guard = log.apply_mutex.lock();
        self.engine.write(batch)?;
        Ok(log.applied_index.fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn applied_index(&self, region_id: i64) -> i64 {
        self.regions
            .get(&region_id)
            .map(|log| log.applied_index.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}
