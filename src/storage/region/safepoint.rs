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

//! GC safe-point bookkeeping
//!
//! The coordinator publishes a monotone low-watermark timestamp per
//! region. Versions below it may be physically removed, so the engine
//! refuses reads at `ts < safe_point` — the history they would need may
//! already be gone.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::core::{Error, Result, Ts};
use crate::storage::engine::{CfName, RawEngine, WriteBatch};

/// Meta CF prefix for persisted safe points
const SAFE_POINT_PREFIX: &[u8] = b"gc_safe_point|";

fn safe_point_key(region_id: i64) -> Vec<u8> {
    let mut key = SAFE_POINT_PREFIX.to_vec();
    key.extend_from_slice(&region_id.to_be_bytes());
    key
}

/// Process-wide safe-point map, persisted per region
pub struct GcSafePointManager {
    engine: Arc<dyn RawEngine>,
    points: DashMap<i64, Ts>,
}

impl GcSafePointManager {
    pub fn new(engine: Arc<dyn RawEngine>) -> Self {
        Self {
            engine,
            points: DashMap::new(),
        }
    }

    /// Load persisted safe points on restart
    pub fn recover(&self) -> Result<()> {
        let end = {
            let mut e = SAFE_POINT_PREFIX.to_vec();
            *e.last_mut().unwrap() += 1;
            e
        };
        for (key, value) in
            self.engine
                .scan(CfName::Meta, SAFE_POINT_PREFIX, &end, usize::MAX)?
        {
            if key.len() != SAFE_POINT_PREFIX.len() + 8 || value.len() != 8 {
                return Err(Error::internal("malformed safe point record"));
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&key[SAFE_POINT_PREFIX.len()..]);
            let region_id = i64::from_be_bytes(buf);
            buf.copy_from_slice(&value);
            self.points.insert(region_id, i64::from_be_bytes(buf));
        }
        Ok(())
    }

    /// Advance the safe point for a region. Regressions are ignored —
    /// the watermark only moves forward.
    pub fn update(&self, region_id: i64, safe_point: Ts) -> Result<()> {
        let mut advanced = false;
        {
            let mut entry = self.points.entry(region_id).or_insert(0);
            if safe_point > *entry {
                *entry = safe_point;
                advanced = true;
            }
        }
        if advanced {
            let mut batch = WriteBatch::new();
            batch.put(
                CfName::Meta,
                safe_point_key(region_id),
                safe_point.to_be_bytes().to_vec(),
            );
            self.engine.write(batch)?;
            info!(region_id, safe_point, "gc safe point advanced");
        }
        Ok(())
    }

    pub fn get(&self, region_id: i64) -> Ts {
        self.points.get(&region_id).map(|ts| *ts).unwrap_or(0)
    }

    /// Reject reads below the watermark
    pub fn check_read_ts(&self, region_id: i64, read_ts: Ts) -> Result<()> {
        let safe_point = self.get(region_id);
        if read_ts < safe_point {
            return Err(Error::SafePointExceeded {
                requested: read_ts,
                safe_point,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::engine::MemEngine;

    #[test]
    fn test_monotone_advance_and_check() {
        let engine = Arc::new(MemEngine::new());
        let manager = GcSafePointManager::new(engine);

        manager.update(1, 100).unwrap();
        manager.update(1, 50).unwrap();
        assert_eq!(manager.get(1), 100);
        assert_eq!(manager.get(2), 0);

        assert!(manager.check_read_ts(1, 100).is_ok());
        assert!(matches!(
            manager.check_read_ts(1, 99),
            Err(Error::SafePointExceeded {
                requested: 99,
                safe_point: 100
            })
        ));
    }

    #[test]
    fn test_recover_from_engine() {
        let engine = Arc::new(MemEngine::new());
        {
            let manager = GcSafePointManager::new(engine.clone());
            manager.update(1, 100).unwrap();
            manager.update(2, 200).unwrap();
        }
        let manager = GcSafePointManager::new(engine);
        manager.recover().unwrap();
        assert_eq!(manager.get(1), 100);
        assert_eq!(manager.get(2), 200);
    }
}
