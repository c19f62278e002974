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

//! Server-side scan cursors
//!
//! A large scan is chopped into bounded chunks under a stable stream id.
//! The registry pins the snapshot the scan started on, so every resumed
//! chunk observes the same frozen history, and remembers the resume key.
//! Streams expire on a TTL; a resumed expired stream surfaces
//! `StreamExpired` and the client restarts the scan.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::core::{Error, Result, Ts};
use crate::storage::engine::SnapshotView;

/// Cursor state for one open stream
pub struct StreamState {
    pub region_id: i64,
    pub snapshot: Arc<dyn SnapshotView>,
    pub read_ts: Ts,
    pub next_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub resolved_locks: Vec<Ts>,
    expire_at: Instant,
}

/// Process-wide stream registry
pub struct StreamManager {
    streams: DashMap<u64, Arc<Mutex<StreamState>>>,
    next_id: AtomicU64,
    ttl: Duration,
}

impl StreamManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            streams: DashMap::new(),
            next_id: AtomicU64::new(1),
            ttl,
        }
    }

    /// Register a new stream and hand out its id
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &self,
        region_id: i64,
        snapshot: Arc<dyn SnapshotView>,
        read_ts: Ts,
        next_key: Vec<u8>,
        end_key: Vec<u8>,
        resolved_locks: Vec<Ts>,
    ) -> u64 {
        let stream_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.streams.insert(
            stream_id,
            Arc::new(Mutex::new(StreamState {
                region_id,
                snapshot,
                read_ts,
                next_key,
                end_key,
                resolved_locks,
                expire_at: Instant::now() + self.ttl,
            })),
        );
        stream_id
    }

    /// Fetch a live stream, refreshing its TTL. Expired streams are
    /// dropped and reported.
    pub fn resume(&self, stream_id: u64) -> Result<Arc<Mutex<StreamState>>> {
        let state = self
            .streams
            .get(&stream_id)
            .map(|s| Arc::clone(&s))
            .ok_or(Error::StreamExpired(stream_id))?;
        {
            let mut guard = state.lock();
            if guard.expire_at < Instant::now() {
                drop(guard);
                self.streams.remove(&stream_id);
                return Err(Error::StreamExpired(stream_id));
            }
            guard.expire_at = Instant::now() + self.ttl;
        }
        Ok(state)
    }

    /// Remember where the next chunk starts
    pub fn advance(&self, stream_id: u64, next_key: Vec<u8>) {
        if let Some(state) = self.streams.get(&stream_id) {
            state.lock().next_key = next_key;
        }
    }

    /// Drop a finished stream
    pub fn close(&self, stream_id: u64) {
        self.streams.remove(&stream_id);
    }

    /// Evict every stream past its TTL; returns how many were dropped
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .streams
            .iter()
            .filter(|entry| entry.value().lock().expire_at < now)
            .map(|entry| *entry.key())
            .collect();
        for stream_id in &expired {
            self.streams.remove(stream_id);
        }
        expired.len()
    }

    pub fn open_stream_count(&self) -> usize {
        self.streams.len()
    }
}
