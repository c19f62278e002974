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

//! # Rangekv — per-region transactional storage and indexing engine
//!
//! Rangekv is the storage half of a sharded multi-model store: it owns
//! one replicated key range (a *region*), keeps MVCC visibility over a
//! pluggable byte-level KV engine, runs a percolator-style two-phase
//! commit with optimistic and pessimistic locking, and maintains
//! secondary vector/document indexes that ride the same MVCC timeline.
//!
//! ## Key Components
//!
//! - **MVCC + percolator 2PC** — `Prewrite`/`Commit`/`PessimisticLock`/
//!   `CheckTxnStatus`/`ResolveLock` with conflicts returned as structured
//!   results, never exceptions
//! - **Latch manager** — FIFO per-key admission for concurrent writers
//! - **Memory lock table** — lock conflicts answered without storage reads
//! - **Vector & document indexes** — flat and HNSW variants plus an
//!   inverted text index, updated exactly once per committed key
//! - **Scheduler** — bounded read/write/background worker pools with
//!   round-robin and least-loaded dispatch and `RequestFull` backpressure
//! - **Streams** — server-side cursors for large scans, pinned snapshots,
//!   TTL expiry
//! - **GC safe point** — monotone watermark gating reads and driving
//!   physical version removal
//! - **Backup/restore** — checksummed range captures at a timestamp
//!
//! ## Quick Start
//!
//! ```rust
//! use rangekv::api::Store;
//! use rangekv::core::{Mutation, RegionEpoch, RequestContext};
//! use rangekv::storage::{Config, PrewriteRequest, RegionDefinition, Peer};
//!
//! let store = Store::open(Config::inline_for_test());
//! let region = store
//!     .create_region(RegionDefinition {
//!         id: 1,
//!         epoch: RegionEpoch::new(1, 1),
//!         start_key: vec![],
//!         end_key: vec![],
//!         peers: vec![Peer { store_id: 1 }],
//!         partition_id: 1,
//!     })
//!     .unwrap();
//!
//! let ctx = RequestContext::new(1, region.epoch());
//! let req = PrewriteRequest::new(
//!     vec![Mutation::put(b"k1".to_vec(), b"v1".to_vec())],
//!     b"k1".to_vec(),
//!     100,
//!     3000,
//! );
//! assert!(store.txn_prewrite(&ctx, req).unwrap().is_empty());
//! store.txn_commit(&ctx, vec![b"k1".to_vec()], 100, 110).unwrap();
//! ```
//!
//! ## Modules
//!
//! - [`api`] - The store facade ([`api::Store`])
//! - [`core`] - Core types ([`core::Error`], timestamps, mutations, context)
//! - [`storage`] - Engine seam, MVCC, transactions, regions, indexes,
//!   scheduling, streams, backup

pub mod api;
pub mod core;
pub mod storage;

// Re-export main types for convenience
pub use crate::core::{
    DocumentWithId, Error, ErrorCode, IsolationLevel, LockInfo, Mutation, Op, RegionEpoch,
    RequestContext, Result, ScalarValue, Ts, TxnResultInfo, VectorWithId,
};

// Re-export storage types
pub use storage::{
    BackupRunner, BackupStats, CfName, Config, DocumentIndexWrapper, GcRunner, GcSafePointManager,
    Latches, LocalLog, MemEngine, MemoryLockTable, MetricType, MvccReader, PessimisticLockRequest,
    PessimisticLockResult, PreFilter, PrewriteRequest, RawEngine, ReadOutcome, Region,
    RegionDefinition, RegionState, ReplicatedLog, SearchFilters, SnapshotView, StoreMetaManager,
    StreamManager, TxnEngine, TxnStatus, VectorIndexParameter, VectorIndexType,
    VectorIndexWrapper, WorkerSet, WriteBatch,
};

// Re-export API types
pub use api::{ScanResponse, Store};
