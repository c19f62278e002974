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

//! Storage layer: the byte engine seam, MVCC, transactions, regions,
//! secondary indexes, scheduling, streams, and backup

pub mod backup;
pub mod config;
pub mod engine;
pub mod index;
pub mod mvcc;
pub mod raftlog;
pub mod region;
pub mod scheduler;
pub mod stream;
pub mod txn;

pub use backup::{BackupRunner, BackupStats};
pub use config::Config;
pub use engine::{CfName, KvPair, MemEngine, RawEngine, SnapshotView, WriteBatch};
pub use index::{
    DocumentHit, DocumentIndex, DocumentIndexWrapper, FlatIndex, HnswIndex, IndexState,
    MetricType, PreFilter, SearchFilters, VectorIndex, VectorIndexParameter, VectorIndexType,
    VectorIndexWrapper,
};
pub use mvcc::{LockRecord, LockType, MvccReader, ReadOutcome, WriteKind, WriteRecord};
pub use raftlog::{LocalLog, ReplicatedLog};
pub use region::{
    GcSafePointManager, Peer, Region, RegionDefinition, RegionState, StoreMetaManager,
    StoreRegionMeta,
};
pub use scheduler::{Task, WorkerSet};
pub use stream::StreamManager;
pub use txn::{
    GcRunner, GcStats, Latches, MemoryLockTable, PessimisticLockRequest, PessimisticLockResult,
    PrewriteRequest, TxnEngine, TxnStatus,
};
