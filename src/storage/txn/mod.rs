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

//! Transaction layer: latches, the in-flight lock table, the percolator
//! two-phase commit engine, and MVCC garbage collection

pub mod engine;
pub mod gc;
pub mod latch;
pub mod lock_table;

pub use engine::{
    PessimisticLockRequest, PessimisticLockResult, PrewriteRequest, TxnEngine, TxnStatus,
};
pub use gc::{GcRunner, GcStats};
pub use latch::Latches;
pub use lock_table::MemoryLockTable;
