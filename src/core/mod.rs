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

//! Core types for rangekv: errors, timestamps, mutations, request context

pub mod context;
pub mod error;
pub mod types;

pub use context::{
    ConflictReason, LockInfo, RegionEpoch, RequestContext, TxnNotFound, TxnResultInfo,
    WriteConflictInfo,
};
pub use error::{Error, ErrorCode, Result};
pub use types::{
    check_entity_id, check_ids_unique, DocumentWithId, IsolationLevel, Mutation, Op, ScalarValue,
    Ts, VectorWithId,
};
