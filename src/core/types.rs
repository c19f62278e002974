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

//! Core data types shared across the region engine

use rustc_hash::FxHashMap;

use crate::core::{Error, Result};

/// Timestamps are monotone 64-bit integers handed out by an external
/// oracle. `start_ts` identifies a transaction; `commit_ts > start_ts`
/// orders its commit; `for_update_ts` is re-obtained on each pessimistic
/// lock acquisition.
pub type Ts = i64;

/// Isolation level carried in the request context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Reads see a consistent snapshot at the request timestamp
    #[default]
    SnapshotIsolation,
    /// Reads see the latest committed data, ignoring read-ts pinning
    ReadCommitted,
}

/// Mutation operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Put,
    Delete,
    /// Placeholder op used by pessimistic lock requests; carries no value
    Lock,
}

/// A single key mutation inside a prewrite or pessimistic-lock request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub op: Op,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Mutation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op: Op::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            op: Op::Delete,
            key: key.into(),
            value: Vec::new(),
        }
    }

    pub fn lock(key: impl Into<Vec<u8>>) -> Self {
        Self {
            op: Op::Lock,
            key: key.into(),
            value: Vec::new(),
        }
    }
}

/// Scalar field value attached to vectors and documents
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl ScalarValue {
    /// Loose equality used by pre-filters: same variant and same payload
    pub fn matches(&self, other: &ScalarValue) -> bool {
        self == other
    }
}

/// A vector row addressed by the numeric id embedded in its user key
#[derive(Debug, Clone, PartialEq)]
pub struct VectorWithId {
    pub id: i64,
    pub vector: Vec<f32>,
    pub scalar_fields: FxHashMap<String, ScalarValue>,
}

impl VectorWithId {
    pub fn new(id: i64, vector: Vec<f32>) -> Self {
        Self {
            id,
            vector,
            scalar_fields: FxHashMap::default(),
        }
    }

    pub fn with_scalar(mut self, key: impl Into<String>, value: ScalarValue) -> Self {
        self.scalar_fields.insert(key.into(), value);
        self
    }
}

/// A document row addressed by the numeric id embedded in its user key
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWithId {
    pub id: i64,
    pub fields: FxHashMap<String, ScalarValue>,
}

impl DocumentWithId {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            fields: FxHashMap::default(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: ScalarValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Validate a vector/document id: must be positive and below i64::MAX
pub fn check_entity_id(id: i64) -> Result<()> {
    if id <= 0 || id == i64::MAX {
        return Err(Error::illegal(format!(
            "entity id {} out of range (0, i64::MAX)",
            id
        )));
    }
    Ok(())
}

/// Validate that a batch of ids carries no duplicates
pub fn check_ids_unique(ids: &[i64]) -> Result<()> {
    let mut seen = rustc_hash::FxHashSet::default();
    for &id in ids {
        if !seen.insert(id) {
            return Err(Error::illegal(format!("duplicate entity id {}", id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_constructors() {
        let m = Mutation::put(b"k".to_vec(), b"v".to_vec());
        assert_eq!(m.op, Op::Put);
        assert_eq!(m.key, b"k");
        assert_eq!(m.value, b"v");

        let d = Mutation::delete(b"k".to_vec());
        assert_eq!(d.op, Op::Delete);
        assert!(d.value.is_empty());

        let l = Mutation::lock(b"k".to_vec());
        assert_eq!(l.op, Op::Lock);
    }

    #[test]
    fn test_entity_id_bounds() {
        assert!(check_entity_id(1).is_ok());
        assert!(check_entity_id(i64::MAX - 1).is_ok());
        assert!(check_entity_id(0).is_err());
        assert!(check_entity_id(-5).is_err());
        assert!(check_entity_id(i64::MAX).is_err());
    }

    #[test]
    fn test_duplicate_ids() {
        assert!(check_ids_unique(&[1, 2, 3]).is_ok());
        assert!(check_ids_unique(&[1, 2, 1]).is_err());
        assert!(check_ids_unique(&[]).is_ok());
    }
}
