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

//! Byte-level KV engine seam
//!
//! The region engine treats the underlying byte store as an opaque
//! collaborator: atomic multi-column-family batch writes, point reads,
//! bounded range scans, and consistent snapshots. [`MemEngine`] is the
//! in-crate implementation; a disk engine plugs in behind the same trait.

pub mod memory;

use std::sync::Arc;

use crate::core::Result;

pub use memory::MemEngine;

/// Logical column families of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CfName {
    /// User values written at start_ts
    Data = 0,
    /// Primary locks keyed by user key
    Lock = 1,
    /// Commit records keyed by user_key ∥ ~commit_ts
    Write = 2,
    /// Reserved internal prefixes (region meta, raft meta, change records)
    Meta = 3,
}

impl CfName {
    pub const ALL: [CfName; 4] = [CfName::Data, CfName::Lock, CfName::Write, CfName::Meta];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// A key-value pair returned from scans
pub type KvPair = (Vec<u8>, Vec<u8>);

/// One entry in a write batch
#[derive(Debug, Clone)]
pub enum BatchEntry {
    Put {
        cf: CfName,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: CfName,
        key: Vec<u8>,
    },
}

/// An atomic multi-CF write.
///
/// All entries become visible together or not at all; durability follows
/// the replicated-log commit that carries the batch.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    entries: Vec<BatchEntry>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, cf: CfName, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.entries.push(BatchEntry::Put {
            cf,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, cf: CfName, key: impl Into<Vec<u8>>) {
        self.entries.push(BatchEntry::Delete { cf, key: key.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<BatchEntry> {
        self.entries
    }

    /// Total serialized payload size, used for request-size caps
    pub fn payload_size(&self) -> usize {
        self.entries
            .iter()
            .map(|e| match e {
                BatchEntry::Put { key, value, .. } => key.len() + value.len(),
                BatchEntry::Delete { key, .. } => key.len(),
            })
            .sum()
    }
}

/// A consistent point-in-time view across all column families.
///
/// Snapshots are cheap to take and keep alive; the stream manager holds
/// one per open cursor so resumed scans observe a frozen history.
pub trait SnapshotView: Send + Sync {
    /// Point read from one CF
    fn get(&self, cf: CfName, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Scan `[start, end)` in one CF, ascending, at most `limit` pairs.
    /// An empty `end` means unbounded.
    fn scan(&self, cf: CfName, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>>;
}

/// The byte-store contract the region engine is built over
pub trait RawEngine: Send + Sync {
    /// Apply a batch atomically across CFs
    fn write(&self, batch: WriteBatch) -> Result<()>;

    /// Point read of the latest value
    fn get(&self, cf: CfName, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Scan `[start, end)` over the latest state, ascending, at most
    /// `limit` pairs. An empty `end` means unbounded.
    fn scan(&self, cf: CfName, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>>;

    /// Take a consistent snapshot across all CFs
    fn snapshot(&self) -> Arc<dyn SnapshotView>;
}

/// Compute the tight exclusive upper bound for a prefix scan:
/// the prefix with its last non-0xFF byte incremented.
pub fn prefix_end_key(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return end;
        }
        end.pop();
    }
    // All 0xFF: no tight bound exists, scan to infinity
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_batch_accounting() {
        let mut batch = WriteBatch::new();
        assert!(batch.is_empty());
        batch.put(CfName::Data, b"key".to_vec(), b"value".to_vec());
        batch.delete(CfName::Lock, b"key".to_vec());
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.payload_size(), 3 + 5 + 3);
    }

    #[test]
    fn test_prefix_end_key() {
        assert_eq!(prefix_end_key(b"abc"), b"abd".to_vec());
        assert_eq!(prefix_end_key(&[0x01, 0xFF]), vec![0x02]);
        assert_eq!(prefix_end_key(&[0xFF, 0xFF]), Vec::<u8>::new());
    }
}
