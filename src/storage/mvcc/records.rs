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

//! Lock and write record formats
//!
//! Records use a hand-rolled binary layout: fixed-width big-endian
//! integers followed by length-prefixed byte fields. Values at or below
//! [`SHORT_VALUE_MAX`] are inlined into the record; larger values live in
//! the Data CF at the transaction's start_ts.

use crate::core::{Error, LockInfo, Result, Ts};

/// Values no longer than this are inlined into lock/write records
pub const SHORT_VALUE_MAX: usize = 255;

/// What kind of mutation a lock protects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockType {
    Put = 0,
    Delete = 1,
    /// Placeholder taken by PessimisticLock before the real mutation is known
    Pessimistic = 2,
    /// Lock-only mutation: commits to a value-less Lock write record
    Lock = 3,
}

impl LockType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(LockType::Put),
            1 => Ok(LockType::Delete),
            2 => Ok(LockType::Pessimistic),
            3 => Ok(LockType::Lock),
            other => Err(Error::internal(format!("unknown lock type {}", other))),
        }
    }
}

/// Commit record kind stored in the Write CF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriteKind {
    Put = 0,
    Delete = 1,
    Rollback = 2,
    /// Commit of a Lock-op mutation; carries no value
    Lock = 3,
}

impl WriteKind {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(WriteKind::Put),
            1 => Ok(WriteKind::Delete),
            2 => Ok(WriteKind::Rollback),
            3 => Ok(WriteKind::Lock),
            other => Err(Error::internal(format!("unknown write kind {}", other))),
        }
    }
}

/// A lock on one user key. Exactly one may exist per key at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub lock_type: LockType,
    pub primary_lock: Vec<u8>,
    pub start_ts: Ts,
    pub for_update_ts: Ts,
    pub ttl_ms: i64,
    pub txn_size: u64,
    pub min_commit_ts: Ts,
    pub use_async_commit: bool,
    pub secondaries: Vec<Vec<u8>>,
    pub short_value: Option<Vec<u8>>,
}

impl LockRecord {
    pub fn is_pessimistic(&self) -> bool {
        self.lock_type == LockType::Pessimistic
    }

    /// Client-visible projection surfaced on conflict
    pub fn to_lock_info(&self, key: &[u8]) -> LockInfo {
        LockInfo {
            primary_lock: self.primary_lock.clone(),
            lock_ts: self.start_ts,
            key: key.to_vec(),
            lock_ttl: self.ttl_ms,
            txn_size: self.txn_size,
            is_pessimistic: self.is_pessimistic(),
            for_update_ts: self.for_update_ts,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.primary_lock.len());
        buf.push(self.lock_type as u8);
        buf.extend_from_slice(&self.start_ts.to_be_bytes());
        buf.extend_from_slice(&self.for_update_ts.to_be_bytes());
        buf.extend_from_slice(&self.ttl_ms.to_be_bytes());
        buf.extend_from_slice(&self.txn_size.to_be_bytes());
        buf.extend_from_slice(&self.min_commit_ts.to_be_bytes());
        buf.push(self.use_async_commit as u8);
        put_bytes(&mut buf, &self.primary_lock);
        buf.extend_from_slice(&(self.secondaries.len() as u32).to_be_bytes());
        for secondary in &self.secondaries {
            put_bytes(&mut buf, secondary);
        }
        match &self.short_value {
            Some(v) => {
                buf.push(1);
                put_bytes(&mut buf, v);
            }
            None => buf.push(0),
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let lock_type = LockType::from_u8(cur.u8()?)?;
        let start_ts = cur.i64()?;
        let for_update_ts = cur.i64()?;
        let ttl_ms = cur.i64()?;
        let txn_size = cur.i64()? as u64;
        let min_commit_ts = cur.i64()?;
        let use_async_commit = cur.u8()? != 0;
        let primary_lock = cur.bytes()?;
        let secondary_count = cur.u32()? as usize;
        let mut secondaries = Vec::with_capacity(secondary_count);
        for _ in 0..secondary_count {
            secondaries.push(cur.bytes()?);
        }
        let short_value = if cur.u8()? != 0 {
            Some(cur.bytes()?)
        } else {
            None
        };
        Ok(Self {
            lock_type,
            primary_lock,
            start_ts,
            for_update_ts,
            ttl_ms,
            txn_size,
            min_commit_ts,
            use_async_commit,
            secondaries,
            short_value,
        })
    }
}

/// A commit (or rollback) record stored at user_key ∥ ~commit_ts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub kind: WriteKind,
    pub start_ts: Ts,
    pub short_value: Option<Vec<u8>>,
}

impl WriteRecord {
    pub fn new(kind: WriteKind, start_ts: Ts) -> Self {
        Self {
            kind,
            start_ts,
            short_value: None,
        }
    }

    pub fn with_short_value(mut self, value: Option<Vec<u8>>) -> Self {
        self.short_value = value;
        self
    }

    /// Rollback and Lock records leave no user-visible value
    pub fn is_visible_kind(&self) -> bool {
        matches!(self.kind, WriteKind::Put | WriteKind::Delete)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.start_ts.to_be_bytes());
        match &self.short_value {
            Some(v) => {
                buf.push(1);
                put_bytes(&mut buf, v);
            }
            None => buf.push(0),
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let kind = WriteKind::from_u8(cur.u8()?)?;
        let start_ts = cur.i64()?;
        let short_value = if cur.u8()? != 0 {
            Some(cur.bytes()?)
        } else {
            None
        };
        Ok(Self {
            kind,
            start_ts,
            short_value,
        })
    }
}

#[inline]
fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Minimal bounds-checked reader over a record payload
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::internal("record truncated"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn i64(&mut self) -> Result<i64> {
        let raw = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(i64::from_be_bytes(buf))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_lock() -> LockRecord {
        LockRecord {
            lock_type: LockType::Put,
            primary_lock: b"primary".to_vec(),
            start_ts: 100,
            for_update_ts: 0,
            ttl_ms: 3000,
            txn_size: 2,
            min_commit_ts: 101,
            use_async_commit: false,
            secondaries: vec![b"k2".to_vec(), b"k3".to_vec()],
            short_value: Some(b"v".to_vec()),
        }
    }

    #[test]
    fn test_lock_record_roundtrip() {
        let lock = sample_lock();
        let decoded = LockRecord::from_bytes(&lock.to_bytes()).unwrap();
        assert_eq!(decoded, lock);
    }

    #[test]
    fn test_lock_record_no_short_value() {
        let mut lock = sample_lock();
        lock.short_value = None;
        lock.secondaries.clear();
        let decoded = LockRecord::from_bytes(&lock.to_bytes()).unwrap();
        assert_eq!(decoded, lock);
    }

    #[test]
    fn test_write_record_roundtrip() {
        let record = WriteRecord::new(WriteKind::Put, 100).with_short_value(Some(b"v1".to_vec()));
        let decoded = WriteRecord::from_bytes(&record.to_bytes()).unwrap();
        assert_eq!(decoded, record);

        let rollback = WriteRecord::new(WriteKind::Rollback, 55);
        let decoded = WriteRecord::from_bytes(&rollback.to_bytes()).unwrap();
        assert_eq!(decoded, rollback);
        assert!(!decoded.is_visible_kind());
    }

    #[test]
    fn test_truncated_record_rejected() {
        let bytes = sample_lock().to_bytes();
        assert!(LockRecord::from_bytes(&bytes[..bytes.len() - 3]).is_err());
        assert!(WriteRecord::from_bytes(&[0]).is_err());
    }

    #[test]
    fn test_lock_info_projection() {
        let lock = sample_lock();
        let info = lock.to_lock_info(b"the-key");
        assert_eq!(info.primary_lock, b"primary");
        assert_eq!(info.lock_ts, 100);
        assert_eq!(info.key, b"the-key");
        assert!(!info.is_pessimistic);
    }
}
