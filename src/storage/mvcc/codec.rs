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

//! MVCC key encoding/decoding
//!
//! User keys carry a one-byte namespace prefix and a big-endian partition
//! id so that byte order equals logical order. Internal keys in the Write
//! and Data CFs append the bitwise complement of the timestamp: iterating
//! forward over one user key yields commit records newest-first. The Lock
//! CF appends a single zero sentinel so lock keys never collide with
//! timestamped keys.
//!
//! Within one region, user keys must never be proper prefixes of one
//! another — otherwise their timestamped internal keys interleave. The
//! fixed-width entity layout (prefix ∥ partition ∥ 8-byte id) guarantees
//! this for every key the engine constructs itself.

use crate::core::{Error, Result, Ts};

// User-key namespace prefixes (raw/txn × executor/client)
pub const PREFIX_EXECUTOR_RAW: u8 = b'r';
pub const PREFIX_EXECUTOR_TXN: u8 = b't';
pub const PREFIX_CLIENT_RAW: u8 = b'w';
pub const PREFIX_CLIENT_TXN: u8 = b'x';

/// Length of the fixed user-key header: prefix byte + partition id
pub const USER_KEY_HEADER_LEN: usize = 9;

/// Timestamp suffix length on Write/Data CF keys
pub const TS_SUFFIX_LEN: usize = 8;

/// Lock CF sentinel suffix
pub const LOCK_SENTINEL: u8 = 0x00;

/// Invert a timestamp so larger (newer) timestamps sort first
#[inline]
pub fn invert_ts(ts: Ts) -> [u8; 8] {
    (!(ts as u64)).to_be_bytes()
}

/// Recover a timestamp from its inverted big-endian form
#[inline]
pub fn revert_ts(bytes: &[u8]) -> Ts {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    !u64::from_be_bytes(buf) as Ts
}

/// Encode a user key: prefix ∥ partition_id (8B BE) ∥ id_or_bytes
pub fn encode_user_key(prefix: u8, partition_id: i64, id_or_bytes: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(USER_KEY_HEADER_LEN + id_or_bytes.len());
    key.push(prefix);
    key.extend_from_slice(&(partition_id as u64).to_be_bytes());
    key.extend_from_slice(id_or_bytes);
    key
}

/// Encode a user key whose payload is an 8-byte big-endian entity id
pub fn encode_entity_key(prefix: u8, partition_id: i64, id: i64) -> Vec<u8> {
    encode_user_key(prefix, partition_id, &(id as u64).to_be_bytes())
}

/// Extract the partition id from an encoded user key
pub fn decode_partition_id(user_key: &[u8]) -> Result<i64> {
    if user_key.len() < USER_KEY_HEADER_LEN {
        return Err(Error::corrupted_key(format!(
            "user key too short for partition id: {} bytes",
            user_key.len()
        )));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&user_key[1..9]);
    Ok(u64::from_be_bytes(buf) as i64)
}

/// Extract the entity id from a user key carrying an 8-byte id payload
pub fn decode_entity_id(user_key: &[u8]) -> Result<i64> {
    if user_key.len() != USER_KEY_HEADER_LEN + 8 {
        return Err(Error::corrupted_key(format!(
            "user key length {} does not carry an entity id",
            user_key.len()
        )));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&user_key[USER_KEY_HEADER_LEN..]);
    Ok(u64::from_be_bytes(buf) as i64)
}

/// Write CF key: user_key ∥ ~commit_ts
pub fn encode_write(user_key: &[u8], commit_ts: Ts) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_key.len() + TS_SUFFIX_LEN);
    key.extend_from_slice(user_key);
    key.extend_from_slice(&invert_ts(commit_ts));
    key
}

/// Data CF key: user_key ∥ ~start_ts
pub fn encode_data(user_key: &[u8], start_ts: Ts) -> Vec<u8> {
    encode_write(user_key, start_ts)
}

/// Lock CF key: user_key ∥ 0x00 sentinel
pub fn encode_lock(user_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_key.len() + 1);
    key.extend_from_slice(user_key);
    key.push(LOCK_SENTINEL);
    key
}

/// Split a Write/Data CF key back into (user_key, ts)
pub fn decode_ts_key(internal_key: &[u8]) -> Result<(&[u8], Ts)> {
    if internal_key.len() <= TS_SUFFIX_LEN {
        return Err(Error::corrupted_key(format!(
            "internal key length {} too short for ts suffix",
            internal_key.len()
        )));
    }
    let split = internal_key.len() - TS_SUFFIX_LEN;
    Ok((&internal_key[..split], revert_ts(&internal_key[split..])))
}

/// Strip the lock sentinel from a Lock CF key
pub fn decode_lock_key(internal_key: &[u8]) -> Result<&[u8]> {
    match internal_key.split_last() {
        Some((&LOCK_SENTINEL, user_key)) if !user_key.is_empty() => Ok(user_key),
        _ => Err(Error::corrupted_key(
            "lock key missing sentinel suffix".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts_inversion_roundtrip() {
        for ts in [0i64, 1, 100, i64::MAX - 1] {
            assert_eq!(revert_ts(&invert_ts(ts)), ts);
        }
    }

    #[test]
    fn test_newer_commit_sorts_first() {
        let key = encode_entity_key(PREFIX_CLIENT_TXN, 1, 42);
        let newer = encode_write(&key, 200);
        let older = encode_write(&key, 100);
        // Forward iteration must meet the newer commit first
        assert!(newer < older);
    }

    #[test]
    fn test_user_key_roundtrip() {
        let key = encode_entity_key(PREFIX_CLIENT_TXN, 77, 42);
        assert_eq!(key.len(), USER_KEY_HEADER_LEN + 8);
        assert_eq!(decode_partition_id(&key).unwrap(), 77);
        assert_eq!(decode_entity_id(&key).unwrap(), 42);
    }

    #[test]
    fn test_ts_key_roundtrip() {
        let key = encode_user_key(PREFIX_EXECUTOR_TXN, 3, b"abc");
        let internal = encode_write(&key, 1234);
        let (user_key, ts) = decode_ts_key(&internal).unwrap();
        assert_eq!(user_key, key.as_slice());
        assert_eq!(ts, 1234);
    }

    #[test]
    fn test_lock_key_roundtrip() {
        let key = encode_user_key(PREFIX_CLIENT_TXN, 3, b"abc");
        let lock = encode_lock(&key);
        assert_eq!(decode_lock_key(&lock).unwrap(), key.as_slice());
    }

    #[test]
    fn test_corrupted_keys_rejected() {
        assert!(decode_ts_key(&[1, 2, 3]).is_err());
        assert!(decode_lock_key(&[]).is_err());
        assert!(decode_lock_key(&[0x7f]).is_err());
        assert!(decode_entity_id(b"short").is_err());
        assert!(decode_partition_id(b"x").is_err());
    }

    #[test]
    fn test_lock_key_sorts_before_ts_keys() {
        // Within one user key the lock sentinel (single 0x00) must not be
        // confused with any ~ts suffix; decode functions disambiguate by
        // length, scans by CF.
        let key = encode_entity_key(PREFIX_CLIENT_TXN, 1, 7);
        let lock = encode_lock(&key);
        let write = encode_write(&key, i64::MAX - 1);
        assert_ne!(lock, write);
    }
}
