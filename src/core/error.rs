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

//! Error types for rangekv
//!
//! This module defines all error types used throughout the region engine,
//! plus the stable wire-level error codes clients dispatch on.

use thiserror::Error;

/// Result type alias for rangekv operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error codes carried in the response envelope.
///
/// Clients depend on these values staying fixed; new codes are appended,
/// never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,

    // Routing
    EpochNotMatch = 10001,
    RegionNotFound = 10002,
    RegionNotReady = 10003,
    NotLeader = 10004,

    // Transactional
    KeyIsLocked = 20001,
    WriteConflict = 20002,
    TxnLockNotFound = 20003,
    TxnRolledBack = 20004,
    CommitTsExpired = 20005,
    TxnAlreadyCommitted = 20006,

    // Input
    IllegalParameter = 30001,
    KeyEmpty = 30002,
    RangeInvalid = 30003,
    BatchExceeded = 30004,
    RequestSizeExceeded = 30005,

    // Overload / state
    RequestFull = 40001,
    StreamExpired = 40002,
    IndexNotReady = 40003,
    IndexBuildError = 40004,
    ClusterReadOnly = 40005,
    SafePointExceeded = 40006,
    Cancelled = 40007,

    // Fatal
    Internal = 50001,
    EngineIo = 50002,
    CorruptedInternalKey = 50003,
}

/// Main error type for region engine operations
///
/// Transactional *conflicts* (a key is locked, a write-write conflict) are
/// not represented here — those are structured results the client resolves
/// via the lock-resolution protocol. This enum covers routing, validation,
/// state, overload and engine failures, plus the terminal transaction
/// outcomes that abort an RPC outright.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // =========================================================================
    // Routing errors — the client refreshes metadata and retries
    // =========================================================================
    /// Region is not served by this store
    #[error("region {0} not found")]
    RegionNotFound(i64),

    /// Request epoch is stale; the current definition is attached so the
    /// client can refresh its routing table without another round trip
    #[error("region {region_id} epoch not match, request {request_version}/{request_conf_version}, current {current_version}/{current_conf_version}")]
    EpochNotMatch {
        region_id: i64,
        request_version: i64,
        request_conf_version: i64,
        current_version: i64,
        current_conf_version: i64,
    },

    /// Region exists but this peer is not the leader
    #[error("region {0} peer is not leader")]
    NotLeader(i64),

    /// Region is mid split/merge and refusing changes
    #[error("region {0} not ready: {1}")]
    RegionNotReady(i64, String),

    // =========================================================================
    // Transaction terminal outcomes
    // =========================================================================
    /// Commit found no lock and no rollback record for the transaction
    #[error("txn lock not found, start_ts {start_ts}")]
    TxnLockNotFound { start_ts: i64 },

    /// Commit found a rollback record: the transaction was already rolled back
    #[error("txn already rolled back, start_ts {start_ts}")]
    TxnRolledBack { start_ts: i64 },

    /// Proposed commit_ts is no longer usable for the primary lock
    #[error("commit_ts {commit_ts} expired, min_commit_ts {min_commit_ts}")]
    CommitTsExpired { commit_ts: i64, min_commit_ts: i64 },

    /// Rollback refused: the transaction already committed
    #[error("txn already committed at {commit_ts}, start_ts {start_ts}")]
    TxnAlreadyCommitted { start_ts: i64, commit_ts: i64 },

    // =========================================================================
    // Input errors — no retry is useful
    // =========================================================================
    /// Malformed or out-of-range parameter
    #[error("illegal parameter: {0}")]
    IllegalParameter(String),

    /// A key in the request is empty
    #[error("key is empty")]
    KeyEmpty,

    /// start_key >= end_key, or the range falls outside the region
    #[error("range invalid: {0}")]
    RangeInvalid(String),

    /// Batch size over the configured cap
    #[error("batch count {got} exceeds max {max}")]
    BatchExceeded { got: usize, max: usize },

    /// Serialized request size over the configured cap
    #[error("request size {got} exceeds max {max}")]
    RequestSizeExceeded { got: usize, max: usize },

    // =========================================================================
    // Overload / state errors — retryable after the condition clears
    // =========================================================================
    /// Worker queue full; the client backs off and retries
    #[error("request full: {0}")]
    RequestFull(String),

    /// Stream cursor expired or was never issued
    #[error("stream {0} expired")]
    StreamExpired(u64),

    /// Secondary index is still building
    #[error("region {0} index not ready")]
    IndexNotReady(i64),

    /// Secondary index build failed and needs a rebuild
    #[error("region {region_id} index build error: {message}")]
    IndexBuildError { region_id: i64, message: String },

    /// Cluster-wide read-only switch is on
    #[error("cluster is read-only")]
    ClusterReadOnly,

    /// Read timestamp is below the GC safe point
    #[error("read ts {requested} below gc safe point {safe_point}")]
    SafePointExceeded { requested: i64, safe_point: i64 },

    /// Request deadline passed before the task started
    #[error("request cancelled: deadline exceeded")]
    Cancelled,

    // =========================================================================
    // Fatal errors
    // =========================================================================
    /// Underlying engine I/O failure
    #[error("engine io error: {0}")]
    EngineIo(String),

    /// Internal key failed to decode (bad length or suffix)
    #[error("corrupted internal key: {0}")]
    CorruptedInternalKey(String),

    /// Internal error for unexpected conditions
    #[error("{message}")]
    Internal { message: String },
}

impl Error {
    /// Create a new IllegalParameter error
    pub fn illegal(message: impl Into<String>) -> Self {
        Error::IllegalParameter(message.into())
    }

    /// Create a new Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Create a new EngineIo error
    pub fn engine_io(message: impl Into<String>) -> Self {
        Error::EngineIo(message.into())
    }

    /// Create a new CorruptedInternalKey error
    pub fn corrupted_key(message: impl Into<String>) -> Self {
        Error::CorruptedInternalKey(message.into())
    }

    /// Create a new RequestFull error
    pub fn request_full(message: impl Into<String>) -> Self {
        Error::RequestFull(message.into())
    }

    /// The stable wire code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::RegionNotFound(_) => ErrorCode::RegionNotFound,
            Error::EpochNotMatch { .. } => ErrorCode::EpochNotMatch,
            Error::NotLeader(_) => ErrorCode::NotLeader,
            Error::RegionNotReady(_, _) => ErrorCode::RegionNotReady,
            Error::TxnLockNotFound { .. } => ErrorCode::TxnLockNotFound,
            Error::TxnRolledBack { .. } => ErrorCode::TxnRolledBack,
            Error::CommitTsExpired { .. } => ErrorCode::CommitTsExpired,
            Error::TxnAlreadyCommitted { .. } => ErrorCode::TxnAlreadyCommitted,
            Error::IllegalParameter(_) => ErrorCode::IllegalParameter,
            Error::KeyEmpty => ErrorCode::KeyEmpty,
            Error::RangeInvalid(_) => ErrorCode::RangeInvalid,
            Error::BatchExceeded { .. } => ErrorCode::BatchExceeded,
            Error::RequestSizeExceeded { .. } => ErrorCode::RequestSizeExceeded,
            Error::RequestFull(_) => ErrorCode::RequestFull,
            Error::StreamExpired(_) => ErrorCode::StreamExpired,
            Error::IndexNotReady(_) => ErrorCode::IndexNotReady,
            Error::IndexBuildError { .. } => ErrorCode::IndexBuildError,
            Error::ClusterReadOnly => ErrorCode::ClusterReadOnly,
            Error::SafePointExceeded { .. } => ErrorCode::SafePointExceeded,
            Error::Cancelled => ErrorCode::Cancelled,
            Error::EngineIo(_) => ErrorCode::EngineIo,
            Error::CorruptedInternalKey(_) => ErrorCode::CorruptedInternalKey,
            Error::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// Check if this is a routing error (client refreshes metadata and retries)
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            Error::RegionNotFound(_)
                | Error::EpochNotMatch { .. }
                | Error::NotLeader(_)
                | Error::RegionNotReady(_, _)
        )
    }

    /// Check if this error clears on its own and is worth retrying in place
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::RequestFull(_)
                | Error::RegionNotReady(_, _)
                | Error::IndexNotReady(_)
                | Error::ClusterReadOnly
                | Error::StreamExpired(_)
        )
    }

    /// Check if this is an input validation error (retry is useless)
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            Error::IllegalParameter(_)
                | Error::KeyEmpty
                | Error::RangeInvalid(_)
                | Error::BatchExceeded { .. }
                | Error::RequestSizeExceeded { .. }
        )
    }

    /// Check if this error indicates engine-level corruption or I/O failure
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::EngineIo(_) | Error::CorruptedInternalKey(_) | Error::Internal { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::EngineIo(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::RegionNotFound(7).to_string(), "region 7 not found");
        assert_eq!(Error::KeyEmpty.to_string(), "key is empty");
        assert_eq!(
            Error::BatchExceeded {
                got: 5000,
                max: 4096
            }
            .to_string(),
            "batch count 5000 exceeds max 4096"
        );
        assert_eq!(
            Error::SafePointExceeded {
                requested: 90,
                safe_point: 100
            }
            .to_string(),
            "read ts 90 below gc safe point 100"
        );
    }

    #[test]
    fn test_error_codes_stable() {
        assert_eq!(Error::RegionNotFound(1).code() as u32, 10002);
        assert_eq!(Error::KeyEmpty.code() as u32, 30002);
        assert_eq!(Error::request_full("q").code() as u32, 40001);
        assert_eq!(Error::internal("x").code() as u32, 50001);
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::RegionNotFound(1).is_routing());
        assert!(Error::NotLeader(1).is_routing());
        assert!(!Error::KeyEmpty.is_routing());

        assert!(Error::request_full("queue").is_retriable());
        assert!(Error::IndexNotReady(1).is_retriable());
        assert!(!Error::KeyEmpty.is_retriable());

        assert!(Error::KeyEmpty.is_input());
        assert!(Error::illegal("ts").is_input());
        assert!(!Error::ClusterReadOnly.is_input());

        assert!(Error::corrupted_key("short suffix").is_fatal());
        assert!(!Error::ClusterReadOnly.is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::EngineIo(_)));
        assert!(err.to_string().contains("file missing"));
    }
}
