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

//! End-to-end transaction protocol scenarios

use std::sync::Arc;

use rangekv::core::{Mutation, RegionEpoch, RequestContext};
use rangekv::storage::engine::CfName;
use rangekv::storage::mvcc::codec::{encode_lock, encode_write};
use rangekv::storage::mvcc::records::{LockRecord, LockType, WriteKind, WriteRecord};
use rangekv::storage::{
    Config, LocalLog, MemEngine, Peer, PessimisticLockRequest, PrewriteRequest, RawEngine,
    ReadOutcome, Region, RegionDefinition, TxnEngine, TxnStatus, WriteBatch,
};
use rangekv::{Error, Store};

fn full_range_region(id: i64) -> RegionDefinition {
    RegionDefinition {
        id,
        epoch: RegionEpoch::new(1, 1),
        start_key: vec![],
        end_key: vec![],
        peers: vec![Peer { store_id: 1 }],
        partition_id: id,
    }
}

fn open_store() -> (Arc<Store>, RequestContext) {
    let store = Store::open(Config::inline_for_test());
    let region = store.create_region(full_range_region(1)).unwrap();
    let ctx = RequestContext::new(1, region.epoch());
    (store, ctx)
}

fn get(store: &Store, ctx: &RequestContext, key: &[u8], ts: i64) -> Option<Vec<u8>> {
    match store.kv_get(ctx, key.to_vec(), ts).unwrap() {
        ReadOutcome::Value(v) => v,
        ReadOutcome::Locked(info) => panic!("unexpected lock at ts {}: {:?}", ts, info),
    }
}

#[test]
fn test_optimistic_commit_happy_path() {
    let (store, ctx) = open_store();

    let req = PrewriteRequest::new(
        vec![
            Mutation::put(b"k1".to_vec(), b"v1".to_vec()),
            Mutation::put(b"k2".to_vec(), b"v2".to_vec()),
        ],
        b"k1".to_vec(),
        100,
        3000,
    );
    assert!(store.txn_prewrite(&ctx, req).unwrap().is_empty());

    store
        .txn_commit(&ctx, vec![b"k1".to_vec(), b"k2".to_vec()], 100, 110)
        .unwrap();

    assert_eq!(get(&store, &ctx, b"k1", 120), Some(b"v1".to_vec()));
    assert_eq!(get(&store, &ctx, b"k2", 120), Some(b"v2".to_vec()));
    assert_eq!(get(&store, &ctx, b"k1", 95), None);
    assert_eq!(get(&store, &ctx, b"k2", 95), None);
}

#[test]
fn test_write_write_conflict() {
    let (store, ctx) = open_store();

    // Txn A locks k at start_ts 100
    let req_a = PrewriteRequest::new(
        vec![Mutation::put(b"k".to_vec(), b"vA".to_vec())],
        b"k".to_vec(),
        100,
        3000,
    );
    assert!(store.txn_prewrite(&ctx, req_a).unwrap().is_empty());

    // Txn B at 105 runs into A's lock
    let req_b = PrewriteRequest::new(
        vec![Mutation::put(b"k".to_vec(), b"vB".to_vec())],
        b"k".to_vec(),
        105,
        3000,
    );
    let results = store.txn_prewrite(&ctx, req_b.clone()).unwrap();
    assert_eq!(results.len(), 1);
    let locked = results[0].locked.as_ref().expect("KeyIsLocked expected");
    assert_eq!(locked.primary_lock, b"k");
    assert_eq!(locked.lock_ts, 100);
    assert_eq!(locked.lock_ttl, 3000);

    // A commits at 110
    store.txn_commit(&ctx, vec![b"k".to_vec()], 100, 110).unwrap();

    // B's replay at its old snapshot sees the write-write conflict
    let results = store.txn_prewrite(&ctx, req_b).unwrap();
    assert_eq!(results.len(), 1);
    let conflict = results[0]
        .write_conflict
        .as_ref()
        .expect("WriteConflict expected");
    assert_eq!(conflict.conflict_ts, 110);
    assert_eq!(conflict.start_ts, 105);

    // Restarting with a start_ts above the conflicting commit succeeds
    let req_b2 = PrewriteRequest::new(
        vec![Mutation::put(b"k".to_vec(), b"vB".to_vec())],
        b"k".to_vec(),
        120,
        3000,
    );
    assert!(store.txn_prewrite(&ctx, req_b2).unwrap().is_empty());
    store.txn_commit(&ctx, vec![b"k".to_vec()], 120, 130).unwrap();
    assert_eq!(get(&store, &ctx, b"k", 140), Some(b"vB".to_vec()));
}

#[test]
fn test_pessimistic_retry_with_new_for_update_ts() {
    // Engine-level scenario: the pessimistic lock is held at
    // for_update_ts 100 while an external commit landed at 120 (primary
    // expiry + resolve let it through). The prewrite conversion must ask
    // for a retry instead of silently losing the external write.
    let engine = Arc::new(MemEngine::new());
    let log = Arc::new(LocalLog::new(engine.clone()));
    let txn = TxnEngine::new(engine.clone() as Arc<dyn RawEngine>, log);
    let region = Region::new(full_range_region(1));

    let mut seed = WriteBatch::new();
    let lock = LockRecord {
        lock_type: LockType::Pessimistic,
        primary_lock: b"k".to_vec(),
        start_ts: 100,
        for_update_ts: 100,
        ttl_ms: 3000,
        txn_size: 1,
        min_commit_ts: 0,
        use_async_commit: false,
        secondaries: vec![],
        short_value: None,
    };
    seed.put(CfName::Lock, encode_lock(b"k"), lock.to_bytes());
    let external = WriteRecord::new(WriteKind::Put, 115).with_short_value(Some(b"x".to_vec()));
    seed.put(CfName::Write, encode_write(b"k", 120), external.to_bytes());
    engine.write(seed).unwrap();

    let mut req = PrewriteRequest::new(
        vec![Mutation::put(b"k".to_vec(), b"mine".to_vec())],
        b"k".to_vec(),
        100,
        3000,
    );
    req.pessimistic_checks = vec![true];
    req.for_update_ts_checks = vec![100];
    let results = txn.prewrite(&region, &req).unwrap();
    assert_eq!(results.len(), 1);
    let conflict = results[0]
        .write_conflict
        .as_ref()
        .expect("retry hint expected");
    assert_eq!(conflict.conflict_ts, 120);

    // Client re-locks with a fresh for_update_ts covering the commit
    let relock = PessimisticLockRequest {
        mutations: vec![Mutation::lock(b"k".to_vec())],
        primary_lock: b"k".to_vec(),
        start_ts: 100,
        for_update_ts: 130,
        lock_ttl: 3000,
        return_values: false,
    };
    let result = txn.pessimistic_lock(&region, &relock).unwrap();
    assert!(result.txn_results.is_empty());

    // Conversion with the new for_update_ts goes through
    let mut req = PrewriteRequest::new(
        vec![Mutation::put(b"k".to_vec(), b"mine".to_vec())],
        b"k".to_vec(),
        100,
        3000,
    );
    req.pessimistic_checks = vec![true];
    req.for_update_ts_checks = vec![130];
    assert!(txn.prewrite(&region, &req).unwrap().is_empty());
    txn.commit(&region, &[b"k".to_vec()], 100, 140).unwrap();
}

#[test]
fn test_primary_failure_resolved() {
    let (store, ctx) = open_store();

    // Client prewrites three keys at start_ts 100 with ttl 1000, then dies
    let req = PrewriteRequest::new(
        vec![
            Mutation::put(b"k1".to_vec(), b"v1".to_vec()),
            Mutation::put(b"k2".to_vec(), b"v2".to_vec()),
            Mutation::put(b"k3".to_vec(), b"v3".to_vec()),
        ],
        b"k1".to_vec(),
        100,
        1000,
    );
    assert!(store.txn_prewrite(&ctx, req).unwrap().is_empty());

    // Another transaction trips over the lock on k2
    match store.kv_get(&ctx, b"k2".to_vec(), 200).unwrap() {
        ReadOutcome::Locked(info) => {
            assert_eq!(info.primary_lock, b"k1");
            assert_eq!(info.lock_ts, 100);
        }
        other => panic!("expected lock conflict, got {:?}", other),
    }

    // Probe the primary well past the TTL: the engine protects it with a
    // rollback record
    let status = store
        .txn_check_status(&ctx, b"k1".to_vec(), 100, 200, 2000)
        .unwrap();
    assert_eq!(status, TxnStatus::LockNotExist);

    // Resolve the remaining secondaries
    store
        .txn_resolve_lock(&ctx, 100, 0, vec![b"k2".to_vec(), b"k3".to_vec()])
        .unwrap();

    // Reads pass and a new transaction takes the keys
    assert_eq!(get(&store, &ctx, b"k2", 200), None);
    let retry = PrewriteRequest::new(
        vec![Mutation::put(b"k2".to_vec(), b"w2".to_vec())],
        b"k2".to_vec(),
        200,
        3000,
    );
    assert!(store.txn_prewrite(&ctx, retry).unwrap().is_empty());
    store.txn_commit(&ctx, vec![b"k2".to_vec()], 200, 210).unwrap();
    assert_eq!(get(&store, &ctx, b"k2", 220), Some(b"w2".to_vec()));

    // The dead transaction can never commit afterwards
    assert!(matches!(
        store.txn_commit(&ctx, vec![b"k1".to_vec()], 100, 300),
        Err(Error::TxnRolledBack { start_ts: 100 })
    ));
}

#[test]
fn test_epoch_mismatch_returns_current_definition() {
    let (store, ctx) = open_store();

    // A split raises the version from 1 to 8
    store
        .meta()
        .region_meta()
        .update_epoch_version_and_range(1, 8, vec![], vec![])
        .unwrap();

    let stale = RequestContext::new(1, RegionEpoch::new(1, 1));
    match store.kv_get(&stale, b"k".to_vec(), 100) {
        Err(Error::EpochNotMatch {
            region_id,
            request_version,
            current_version,
            ..
        }) => {
            assert_eq!(region_id, 1);
            assert_eq!(request_version, 1);
            assert_eq!(current_version, 8);
        }
        other => panic!("expected EpochNotMatch, got {:?}", other),
    }

    // The refreshed epoch is served
    let fresh = RequestContext::new(1, RegionEpoch::new(8, 1));
    assert!(store.kv_get(&fresh, b"k".to_vec(), 100).is_ok());
    let _ = ctx;
}

// =========================================================================
// Property-style invariants
// =========================================================================

#[test]
fn test_idempotent_prewrite() {
    let (store, ctx) = open_store();
    let req = PrewriteRequest::new(
        vec![Mutation::put(b"k".to_vec(), b"v".to_vec())],
        b"k".to_vec(),
        100,
        3000,
    );
    assert!(store.txn_prewrite(&ctx, req.clone()).unwrap().is_empty());
    // The replay is absorbed without changing on-disk state
    assert!(store.txn_prewrite(&ctx, req).unwrap().is_empty());
    store.txn_commit(&ctx, vec![b"k".to_vec()], 100, 110).unwrap();
    assert_eq!(get(&store, &ctx, b"k", 120), Some(b"v".to_vec()));
    // Commit replay is also absorbed
    store.txn_commit(&ctx, vec![b"k".to_vec()], 100, 110).unwrap();
}

#[test]
fn test_commit_monotonicity_per_key() {
    let (store, ctx) = open_store();
    let mut versions = Vec::new();
    for i in 0..5i64 {
        let start_ts = 100 + i * 10;
        let commit_ts = start_ts + 5;
        let value = format!("v{}", i).into_bytes();
        let req = PrewriteRequest::new(
            vec![Mutation::put(b"k".to_vec(), value.clone())],
            b"k".to_vec(),
            start_ts,
            3000,
        );
        assert!(store.txn_prewrite(&ctx, req).unwrap().is_empty());
        store
            .txn_commit(&ctx, vec![b"k".to_vec()], start_ts, commit_ts)
            .unwrap();
        versions.push((commit_ts, value));
    }
    // A reader walking forward in time observes strictly increasing commits
    for (commit_ts, value) in &versions {
        assert_eq!(get(&store, &ctx, b"k", *commit_ts), Some(value.clone()));
    }
}

#[test]
fn test_lock_write_exclusion() {
    // For one (key, start_ts): after commit there is a write record and no
    // lock; after rollback there is a rollback record and no lock.
    let (store, ctx) = open_store();

    let req = PrewriteRequest::new(
        vec![Mutation::put(b"a".to_vec(), b"v".to_vec())],
        b"a".to_vec(),
        100,
        3000,
    );
    store.txn_prewrite(&ctx, req).unwrap();
    store.txn_commit(&ctx, vec![b"a".to_vec()], 100, 110).unwrap();
    let engine = store.raw_engine();
    assert!(engine.get(CfName::Lock, &encode_lock(b"a")).unwrap().is_none());
    assert!(engine.get(CfName::Write, &encode_write(b"a", 110)).unwrap().is_some());

    let req = PrewriteRequest::new(
        vec![Mutation::put(b"b".to_vec(), b"v".to_vec())],
        b"b".to_vec(),
        200,
        3000,
    );
    store.txn_prewrite(&ctx, req).unwrap();
    store.txn_batch_rollback(&ctx, vec![b"b".to_vec()], 200).unwrap();
    assert!(engine.get(CfName::Lock, &encode_lock(b"b")).unwrap().is_none());
    let rollback = engine.get(CfName::Write, &encode_write(b"b", 200)).unwrap().unwrap();
    assert_eq!(WriteRecord::from_bytes(&rollback).unwrap().kind, WriteKind::Rollback);

    // Rollback refuses once committed
    assert!(matches!(
        store.txn_batch_rollback(&ctx, vec![b"a".to_vec()], 100),
        Err(Error::TxnAlreadyCommitted { .. })
    ));
}

#[test]
fn test_snapshot_purity() {
    let (store, ctx) = open_store();
    let req = PrewriteRequest::new(
        vec![Mutation::put(b"k".to_vec(), b"old".to_vec())],
        b"k".to_vec(),
        100,
        3000,
    );
    store.txn_prewrite(&ctx, req).unwrap();
    store.txn_commit(&ctx, vec![b"k".to_vec()], 100, 110).unwrap();

    // A later prewrite (start_ts above the read point) must not disturb
    // the reader
    let req = PrewriteRequest::new(
        vec![Mutation::put(b"k".to_vec(), b"new".to_vec())],
        b"k".to_vec(),
        200,
        3000,
    );
    store.txn_prewrite(&ctx, req).unwrap();

    assert_eq!(get(&store, &ctx, b"k", 150), Some(b"old".to_vec()));

    store.txn_commit(&ctx, vec![b"k".to_vec()], 200, 210).unwrap();
    assert_eq!(get(&store, &ctx, b"k", 150), Some(b"old".to_vec()));
    assert_eq!(get(&store, &ctx, b"k", 220), Some(b"new".to_vec()));
}

#[test]
fn test_heart_beat_extends_ttl() {
    let (store, ctx) = open_store();
    let req = PrewriteRequest::new(
        vec![Mutation::put(b"k".to_vec(), b"v".to_vec())],
        b"k".to_vec(),
        100,
        1000,
    );
    store.txn_prewrite(&ctx, req).unwrap();

    assert_eq!(store.txn_heart_beat(&ctx, b"k".to_vec(), 100, 5000).unwrap(), 5000);
    // Lower advice never shrinks the TTL
    assert_eq!(store.txn_heart_beat(&ctx, b"k".to_vec(), 100, 200).unwrap(), 5000);

    // The lock now survives a probe at current_ts 2000
    let status = store
        .txn_check_status(&ctx, b"k".to_vec(), 100, 200, 2000)
        .unwrap();
    assert_eq!(
        status,
        TxnStatus::Locked {
            lock_ttl: 5000,
            min_commit_ts: 0
        }
    );

    // Unknown primary is reported, not invented
    assert!(matches!(
        store.txn_heart_beat(&ctx, b"other".to_vec(), 100, 1000),
        Err(Error::TxnLockNotFound { .. })
    ));
}

#[test]
fn test_check_status_committed_and_rolled_back() {
    let (store, ctx) = open_store();
    let req = PrewriteRequest::new(
        vec![Mutation::put(b"k".to_vec(), b"v".to_vec())],
        b"k".to_vec(),
        100,
        3000,
    );
    store.txn_prewrite(&ctx, req).unwrap();
    store.txn_commit(&ctx, vec![b"k".to_vec()], 100, 110).unwrap();
    assert_eq!(
        store.txn_check_status(&ctx, b"k".to_vec(), 100, 300, 9000).unwrap(),
        TxnStatus::Committed { commit_ts: 110 }
    );

    store.txn_batch_rollback(&ctx, vec![b"r".to_vec()], 50).unwrap();
    assert_eq!(
        store.txn_check_status(&ctx, b"r".to_vec(), 50, 300, 9000).unwrap(),
        TxnStatus::RolledBack
    );
}

#[test]
fn test_pessimistic_rollback_leaves_optimistic_locks() {
    let (store, ctx) = open_store();

    // Optimistic lock on k1, pessimistic on k2, same transaction
    let req = PrewriteRequest::new(
        vec![Mutation::put(b"k1".to_vec(), b"v".to_vec())],
        b"k1".to_vec(),
        100,
        3000,
    );
    store.txn_prewrite(&ctx, req).unwrap();
    let lock_req = PessimisticLockRequest {
        mutations: vec![Mutation::lock(b"k2".to_vec())],
        primary_lock: b"k1".to_vec(),
        start_ts: 100,
        for_update_ts: 100,
        lock_ttl: 3000,
        return_values: false,
    };
    store.txn_pessimistic_lock(&ctx, lock_req).unwrap();

    store
        .txn_pessimistic_rollback(&ctx, vec![b"k1".to_vec(), b"k2".to_vec()], 100, 100)
        .unwrap();

    let engine = store.raw_engine();
    // The optimistic lock survives; only the pessimistic one is gone
    assert!(engine.get(CfName::Lock, &encode_lock(b"k1")).unwrap().is_some());
    assert!(engine.get(CfName::Lock, &encode_lock(b"k2")).unwrap().is_none());
}

#[test]
fn test_resolve_lock_commit_mode_whole_region() {
    let (store, ctx) = open_store();
    let req = PrewriteRequest::new(
        vec![
            Mutation::put(b"k1".to_vec(), b"v1".to_vec()),
            Mutation::put(b"k2".to_vec(), b"v2".to_vec()),
        ],
        b"k1".to_vec(),
        100,
        3000,
    );
    store.txn_prewrite(&ctx, req).unwrap();

    // Empty key list: resolve everything this transaction left here
    store.txn_resolve_lock(&ctx, 100, 110, vec![]).unwrap();
    assert_eq!(get(&store, &ctx, b"k1", 120), Some(b"v1".to_vec()));
    assert_eq!(get(&store, &ctx, b"k2", 120), Some(b"v2".to_vec()));
}
