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

//! Per-region latch manager
//!
//! Serializes concurrent write requests touching the same user keys
//! before they reach the replicated log. Each key hashes to a slot with a
//! FIFO wait queue; a request is admitted once it sits at the front of
//! every slot it needs. A request joins all of its queues in one step at
//! arrival, so queue order equals arrival order on every slot — a cycle
//! of waiters would require each to have arrived before the next, which
//! is impossible. Blocked requests execute nothing and hold no work while
//! queued.
//!
//! Reads never touch latches; cross-timestamp conflicts are MVCC's job.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHasher};
use smallvec::SmallVec;

/// Most requests touch a handful of keys; keep their slot list inline
type SlotList = SmallVec<[u64; 8]>;

/// Latch slot state: FIFO queue of request ids, front = admitted
#[derive(Default)]
struct Inner {
    queues: FxHashMap<u64, VecDeque<u64>>,
}

/// Per-region latch table
pub struct Latches {
    inner: Mutex<Inner>,
    wakeup: Condvar,
}

impl Latches {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            wakeup: Condvar::new(),
        }
    }

    fn hash_key(key: &[u8]) -> u64 {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Sorted, deduplicated slot set for a request's keys
    fn slots_for(keys: &[Vec<u8>]) -> SlotList {
        let mut slots: SlotList = keys.iter().map(|k| Self::hash_key(k)).collect();
        slots.sort_unstable();
        slots.dedup();
        slots
    }

    /// Block until `who` owns the latch on every key.
    ///
    /// Callers must pass the same `keys` to [`Latches::release`] when done,
    /// and must not call acquire twice for the same `who` without an
    /// intervening release.
    pub fn acquire(&self, keys: &[Vec<u8>], who: u64) {
        let slots = Self::slots_for(keys);
        if slots.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for &slot in &slots {
            inner.queues.entry(slot).or_default().push_back(who);
        }
        loop {
            let admitted = slots
                .iter()
                .all(|slot| inner.queues.get(slot).and_then(|q| q.front()) == Some(&who));
            if admitted {
                return;
            }
            self.wakeup.wait(&mut inner);
        }
    }

    /// Try to take all latches without blocking. Returns false and leaves
    /// no trace when any key is contended.
    pub fn try_acquire(&self, keys: &[Vec<u8>], who: u64) -> bool {
        let slots = Self::slots_for(keys);
        let mut inner = self.inner.lock();
        let free = slots.iter().all(|slot| {
            inner
                .queues
                .get(slot)
                .map(|q| q.is_empty())
                .unwrap_or(true)
        });
        if !free {
            return false;
        }
        for &slot in &slots {
            inner.queues.entry(slot).or_default().push_back(who);
        }
        true
    }

    /// Release all latches owned by `who` and wake the next waiters
    pub fn release(&self, keys: &[Vec<u8>], who: u64) {
        let slots = Self::slots_for(keys);
        if slots.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let mut woke_any = false;
        for &slot in &slots {
            if let Some(queue) = inner.queues.get_mut(&slot) {
                if let Some(pos) = queue.iter().position(|&w| w == who) {
                    queue.remove(pos);
                }
                if queue.is_empty() {
                    inner.queues.remove(&slot);
                } else {
                    woke_any = true;
                }
            }
        }
        if woke_any {
            self.wakeup.notify_all();
        }
    }

    /// Number of slots with live queues (diagnostics)
    pub fn active_slots(&self) -> usize {
        self.inner.lock().queues.len()
    }
}

impl Default for Latches {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_uncontended_acquire_release() {
        let latches = Latches::new();
        let keys = vec![b"a".to_vec(), b"b".to_vec()];
        latches.acquire(&keys, 1);
        assert_eq!(latches.active_slots(), 2);
        latches.release(&keys, 1);
        assert_eq!(latches.active_slots(), 0);
    }

    #[test]
    fn test_try_acquire_contended() {
        let latches = Latches::new();
        let keys = vec![b"a".to_vec()];
        assert!(latches.try_acquire(&keys, 1));
        assert!(!latches.try_acquire(&keys, 2));
        latches.release(&keys, 1);
        assert!(latches.try_acquire(&keys, 2));
        latches.release(&keys, 2);
    }

    #[test]
    fn test_duplicate_keys_single_slot() {
        let latches = Latches::new();
        let keys = vec![b"a".to_vec(), b"a".to_vec()];
        latches.acquire(&keys, 1);
        assert_eq!(latches.active_slots(), 1);
        latches.release(&keys, 1);
        assert_eq!(latches.active_slots(), 0);
    }

    #[test]
    fn test_fifo_admission_per_key() {
        let latches = Arc::new(Latches::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let keys = vec![b"k".to_vec()];

        latches.acquire(&keys, 0);

        let mut handles = Vec::new();
        for who in 1..=4u64 {
            let latches = Arc::clone(&latches);
            let order = Arc::clone(&order);
            let keys = keys.clone();
            handles.push(thread::spawn(move || {
                latches.acquire(&keys, who);
                order.lock().push(who);
                latches.release(&keys, who);
            }));
            // Stagger arrivals so queue order is deterministic
            thread::sleep(Duration::from_millis(30));
        }

        latches.release(&keys, 0);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_overlapping_sets_never_deadlock() {
        let latches = Arc::new(Latches::new());
        let admitted = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for who in 0..8u64 {
            let latches = Arc::clone(&latches);
            let admitted = Arc::clone(&admitted);
            handles.push(thread::spawn(move || {
                // Every pair of requests overlaps on at least one key
                let keys: Vec<Vec<u8>> = vec![
                    format!("k{}", who % 3).into_bytes(),
                    format!("k{}", (who + 1) % 3).into_bytes(),
                ];
                for _ in 0..50 {
                    latches.acquire(&keys, who);
                    admitted.fetch_add(1, Ordering::Relaxed);
                    latches.release(&keys, who);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(admitted.load(Ordering::Relaxed), 8 * 50);
        assert_eq!(latches.active_slots(), 0);
    }
}
