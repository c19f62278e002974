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

//! Bounded worker sets
//!
//! Request handlers enqueue closures instead of blocking RPC threads.
//! Each worker owns a bounded FIFO queue; dispatch is either round-robin
//! or least-loaded. A full queue rejects the task immediately — the
//! caller translates that into `RequestFull` and the client backs off.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// A unit of queued work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct WorkerQueue {
    tasks: Mutex<VecDeque<Task>>,
    wakeup: Condvar,
    capacity: usize,
}

impl WorkerQueue {
    fn push(&self, task: Task) -> bool {
        let mut tasks = self.tasks.lock();
        if tasks.len() >= self.capacity {
            return false;
        }
        tasks.push_back(task);
        self.wakeup.notify_one();
        true
    }

    fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}

/// A fixed set of worker threads with per-worker bounded queues
pub struct WorkerSet {
    name: String,
    queues: Vec<Arc<WorkerQueue>>,
    rr_cursor: AtomicUsize,
    pending: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerSet {
    pub fn new(name: impl Into<String>, worker_count: usize, queue_capacity: usize) -> Arc<Self> {
        let name = name.into();
        let worker_count = worker_count.max(1);
        let stop = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(AtomicUsize::new(0));

        let queues: Vec<Arc<WorkerQueue>> = (0..worker_count)
            .map(|_| {
                Arc::new(WorkerQueue {
                    tasks: Mutex::new(VecDeque::new()),
                    wakeup: Condvar::new(),
                    capacity: queue_capacity.max(1),
                })
            })
            .collect();

        let mut handles = Vec::with_capacity(worker_count);
        for (i, queue) in queues.iter().enumerate() {
            let queue = Arc::clone(queue);
            let stop = Arc::clone(&stop);
            let pending = Arc::clone(&pending);
            let thread_name = format!("{}-{}", name, i);
            let handle = std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || loop {
                    let task = {
                        let mut tasks = queue.tasks.lock();
                        loop {
                            if let Some(task) = tasks.pop_front() {
                                break task;
                            }
                            if stop.load(Ordering::Acquire) {
                                return;
                            }
                            queue.wakeup.wait(&mut tasks);
                        }
                    };
                    task();
                    pending.fetch_sub(1, Ordering::AcqRel);
                })
                .expect("spawn worker thread");
            handles.push(handle);
        }

        Arc::new(Self {
            name,
            queues,
            rr_cursor: AtomicUsize::new(0),
            pending,
            stop,
            handles: Mutex::new(handles),
        })
    }

    /// Round-robin dispatch. Returns false when the chosen queue is full
    /// or the set is shut down; the task is dropped untouched.
    pub fn execute_rr(&self, task: Task) -> bool {
        if self.stop.load(Ordering::Acquire) {
            return false;
        }
        let slot = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        self.track(self.queues[slot].push(task))
    }

    /// Least-loaded dispatch, for expensive work like index search
    pub fn execute_least_queue(&self, task: Task) -> bool {
        if self.stop.load(Ordering::Acquire) {
            return false;
        }
        let slot = self
            .queues
            .iter()
            .enumerate()
            .min_by_key(|(_, q)| q.len())
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.track(self.queues[slot].push(task))
    }

    fn track(&self, pushed: bool) -> bool {
        if pushed {
            self.pending.fetch_add(1, Ordering::AcqRel);
        } else {
            debug!(worker_set = %self.name, "queue full, task rejected");
        }
        pushed
    }

    /// Tasks enqueued or running, across all workers
    pub fn pending_task_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Stop accepting work and join all workers. Queued tasks are drained
    /// before threads exit.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        for queue in &self.queues {
            queue.wakeup.notify_all();
        }
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerSet {
    fn drop(&mut self) {
        self.shutdown();
    }
}
