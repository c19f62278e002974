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

//! Engine configuration
//!

use std::time::Duration;

/// Configuration for the region store
#[derive(Debug, Clone)]
pub struct Config {
    /// Reject batches with more entries than this
    /// Default: 4096
    pub max_batch_count: usize,

    /// Reject requests whose payload exceeds this many bytes
    /// Default: 32 MiB
    pub max_request_size: usize,

    /// Prewrite mutation cap
    /// Default: 1024
    pub max_prewrite_count: usize,

    /// Scans requesting more rows than this are forced to stream
    /// Default: 1024
    pub stream_message_max_limit_size: usize,

    /// Applied-log lag before an index asks to be saved
    /// Default: 10000
    pub flat_need_save_count: i64,

    /// Background queue depth past which write RPCs are rejected
    /// Default: 32
    pub max_background_task_count: usize,

    /// Route search RPCs through the read pool instead of inline
    /// Default: true
    pub enable_async_search: bool,

    /// Route count RPCs through the read pool instead of inline
    /// Default: true
    pub enable_async_count: bool,

    /// Route index mutations through the write pool instead of inline
    /// Default: true
    pub enable_async_operation: bool,

    /// Read pool worker threads
    /// Default: 4
    pub read_worker_count: usize,

    /// Write pool worker threads
    /// Default: 4
    pub write_worker_count: usize,

    /// Background pool worker threads (index build, GC, backup)
    /// Default: 2
    pub background_worker_count: usize,

    /// Per-worker bounded queue depth
    /// Default: 1024
    pub worker_queue_capacity: usize,

    /// Idle stream cursor lifetime
    /// Default: 60s
    pub stream_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_batch_count: 4096,
            max_request_size: 32 * 1024 * 1024, // 32 MiB
            max_prewrite_count: 1024,
            stream_message_max_limit_size: 1024,
            flat_need_save_count: 10000,
            max_background_task_count: 32,
            enable_async_search: true,
            enable_async_count: true,
            enable_async_operation: true,
            read_worker_count: 4,
            write_worker_count: 4,
            background_worker_count: 2,
            worker_queue_capacity: 1024,
            stream_ttl: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Creates a new Config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// A configuration for tests: inline execution, tiny queues
    pub fn inline_for_test() -> Self {
        Self {
            enable_async_search: false,
            enable_async_count: false,
            enable_async_operation: false,
            read_worker_count: 1,
            write_worker_count: 1,
            background_worker_count: 1,
            ..Default::default()
        }
    }

    /// Builder method to set the batch cap
    pub fn with_max_batch_count(mut self, count: usize) -> Self {
        self.max_batch_count = count;
        self
    }

    /// Builder method to set the request size cap
    pub fn with_max_request_size(mut self, bytes: usize) -> Self {
        self.max_request_size = bytes;
        self
    }

    /// Builder method to set the prewrite mutation cap
    pub fn with_max_prewrite_count(mut self, count: usize) -> Self {
        self.max_prewrite_count = count;
        self
    }

    /// Builder method to set the forced-streaming threshold
    pub fn with_stream_message_max_limit_size(mut self, rows: usize) -> Self {
        self.stream_message_max_limit_size = rows;
        self
    }

    /// Builder method to set the index save lag threshold
    pub fn with_flat_need_save_count(mut self, count: i64) -> Self {
        self.flat_need_save_count = count;
        self
    }

    /// Builder method to set the background backpressure watermark
    pub fn with_max_background_task_count(mut self, count: usize) -> Self {
        self.max_background_task_count = count;
        self
    }

    /// Builder method to set async routing in one call
    pub fn with_async(mut self, enabled: bool) -> Self {
        self.enable_async_search = enabled;
        self.enable_async_count = enabled;
        self.enable_async_operation = enabled;
        self
    }

    /// Builder method to set worker pool sizes
    pub fn with_worker_counts(mut self, read: usize, write: usize, background: usize) -> Self {
        self.read_worker_count = read;
        self.write_worker_count = write;
        self.background_worker_count = background;
        self
    }

    /// Builder method to set the stream TTL
    pub fn with_stream_ttl(mut self, ttl: Duration) -> Self {
        self.stream_ttl = ttl;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_batch_count, 4096);
        assert_eq!(config.max_request_size, 32 * 1024 * 1024);
        assert_eq!(config.max_prewrite_count, 1024);
        assert_eq!(config.stream_message_max_limit_size, 1024);
        assert_eq!(config.flat_need_save_count, 10000);
        assert_eq!(config.max_background_task_count, 32);
        assert!(config.enable_async_search);
        assert!(config.enable_async_count);
        assert!(config.enable_async_operation);
        assert_eq!(config.stream_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_builders() {
        let config = Config::new()
            .with_max_batch_count(100)
            .with_max_prewrite_count(10)
            .with_async(false)
            .with_worker_counts(1, 2, 3)
            .with_stream_ttl(Duration::from_secs(5));
        assert_eq!(config.max_batch_count, 100);
        assert_eq!(config.max_prewrite_count, 10);
        assert!(!config.enable_async_search);
        assert!(!config.enable_async_operation);
        assert_eq!(config.read_worker_count, 1);
        assert_eq!(config.write_worker_count, 2);
        assert_eq!(config.background_worker_count, 3);
        assert_eq!(config.stream_ttl, Duration::from_secs(5));
    }

    #[test]
    fn test_inline_for_test() {
        let config = Config::inline_for_test();
        assert!(!config.enable_async_search);
        assert!(!config.enable_async_operation);
        assert_eq!(config.max_batch_count, 4096);
    }
}
