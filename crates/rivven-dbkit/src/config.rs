//! Executor configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::batch::BatchConfig;
use crate::error::{Error, Result};
use crate::stream::StreamOptions;

/// Settings for a `SqlExecutor`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Compiled SQL statements kept in the cache (0 disables caching)
    pub sql_cache_size: usize,
    /// Default entries per batch flush
    pub batch_size: usize,
    /// Default pause after each full flush, in milliseconds
    pub flush_delay_ms: Option<u64>,
    /// Suspend auto-commit for batches spanning several flushes
    pub suspend_auto_commit: bool,
    /// Default stream worker count (0 = process on the reader)
    pub stream_workers: usize,
    /// Default stream queue capacity
    pub stream_queue_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            sql_cache_size: 1000,
            batch_size: 200,
            flush_delay_ms: None,
            suspend_auto_commit: true,
            stream_workers: 0,
            stream_queue_size: 1024,
        }
    }
}

impl ExecutorConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set SQL cache size
    pub fn with_sql_cache_size(mut self, size: usize) -> Self {
        self.sql_cache_size = size;
        self
    }

    /// Set default batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set default flush delay
    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay_ms = Some(delay.as_millis() as u64);
        self
    }

    /// Enable or disable auto-commit suspension
    pub fn with_suspend_auto_commit(mut self, suspend: bool) -> Self {
        self.suspend_auto_commit = suspend;
        self
    }

    /// Set default stream workers
    pub fn with_stream_workers(mut self, workers: usize) -> Self {
        self.stream_workers = workers;
        self
    }

    /// Set default stream queue capacity
    pub fn with_stream_queue_size(mut self, size: usize) -> Self {
        self.stream_queue_size = size;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be > 0"));
        }
        if self.stream_workers > 0 && self.stream_queue_size == 0 {
            return Err(Error::config(
                "stream_queue_size must be > 0 when stream_workers > 0",
            ));
        }
        Ok(())
    }

    /// Batch settings derived from this configuration
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            flush_delay: self.flush_delay_ms.map(Duration::from_millis),
            suspend_auto_commit: self.suspend_auto_commit,
        }
    }

    /// Stream settings derived from this configuration
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions::new()
            .with_workers(self.stream_workers)
            .with_queue_size(self.stream_queue_size)
    }
}
