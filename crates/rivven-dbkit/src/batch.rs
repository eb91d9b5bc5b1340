//! Batch execution
//!
//! Entries are bound onto the statement and queued with `add_batch`; every
//! `batch_size` entries the queue is executed and cleared. The remainder is
//! always flushed by `finish`.
//!
//! When the statement runs on its own connection with auto-commit on and the
//! input spans more than one flush, auto-commit is suspended so the whole
//! batch commits or rolls back as one unit. The original mode is restored
//! before control returns.

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::binder::Params;
use crate::error::{Error, Result};
use crate::statement::NamedQuery;

/// Batch execution settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Entries per flush
    pub batch_size: usize,
    /// Pause after each full flush
    pub flush_delay: Option<Duration>,
    /// Suspend auto-commit for batches spanning several flushes
    pub suspend_auto_commit: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            flush_delay: None,
            suspend_auto_commit: true,
        }
    }
}

impl BatchConfig {
    /// Default settings with the given batch size
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Default::default()
        }
    }

    /// Set batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Pause for `delay` after each full flush
    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = Some(delay);
        self
    }

    /// Enable or disable auto-commit suspension
    pub fn with_suspend_auto_commit(mut self, suspend: bool) -> Self {
        self.suspend_auto_commit = suspend;
        self
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be > 0"));
        }
        Ok(())
    }
}

/// Outcome of a batch execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Entries queued across all flushes
    pub rows_submitted: u64,
    /// Flushes performed
    pub flushes: u64,
    /// Sum of affected-row counts reported by the driver
    pub rows_affected: u64,
    /// Wall time
    pub duration: Duration,
}

/// Snapshot of `AtomicBatchStats`
#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    /// Rows flushed successfully
    pub rows_flushed: u64,
    /// Successful flushes
    pub flushes: u64,
    /// Failed flushes
    pub flushes_failed: u64,
    /// Time spent in flushes (milliseconds)
    pub total_flush_time_ms: u64,
    /// Rows per second over flush time
    pub rows_per_second: f64,
}

/// Thread-safe batch statistics, shareable across jobs
#[derive(Debug, Default)]
pub struct AtomicBatchStats {
    rows_flushed: AtomicU64,
    flushes: AtomicU64,
    flushes_failed: AtomicU64,
    total_flush_time_ms: AtomicU64,
}

impl AtomicBatchStats {
    /// Record a successful flush
    pub fn record_flush(&self, rows: u64, duration: Duration) {
        self.rows_flushed.fetch_add(rows, Ordering::Relaxed);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.total_flush_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record a failed flush
    pub fn record_failure(&self) {
        self.flushes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot
    pub fn snapshot(&self) -> BatchStats {
        let rows = self.rows_flushed.load(Ordering::Relaxed);
        let time_ms = self.total_flush_time_ms.load(Ordering::Relaxed);
        let rps = if time_ms > 0 {
            (rows as f64 * 1000.0) / time_ms as f64
        } else {
            0.0
        };

        BatchStats {
            rows_flushed: rows,
            flushes: self.flushes.load(Ordering::Relaxed),
            flushes_failed: self.flushes_failed.load(Ordering::Relaxed),
            total_flush_time_ms: time_ms,
            rows_per_second: rps,
        }
    }
}

/// In-progress batch over one statement
pub struct BatchJob<'q> {
    query: &'q mut NamedQuery,
    config: BatchConfig,
    pending: usize,
    submitted: u64,
    flushes: u64,
    rows_affected: u64,
    restore_auto_commit: bool,
    started: Instant,
    stats: Option<Arc<AtomicBatchStats>>,
    done: bool,
}

impl<'q> BatchJob<'q> {
    /// Start a batch. `expected_rows` is the input size when known.
    pub async fn start(
        query: &'q mut NamedQuery,
        config: BatchConfig,
        expected_rows: Option<usize>,
    ) -> Result<BatchJob<'q>> {
        config.validate()?;

        let mut restore_auto_commit = false;
        let spans_flushes = expected_rows.map_or(true, |n| n > config.batch_size);
        if config.suspend_auto_commit && spans_flushes && !query.in_transaction() {
            let conn = query.connection()?;
            if conn.auto_commit().await? {
                conn.set_auto_commit(false).await?;
                restore_auto_commit = true;
                debug!(
                    sql = %query.parsed().sql(),
                    batch_size = config.batch_size,
                    expected_rows = ?expected_rows,
                    "auto-commit suspended for batch"
                );
            }
        }

        Ok(Self {
            query,
            config,
            pending: 0,
            submitted: 0,
            flushes: 0,
            rows_affected: 0,
            restore_auto_commit,
            started: Instant::now(),
            stats: None,
            done: false,
        })
    }

    /// Report flushes to shared statistics
    pub fn with_stats(mut self, stats: Arc<AtomicBatchStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Whether auto-commit is suspended by this job
    pub fn is_auto_commit_suspended(&self) -> bool {
        self.restore_auto_commit
    }

    /// Entries queued since the last flush
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Bind and queue one entry, flushing when the batch is full
    pub async fn add(&mut self, params: &Params) -> Result<()> {
        self.query.bind(params)?;
        self.query.statement_mut()?.add_batch()?;
        self.pending += 1;
        self.submitted += 1;

        if self.pending >= self.config.batch_size {
            self.flush().await?;
            if let Some(delay) = self.config.flush_delay {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    /// Execute and clear the queued entries
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending == 0 {
            return Ok(());
        }
        let started = Instant::now();
        let stmt = self.query.statement_mut()?;
        let counts = match stmt.execute_batch().await {
            Ok(counts) => counts,
            Err(e) => {
                if let Some(stats) = &self.stats {
                    stats.record_failure();
                }
                return Err(e);
            }
        };
        stmt.clear_batch();

        let rows = self.pending as u64;
        self.rows_affected += counts.iter().sum::<u64>();
        self.flushes += 1;
        self.pending = 0;
        if let Some(stats) = &self.stats {
            stats.record_flush(rows, started.elapsed());
        }
        trace!(rows, flush = self.flushes, "batch flushed");
        Ok(())
    }

    /// Flush the remainder and commit a suspended auto-commit span
    pub async fn finish(mut self) -> Result<BatchResult> {
        if let Err(e) = self.flush().await {
            return Err(self.abort(e).await);
        }
        if self.restore_auto_commit {
            let committed = match self.query.connection() {
                Ok(conn) => conn.commit().await,
                Err(e) => Err(e),
            };
            if let Err(e) = committed {
                return Err(self.abort(e).await);
            }
            self.restore().await?;
        }
        self.done = true;

        let result = BatchResult {
            rows_submitted: self.submitted,
            flushes: self.flushes,
            rows_affected: self.rows_affected,
            duration: self.started.elapsed(),
        };
        debug!(
            rows = result.rows_submitted,
            flushes = result.flushes,
            elapsed_ms = result.duration.as_millis() as u64,
            "batch finished"
        );
        Ok(result)
    }

    /// Give up after `error`: discard queued entries, roll back a suspended
    /// auto-commit span and restore the mode. Returns `error`.
    pub async fn abort(mut self, error: Error) -> Error {
        self.done = true;
        if let Ok(stmt) = self.query.statement_mut() {
            stmt.clear_batch();
        }
        if self.restore_auto_commit {
            if let Ok(conn) = self.query.connection() {
                if let Err(e) = conn.rollback().await {
                    warn!(error = %e, "rollback of failed batch failed");
                }
            }
            if let Err(e) = self.restore().await {
                warn!(error = %e, "failed to restore auto-commit after failed batch");
            }
        }
        warn!(error = %error, submitted = self.submitted, flushes = self.flushes, "batch aborted");
        error
    }

    async fn restore(&mut self) -> Result<()> {
        self.restore_auto_commit = false;
        self.query.connection()?.set_auto_commit(true).await
    }
}

impl Drop for BatchJob<'_> {
    fn drop(&mut self) {
        if !self.done && (self.pending > 0 || self.restore_auto_commit) {
            warn!(
                pending = self.pending,
                auto_commit_suspended = self.restore_auto_commit,
                "batch dropped without finish"
            );
        }
    }
}

/// Execute every entry in batches
pub async fn execute_batch<I>(query: &mut NamedQuery, entries: I, config: BatchConfig) -> Result<BatchResult>
where
    I: IntoIterator<Item = Params>,
    I::IntoIter: ExactSizeIterator,
{
    let entries = entries.into_iter();
    let mut job = BatchJob::start(query, config, Some(entries.len())).await?;
    let fed = feed(&mut job, entries).await;
    complete(job, fed).await
}

/// Execute the entries accepted by `filter` in batches
pub async fn execute_batch_filtered<I, P>(
    query: &mut NamedQuery,
    entries: I,
    config: BatchConfig,
    filter: P,
) -> Result<BatchResult>
where
    I: IntoIterator<Item = Params>,
    P: Fn(&Params) -> bool,
{
    let mut job = BatchJob::start(query, config, None).await?;
    let fed = feed(&mut job, entries.into_iter().filter(|p| filter(p))).await;
    complete(job, fed).await
}

/// Execute entries produced by a stream in batches
pub async fn execute_batch_stream<S>(query: &mut NamedQuery, entries: S, config: BatchConfig) -> Result<BatchResult>
where
    S: Stream<Item = Result<Params>>,
{
    let mut job = BatchJob::start(query, config, None).await?;
    futures::pin_mut!(entries);
    let mut fed = Ok(());
    while let Some(params) = entries.next().await {
        if let Err(e) = async { job.add(&params?).await }.await {
            fed = Err(e);
            break;
        }
    }
    complete(job, fed).await
}

async fn feed<I>(job: &mut BatchJob<'_>, entries: I) -> Result<()>
where
    I: Iterator<Item = Params>,
{
    for params in entries {
        job.add(&params).await?;
    }
    Ok(())
}

pub(crate) async fn complete(job: BatchJob<'_>, fed: Result<()>) -> Result<BatchResult> {
    match fed {
        Ok(()) => job.finish().await,
        Err(e) => Err(job.abort(e).await),
    }
}
