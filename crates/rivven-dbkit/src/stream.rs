//! Streaming row pipeline
//!
//! A single reader advances the cursor. With `workers == 0` it invokes the
//! row callback itself; otherwise it decodes each row into an owned value and
//! pushes it onto a bounded channel drained by `workers` tasks:
//!
//! ```text
//! cursor -> reader -(offset, filter, count)-> decode -> mpsc(queue_size) -> worker x K -> on_row
//!                                                                              |
//!                                                  all joined -> on_complete (once)
//! ```
//!
//! The first failure (reader or worker) stops the reader; workers drain the
//! queue without invoking the callback and are always joined before `run`
//! returns. Processing order across workers is not preserved.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::connection::RowStream;
use crate::error::{Error, Result};
use crate::types::Row;

/// Decodes a cursor row into an owned value
pub trait RowDecoder<T>: Send + Sync {
    /// Decode one row
    fn decode(&self, row: Row) -> Result<T>;
}

impl<T, F> RowDecoder<T> for F
where
    F: Fn(Row) -> Result<T> + Send + Sync,
{
    fn decode(&self, row: Row) -> Result<T> {
        self(row)
    }
}

/// Selects which rows are delivered
pub trait RowPredicate: Send + Sync {
    /// Whether the row is delivered
    fn accept(&self, row: &Row) -> bool;
}

impl<F> RowPredicate for F
where
    F: Fn(&Row) -> bool + Send + Sync,
{
    fn accept(&self, row: &Row) -> bool {
        self(row)
    }
}

/// Window and fan-out settings for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Raw rows to discard before the first delivered row
    pub offset: u64,
    /// Maximum rows delivered; `None` for all
    pub count: Option<u64>,
    /// Worker tasks; 0 runs the callback on the reader
    pub workers: usize,
    /// Capacity of the reader-to-worker queue
    pub queue_size: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            count: None,
            workers: 0,
            queue_size: 1024,
        }
    }
}

impl StreamOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set offset
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Set count ceiling
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Set worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set queue capacity
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        if self.workers > 0 && self.queue_size == 0 {
            return Err(Error::config("queue_size must be > 0 when workers are used"));
        }
        Ok(())
    }
}

/// Counters for one pipeline run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// Rows read from the cursor
    pub rows_read: u64,
    /// Rows discarded by the offset
    pub rows_skipped: u64,
    /// Rows rejected by the predicate
    pub rows_filtered: u64,
    /// Rows handed to the row callback (or queued for it)
    pub rows_delivered: u64,
    /// Row callbacks that completed successfully
    pub rows_processed: u64,
    /// Wall time of the run
    pub duration: Duration,
}

/// Keeps the first failure of a run
#[derive(Default)]
struct FirstFailure {
    failed: AtomicBool,
    error: Mutex<Option<Error>>,
}

impl FirstFailure {
    fn record(&self, error: Error) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            debug!(error = %error, "stream pipeline failed");
            *slot = Some(error);
            self.failed.store(true, Ordering::Release);
        } else {
            trace!(error = %error, "ignoring subsequent stream pipeline failure");
        }
    }

    #[inline]
    fn is_set(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn take(&self) -> Option<Error> {
        self.error.lock().take()
    }
}

/// Reader-side window state: offset over raw rows, count over delivered rows
pub(crate) struct Window {
    offset: u64,
    count: Option<u64>,
    pub(crate) summary: StreamSummary,
}

impl Window {
    pub(crate) fn new(offset: u64, count: Option<u64>) -> Self {
        Self {
            offset,
            count,
            summary: StreamSummary::default(),
        }
    }

    fn exhausted(&self) -> bool {
        self.count
            .is_some_and(|count| self.summary.rows_delivered >= count)
    }

    /// Next row to deliver, with its delivery sequence number
    pub(crate) async fn next(
        &mut self,
        rows: &mut dyn RowStream,
        predicate: Option<&dyn RowPredicate>,
    ) -> Result<Option<(u64, Row)>> {
        loop {
            if self.exhausted() {
                return Ok(None);
            }
            let Some(row) = rows.next().await? else {
                return Ok(None);
            };
            self.summary.rows_read += 1;
            if self.summary.rows_read <= self.offset {
                self.summary.rows_skipped += 1;
                continue;
            }
            if predicate.is_some_and(|p| !p.accept(&row)) {
                self.summary.rows_filtered += 1;
                continue;
            }
            let seq = self.summary.rows_delivered;
            self.summary.rows_delivered += 1;
            return Ok(Some((seq, row)));
        }
    }
}

/// Streams cursor rows through a decoder to a row callback
pub struct RowPipeline<T> {
    options: StreamOptions,
    decoder: Arc<dyn RowDecoder<T>>,
    predicate: Option<Arc<dyn RowPredicate>>,
}

impl<T: Send + 'static> RowPipeline<T> {
    /// Pipeline with default options
    pub fn new(decoder: impl RowDecoder<T> + 'static) -> Self {
        Self {
            options: StreamOptions::default(),
            decoder: Arc::new(decoder),
            predicate: None,
        }
    }

    /// Set options
    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Only deliver rows accepted by `predicate`
    pub fn with_predicate(mut self, predicate: impl RowPredicate + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Current options
    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Run without a completion callback
    pub async fn run<F, Fut>(&self, rows: &mut dyn RowStream, on_row: F) -> Result<StreamSummary>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.run_with_completion(rows, on_row, || async { Ok(()) })
            .await
    }

    /// Run, then invoke `on_complete` once after every row has been
    /// processed and every worker has finished. Not invoked on failure.
    pub async fn run_with_completion<F, Fut, C, CFut>(
        &self,
        rows: &mut dyn RowStream,
        on_row: F,
        on_complete: C,
    ) -> Result<StreamSummary>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
        C: FnOnce() -> CFut,
        CFut: Future<Output = Result<()>>,
    {
        self.options.validate()?;
        let started = Instant::now();
        debug!(
            offset = self.options.offset,
            count = ?self.options.count,
            workers = self.options.workers,
            "stream pipeline started"
        );

        let mut summary = if self.options.workers == 0 {
            self.run_sequential(rows, on_row).await?
        } else {
            self.run_parallel(rows, on_row).await?
        };
        summary.duration = started.elapsed();

        on_complete().await.map_err(Error::completion)?;
        debug!(
            rows_read = summary.rows_read,
            rows_delivered = summary.rows_delivered,
            elapsed_ms = summary.duration.as_millis() as u64,
            "stream pipeline finished"
        );
        Ok(summary)
    }

    async fn run_sequential<F, Fut>(&self, rows: &mut dyn RowStream, on_row: F) -> Result<StreamSummary>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut window = Window::new(self.options.offset, self.options.count);
        while let Some((seq, row)) = window.next(rows, self.predicate.as_deref()).await? {
            let value = self.decoder.decode(row)?;
            on_row(value).await.map_err(|e| Error::worker(seq, e))?;
            window.summary.rows_processed += 1;
        }
        Ok(window.summary)
    }

    async fn run_parallel<F, Fut>(&self, rows: &mut dyn RowStream, on_row: F) -> Result<StreamSummary>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<(u64, T)>(self.options.queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let failure = Arc::new(FirstFailure::default());
        let processed = Arc::new(AtomicU64::new(0));
        let on_row = Arc::new(on_row);

        let mut workers = JoinSet::new();
        for worker in 0..self.options.workers {
            let rx = Arc::clone(&rx);
            let failure = Arc::clone(&failure);
            let processed = Arc::clone(&processed);
            let on_row = Arc::clone(&on_row);
            workers.spawn(async move {
                loop {
                    let item = { rx.lock().await.recv().await };
                    let Some((seq, value)) = item else {
                        break;
                    };
                    // Drain without processing once the run has failed.
                    if failure.is_set() {
                        continue;
                    }
                    let outcome = AssertUnwindSafe(async { on_row(value).await })
                        .catch_unwind()
                        .await;
                    match outcome {
                        Ok(Ok(())) => {
                            processed.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Err(e)) => failure.record(Error::worker(seq, e)),
                        Err(panic) => {
                            let message = panic_message(panic.as_ref());
                            warn!(worker, row = seq, %message, "row callback panicked");
                            failure.record(Error::Worker {
                                row: seq,
                                message: format!("row callback panicked: {}", message),
                                source: None,
                            });
                        }
                    }
                }
                trace!(worker, "stream worker finished");
            });
        }
        // Workers hold the only receivers; if they all exit, sends fail.
        drop(rx);

        let mut window = Window::new(self.options.offset, self.options.count);
        loop {
            if failure.is_set() {
                break;
            }
            let next = match window.next(rows, self.predicate.as_deref()).await {
                Ok(Some((seq, row))) => self.decoder.decode(row).map(|value| (seq, value)),
                Ok(None) => break,
                Err(e) => Err(e),
            };
            match next {
                Ok(item) => {
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    failure.record(e);
                    break;
                }
            }
        }
        drop(tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "stream worker task failed");
                failure.record(Error::Worker {
                    row: window.summary.rows_delivered,
                    message: format!("worker task failed: {}", e),
                    source: Some(Box::new(e)),
                });
            }
        }

        if let Some(error) = failure.take() {
            return Err(error);
        }
        let mut summary = window.summary;
        summary.rows_processed = processed.load(Ordering::Relaxed);
        Ok(summary)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<T> std::fmt::Debug for RowPipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowPipeline")
            .field("options", &self.options)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Row stream over rows already in memory
#[derive(Debug, Default)]
pub struct VecRowStream {
    rows: std::vec::IntoIter<Row>,
}

impl VecRowStream {
    /// Create a stream over the rows
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }

    /// Rows not yet read
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }
}

impl RowStream for VecRowStream {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>> {
        let row = self.rows.next();
        Box::pin(async move { Ok(row) })
    }
}
