//! Bulk transfer: stream rows from a cursor into a batched statement
//!
//! Synchronous mode reads a row, binds it and adds it to the batch in one
//! loop. Parallel mode decouples the two through a bounded channel so
//! reading overlaps with flushing; a failure on either side stops the other.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

use crate::batch::{self, BatchConfig, BatchJob, BatchResult};
use crate::binder::Params;
use crate::connection::RowStream;
use crate::error::{Error, Result};
use crate::statement::NamedQuery;
use crate::stream::Window;
use crate::types::Row;

/// Settings for a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    /// Source rows to skip
    pub offset: u64,
    /// Maximum rows transferred
    pub count: Option<u64>,
    /// Write-side batching
    pub batch: BatchConfig,
    /// Overlap reading and writing
    pub in_parallel: bool,
    /// Channel capacity in parallel mode
    pub queue_size: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            count: None,
            batch: BatchConfig::default(),
            in_parallel: false,
            queue_size: 1024,
        }
    }
}

impl TransferOptions {
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

    /// Set write-side batching
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Enable or disable parallel mode
    pub fn with_in_parallel(mut self, in_parallel: bool) -> Self {
        self.in_parallel = in_parallel;
        self
    }

    /// Set channel capacity
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        self.batch.validate()?;
        if self.in_parallel && self.queue_size == 0 {
            return Err(Error::config("queue_size must be > 0 in parallel mode"));
        }
        Ok(())
    }
}

/// Outcome of a transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferResult {
    /// Rows read from the source, including skipped ones
    pub rows_read: u64,
    /// Rows written to the destination
    pub rows_transferred: u64,
    /// Destination flushes
    pub flushes: u64,
    /// Affected-row total reported by the destination
    pub rows_affected: u64,
    /// Wall time
    pub duration: Duration,
}

/// Parameters for one destination row: by column name when the destination
/// SQL uses named placeholders, positionally otherwise.
pub fn row_params(row: Row, named: bool) -> Params {
    if named {
        Params::Named(row.into_map())
    } else {
        Params::Positional(row.into_values())
    }
}

/// Copy rows from `source` into `dest` with the default row binding
pub async fn transfer(
    source: &mut dyn RowStream,
    dest: &mut NamedQuery,
    options: TransferOptions,
) -> Result<TransferResult> {
    let named = dest.parsed().is_named();
    transfer_with(source, dest, options, move |row| Ok(row_params(row, named))).await
}

/// Copy rows from `source` into `dest`, binding each row with `setter`
pub async fn transfer_with<F>(
    source: &mut dyn RowStream,
    dest: &mut NamedQuery,
    options: TransferOptions,
    setter: F,
) -> Result<TransferResult>
where
    F: Fn(Row) -> Result<Params>,
{
    options.validate()?;
    let started = Instant::now();
    let window = Window::new(options.offset, options.count);

    let (rows_read, batch) = if options.in_parallel {
        transfer_parallel(source, dest, &options, window, setter).await?
    } else {
        transfer_sequential(source, dest, &options, window, setter).await?
    };

    let result = TransferResult {
        rows_read,
        rows_transferred: batch.rows_submitted,
        flushes: batch.flushes,
        rows_affected: batch.rows_affected,
        duration: started.elapsed(),
    };
    debug!(
        rows = result.rows_transferred,
        flushes = result.flushes,
        in_parallel = options.in_parallel,
        elapsed_ms = result.duration.as_millis() as u64,
        "transfer finished"
    );
    Ok(result)
}

async fn transfer_sequential<F>(
    source: &mut dyn RowStream,
    dest: &mut NamedQuery,
    options: &TransferOptions,
    mut window: Window,
    setter: F,
) -> Result<(u64, BatchResult)>
where
    F: Fn(Row) -> Result<Params>,
{
    let mut job = BatchJob::start(dest, options.batch.clone(), None).await?;
    let fed = async {
        while let Some((_, row)) = window.next(source, None).await? {
            job.add(&setter(row)?).await?;
        }
        Ok::<(), Error>(())
    }
    .await;
    let batch = batch::complete(job, fed).await?;
    Ok((window.summary.rows_read, batch))
}

async fn transfer_parallel<F>(
    source: &mut dyn RowStream,
    dest: &mut NamedQuery,
    options: &TransferOptions,
    mut window: Window,
    setter: F,
) -> Result<(u64, BatchResult)>
where
    F: Fn(Row) -> Result<Params>,
{
    let (tx, mut rx) = mpsc::channel::<Result<Params>>(options.queue_size);

    let reader = async move {
        loop {
            let item = match window.next(source, None).await {
                Ok(Some((_, row))) => setter(row),
                Ok(None) => break,
                Err(e) => Err(e),
            };
            let failed = item.is_err();
            // A send error means the writer gave up.
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
        window.summary.rows_read
    };

    let batch_config = options.batch.clone();
    let writer = async move {
        let mut job = BatchJob::start(dest, batch_config, None).await?;
        let mut fed = Ok(());
        while let Some(item) = rx.recv().await {
            if let Err(e) = async { job.add(&item?).await }.await {
                fed = Err(e);
                break;
            }
        }
        drop(rx);
        batch::complete(job, fed).await
    };

    let (rows_read, written) = tokio::join!(reader, writer);
    Ok((rows_read, written?))
}
