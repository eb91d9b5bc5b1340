//! `SqlExecutor`: the caller-facing surface
//!
//! Every statement goes through the same path:
//!
//! ```text
//! compile (cached) -> connection_for(ctx) -> prepare -> bind -> run -> close
//! ```
//!
//! `close` runs on every exit path. A close failure after an error in the
//! statement is logged and the statement's error returned.

use futures::Stream;
use std::future::Future;
use std::sync::Arc;
use tracing::trace;

use crate::batch::{self, BatchConfig, BatchResult};
use crate::binder::Params;
use crate::config::ExecutorConfig;
use crate::context::ExecutionContext;
use crate::dataset::DataSet;
use crate::error::{settle, Result};
use crate::parsed_sql::{ParsedSql, ParsedSqlCache};
use crate::provider::{ConnectionProvider, ProviderId};
use crate::statement::NamedQuery;
use crate::stream::{RowDecoder, RowPipeline, StreamSummary, VecRowStream};
use crate::transaction::{Transaction, TransactionCoordinator, TransactionOptions};
use crate::transfer::{self, TransferOptions, TransferResult};

/// Executes named SQL against one connection provider
#[derive(Clone)]
pub struct SqlExecutor {
    provider: Arc<dyn ConnectionProvider>,
    coordinator: TransactionCoordinator,
    cache: Arc<ParsedSqlCache>,
    config: ExecutorConfig,
}

impl SqlExecutor {
    /// Executor with default configuration and its own coordinator
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        let config = ExecutorConfig::default();
        Self {
            provider,
            coordinator: TransactionCoordinator::new(),
            cache: Arc::new(ParsedSqlCache::new(config.sql_cache_size)),
            config,
        }
    }

    /// Executor with the given configuration
    pub fn with_config(provider: Arc<dyn ConnectionProvider>, config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            provider,
            coordinator: TransactionCoordinator::new(),
            cache: Arc::new(ParsedSqlCache::new(config.sql_cache_size)),
            config,
        })
    }

    /// Use a shared coordinator (e.g. one that consults an external
    /// transaction manager)
    pub fn with_coordinator(mut self, coordinator: TransactionCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// The connection provider
    pub fn provider(&self) -> &Arc<dyn ConnectionProvider> {
        &self.provider
    }

    /// Provider identity
    pub fn provider_id(&self) -> ProviderId {
        self.provider.id()
    }

    /// The transaction coordinator
    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    /// Configuration in effect
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Begin or join a transaction on this executor's provider
    pub async fn begin(&self, ctx: &ExecutionContext, options: TransactionOptions) -> Result<Transaction> {
        self.coordinator.begin(ctx, &self.provider, options).await
    }

    /// Whether `ctx` has a transaction on this executor's provider
    pub fn is_in_transaction(&self, ctx: &ExecutionContext) -> bool {
        self.coordinator.is_in_transaction(ctx, self.provider.id())
    }

    /// Compile SQL through the cache
    pub fn parse(&self, sql: &str) -> Result<Arc<ParsedSql>> {
        self.cache.get_or_parse(sql)
    }

    /// Prepare a statement on the connection `ctx` should use for it
    pub async fn prepare(&self, ctx: &ExecutionContext, sql: &str) -> Result<NamedQuery> {
        let parsed = self.parse(sql)?;
        let lease = self
            .coordinator
            .connection_for(ctx, &self.provider, parsed.operation())
            .await?;
        trace!(
            context = %ctx.id(),
            operation = %parsed.operation(),
            in_transaction = lease.in_transaction(),
            "statement prepared"
        );
        NamedQuery::prepare(parsed, lease).await
    }

    /// Execute a data-modifying statement, returns affected rows
    pub async fn execute(&self, ctx: &ExecutionContext, sql: &str, params: &Params) -> Result<u64> {
        let mut query = self.prepare(ctx, sql).await?;
        let result = async {
            query.bind(params)?;
            query.execute().await
        }
        .await;
        settle(result, query.close().await, "statement")
    }

    /// Run a query and collect the full result
    pub async fn query(&self, ctx: &ExecutionContext, sql: &str, params: &Params) -> Result<DataSet> {
        self.query_window(ctx, sql, params, 0, None).await
    }

    /// Run a query and collect `count` rows after skipping `offset`
    pub async fn query_window(
        &self,
        ctx: &ExecutionContext,
        sql: &str,
        params: &Params,
        offset: u64,
        count: Option<u64>,
    ) -> Result<DataSet> {
        let mut query = self.prepare(ctx, sql).await?;
        let result = async {
            query.bind(params)?;
            query.query_data_set(offset, count).await
        }
        .await;
        settle(result, query.close().await, "statement")
    }

    /// A pipeline preconfigured with this executor's stream settings
    pub fn pipeline<T: Send + 'static>(&self, decoder: impl RowDecoder<T> + 'static) -> RowPipeline<T> {
        RowPipeline::new(decoder).with_options(self.config.stream_options())
    }

    /// Stream a query's rows through `pipeline`
    pub async fn stream<T, F, Fut>(
        &self,
        ctx: &ExecutionContext,
        sql: &str,
        params: &Params,
        pipeline: &RowPipeline<T>,
        on_row: F,
    ) -> Result<StreamSummary>
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.stream_with_completion(ctx, sql, params, pipeline, on_row, || async { Ok(()) })
            .await
    }

    /// Stream a query's rows through `pipeline`, then run `on_complete` once
    pub async fn stream_with_completion<T, F, Fut, C, CFut>(
        &self,
        ctx: &ExecutionContext,
        sql: &str,
        params: &Params,
        pipeline: &RowPipeline<T>,
        on_row: F,
        on_complete: C,
    ) -> Result<StreamSummary>
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
        C: FnOnce() -> CFut,
        CFut: Future<Output = Result<()>>,
    {
        let mut query = self.prepare(ctx, sql).await?;
        let result = async {
            query.bind(params)?;
            let mut rows = query.query().await?;
            pipeline
                .run_with_completion(&mut *rows, on_row, on_complete)
                .await
        }
        .await;
        settle(result, query.close().await, "statement")
    }

    /// Execute a statement once per entry, in batches of the configured size
    pub async fn batch<I>(&self, ctx: &ExecutionContext, sql: &str, entries: I) -> Result<BatchResult>
    where
        I: IntoIterator<Item = Params>,
        I::IntoIter: ExactSizeIterator,
    {
        self.batch_with(ctx, sql, entries, self.config.batch_config())
            .await
    }

    /// Execute a statement once per entry with explicit batch settings
    pub async fn batch_with<I>(
        &self,
        ctx: &ExecutionContext,
        sql: &str,
        entries: I,
        config: BatchConfig,
    ) -> Result<BatchResult>
    where
        I: IntoIterator<Item = Params>,
        I::IntoIter: ExactSizeIterator,
    {
        config.validate()?;
        let mut query = self.prepare(ctx, sql).await?;
        let result = batch::execute_batch(&mut query, entries, config).await;
        settle(result, query.close().await, "statement")
    }

    /// Execute a statement once per entry produced by `entries`
    pub async fn batch_stream<S>(&self, ctx: &ExecutionContext, sql: &str, entries: S) -> Result<BatchResult>
    where
        S: Stream<Item = Result<Params>>,
    {
        let mut query = self.prepare(ctx, sql).await?;
        let result = batch::execute_batch_stream(&mut query, entries, self.config.batch_config()).await;
        settle(result, query.close().await, "statement")
    }

    /// Insert the rows of `data` with `sql`. Rows bind by column name when
    /// `sql` uses named placeholders.
    pub async fn import(
        &self,
        ctx: &ExecutionContext,
        sql: &str,
        data: &DataSet,
        options: TransferOptions,
    ) -> Result<TransferResult> {
        options.validate()?;
        let mut source = VecRowStream::new(data.rows().collect());
        let mut query = self.prepare(ctx, sql).await?;
        let result = transfer::transfer(&mut source, &mut query, options).await;
        settle(result, query.close().await, "statement")
    }

    /// Read rows with `select_sql` on this executor and write them with
    /// `insert_sql` on `dest`
    #[allow(clippy::too_many_arguments)]
    pub async fn copy_to(
        &self,
        ctx: &ExecutionContext,
        select_sql: &str,
        params: &Params,
        dest: &SqlExecutor,
        dest_ctx: &ExecutionContext,
        insert_sql: &str,
        options: TransferOptions,
    ) -> Result<TransferResult> {
        options.validate()?;
        let mut source = self.prepare(ctx, select_sql).await?;
        let mut target = match dest.prepare(dest_ctx, insert_sql).await {
            Ok(target) => target,
            Err(e) => return settle(Err(e), source.close().await, "statement"),
        };

        let result = async {
            source.bind(params)?;
            let mut rows = source.query().await?;
            transfer::transfer(&mut *rows, &mut target, options).await
        }
        .await;

        let result = settle(result, target.close().await, "statement");
        settle(result, source.close().await, "statement")
    }

    /// Run `action` with a fresh context that shares no transaction with `ctx`
    pub async fn run_outside_transaction<F, Fut>(&self, ctx: &ExecutionContext, action: F) -> Result<()>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.coordinator.run_outside_transaction(ctx, action).await
    }

    /// Like `run_outside_transaction`, returning the action's value
    pub async fn call_outside_transaction<T, F, Fut>(&self, ctx: &ExecutionContext, action: F) -> Result<T>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.coordinator.call_outside_transaction(ctx, action).await
    }
}

impl std::fmt::Debug for SqlExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlExecutor")
            .field("provider", &self.provider.id())
            .field("coordinator", &self.coordinator)
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}
