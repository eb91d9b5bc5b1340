//! PostgreSQL driver adapter for rivven-dbkit
//!
//! Adapts `tokio-postgres` to the driver seam:
//! - Auto-commit is emulated: with auto-commit off, the first statement
//!   issues `BEGIN` (with the configured isolation level); `commit` and
//!   `rollback` end that transaction
//! - Placeholders are `$1, $2, ...`
//! - Batches execute entry by entry on the prepared statement

use async_trait::async_trait;
use futures::TryStreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, IsolationLevel, PreparedStatement, RowStream,
};
use crate::error::{Error, Result};
use crate::parsed_sql::PlaceholderStyle;
use crate::types::{Row, Value};

type PgParam = Box<dyn tokio_postgres::types::ToSql + Sync + Send>;

/// Convert a Value to a tokio-postgres compatible parameter
fn value_to_sql(value: &Value) -> PgParam {
    match value {
        Value::Null => Box::new(Option::<i32>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Int8(n) => Box::new(i16::from(*n)),
        Value::Int16(n) => Box::new(*n),
        Value::Int32(n) => Box::new(*n),
        Value::Int64(n) => Box::new(*n),
        Value::Float32(n) => Box::new(*n),
        Value::Float64(n) => Box::new(*n),
        Value::Decimal(d) => Box::new(*d),
        Value::String(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Date(d) => Box::new(*d),
        Value::Time(t) => Box::new(*t),
        Value::DateTime(dt) => Box::new(*dt),
        Value::DateTimeTz(dt) => Box::new(*dt),
        Value::Uuid(u) => Box::new(*u),
        Value::Json(j) => Box::new(j.clone()),
        Value::Array(items) => {
            let json = serde_json::to_value(items).unwrap_or_default();
            Box::new(json)
        }
    }
}

fn param_refs(params: &[PgParam]) -> Vec<&(dyn tokio_postgres::types::ToSql + Sync)> {
    params
        .iter()
        .map(|b| b.as_ref() as &(dyn tokio_postgres::types::ToSql + Sync))
        .collect()
}

/// Map a driver error, keeping deadlocks and constraint violations distinct
fn map_pg_error(e: tokio_postgres::Error, sql: &str) -> Error {
    use tokio_postgres::error::SqlState;

    if let Some(db) = e.as_db_error() {
        let code = db.code();
        if *code == SqlState::T_R_DEADLOCK_DETECTED {
            return Error::Deadlock;
        }
        if *code == SqlState::UNIQUE_VIOLATION
            || *code == SqlState::FOREIGN_KEY_VIOLATION
            || *code == SqlState::CHECK_VIOLATION
            || *code == SqlState::NOT_NULL_VIOLATION
        {
            return Error::Constraint {
                constraint_name: db.constraint().unwrap_or_default().to_string(),
                message: db.message().to_string(),
            };
        }
    }
    Error::Query {
        message: e.to_string(),
        sql: Some(sql.to_string()),
        source: Some(Box::new(e)),
    }
}

fn tx_error(e: tokio_postgres::Error) -> Error {
    Error::Transaction {
        message: e.to_string(),
        source: Some(Box::new(e)),
    }
}

/// Convert a tokio-postgres row to a Row
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Row {
    let columns: Vec<String> = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values: Vec<Value> = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect();

    Row::new(columns, values)
}

fn pg_value_to_value(
    row: &tokio_postgres::Row,
    idx: usize,
    pg_type: &tokio_postgres::types::Type,
) -> Value {
    use tokio_postgres::types::Type;

    fn get<'a, T>(row: &'a tokio_postgres::Row, idx: usize, f: impl FnOnce(T) -> Value) -> Value
    where
        T: tokio_postgres::types::FromSql<'a>,
    {
        row.try_get::<_, Option<T>>(idx)
            .ok()
            .flatten()
            .map(f)
            .unwrap_or(Value::Null)
    }

    match *pg_type {
        Type::BOOL => get(row, idx, Value::Bool),
        Type::INT2 => get(row, idx, Value::Int16),
        Type::INT4 => get(row, idx, Value::Int32),
        Type::INT8 => get(row, idx, Value::Int64),
        Type::FLOAT4 => get(row, idx, Value::Float32),
        Type::FLOAT8 => get(row, idx, Value::Float64),
        Type::NUMERIC => get(row, idx, Value::Decimal),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => get(row, idx, Value::String),
        Type::BYTEA => get(row, idx, Value::Bytes),
        Type::DATE => get(row, idx, Value::Date),
        Type::TIME => get(row, idx, Value::Time),
        Type::TIMESTAMP => get(row, idx, Value::DateTime),
        Type::TIMESTAMPTZ => get(row, idx, Value::DateTimeTz),
        Type::UUID => get(row, idx, Value::Uuid),
        Type::JSON | Type::JSONB => get(row, idx, Value::Json),
        _ => get(row, idx, Value::String),
    }
}

#[derive(Debug)]
struct SessionState {
    auto_commit: bool,
    in_transaction: bool,
    isolation: Option<IsolationLevel>,
}

/// Client plus emulated auto-commit state, shared with prepared statements
struct PgSession {
    client: tokio_postgres::Client,
    state: Mutex<SessionState>,
    closed: AtomicBool,
}

impl PgSession {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }

    /// Open the implicit transaction when auto-commit is off
    async fn ensure_begun(&self) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.lock().await;
        if state.auto_commit || state.in_transaction {
            return Ok(());
        }
        let begin = match state.isolation {
            Some(level) => format!("BEGIN ISOLATION LEVEL {}", level.to_sql()),
            None => "BEGIN".to_string(),
        };
        self.client.batch_execute(&begin).await.map_err(tx_error)?;
        state.in_transaction = true;
        Ok(())
    }

    async fn end(&self, statement: &str) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.lock().await;
        if !state.in_transaction {
            return Ok(());
        }
        state.in_transaction = false;
        self.client.batch_execute(statement).await.map_err(tx_error)
    }
}

/// Rows pulled from the server as the reader advances
struct PgRowStream {
    rows: Pin<Box<tokio_postgres::RowStream>>,
    sql: String,
}

impl PgRowStream {
    fn new(rows: tokio_postgres::RowStream, sql: &str) -> Self {
        Self {
            rows: Box::pin(rows),
            sql: sql.to_string(),
        }
    }
}

impl RowStream for PgRowStream {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>> {
        Box::pin(async move {
            let row = self
                .rows
                .as_mut()
                .try_next()
                .await
                .map_err(|e| map_pg_error(e, &self.sql))?;
            Ok(row.as_ref().map(pg_row_to_row))
        })
    }
}

/// PostgreSQL connection
pub struct PgConnection {
    session: Arc<PgSession>,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            session: Arc::new(PgSession {
                client,
                state: Mutex::new(SessionState {
                    auto_commit: true,
                    in_transaction: false,
                    isolation: None,
                }),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.session.client
    }

}

#[async_trait]
impl Connection for PgConnection {
    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        self.session.check_open()?;
        let statement = self
            .session
            .client
            .prepare(sql)
            .await
            .map_err(|e| map_pg_error(e, sql))?;
        let param_count = statement.params().len();

        Ok(Box::new(PgPreparedStatement {
            session: Arc::clone(&self.session),
            statement,
            sql: sql.to_string(),
            params: vec![Value::Null; param_count],
            batch: Vec::new(),
        }))
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.session.ensure_begun().await?;
        let boxed: Vec<PgParam> = params.iter().map(value_to_sql).collect();
        self.session
            .client
            .execute(sql, &param_refs(&boxed))
            .await
            .map_err(|e| map_pg_error(e, sql))
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<Pin<Box<dyn RowStream>>> {
        self.session.ensure_begun().await?;
        let boxed: Vec<PgParam> = params.iter().map(value_to_sql).collect();
        let rows = self
            .session
            .client
            .query_raw(sql, param_refs(&boxed))
            .await
            .map_err(|e| map_pg_error(e, sql))?;
        Ok(Box::pin(PgRowStream::new(rows, sql)))
    }

    async fn auto_commit(&self) -> Result<bool> {
        Ok(self.session.state.lock().await.auto_commit)
    }

    async fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        self.session.check_open()?;
        let mut state = self.session.state.lock().await;
        if auto_commit && state.in_transaction {
            // Switching auto-commit on commits the open transaction.
            state.in_transaction = false;
            self.session
                .client
                .batch_execute("COMMIT")
                .await
                .map_err(tx_error)?;
        }
        state.auto_commit = auto_commit;
        Ok(())
    }

    async fn isolation_level(&self) -> Result<Option<IsolationLevel>> {
        Ok(self.session.state.lock().await.isolation)
    }

    async fn set_isolation_level(&self, level: IsolationLevel) -> Result<()> {
        if level == IsolationLevel::Snapshot {
            return Err(Error::unsupported("SNAPSHOT isolation is not available on PostgreSQL"));
        }
        let mut state = self.session.state.lock().await;
        if state.in_transaction {
            warn!(isolation = %level, "isolation level change applies to the next transaction");
        }
        state.isolation = Some(level);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.session.end("COMMIT").await
    }

    async fn rollback(&self) -> Result<()> {
        self.session.end("ROLLBACK").await
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Dollar
    }

    async fn is_valid(&self) -> bool {
        if self.session.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.session.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        if self.session.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let state = self.session.state.lock().await;
        if state.in_transaction {
            debug!("closing connection with an open transaction, rolling back");
            if let Err(e) = self.session.client.batch_execute("ROLLBACK").await {
                warn!(error = %e, "rollback on close failed");
            }
        }
        Ok(())
    }
}

/// PostgreSQL prepared statement
pub struct PgPreparedStatement {
    session: Arc<PgSession>,
    statement: tokio_postgres::Statement,
    sql: String,
    params: Vec<Value>,
    batch: Vec<Vec<Value>>,
}

impl PgPreparedStatement {
    async fn run(&self, params: &[Value]) -> Result<u64> {
        let boxed: Vec<PgParam> = params.iter().map(value_to_sql).collect();
        self.session
            .client
            .execute(&self.statement, &param_refs(&boxed))
            .await
            .map_err(|e| map_pg_error(e, &self.sql))
    }
}

#[async_trait]
impl PreparedStatement for PgPreparedStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn set_value(&mut self, index: usize, value: Value) -> Result<()> {
        let count = self.params.len();
        match index.checked_sub(1).and_then(|i| self.params.get_mut(i)) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::config(format!(
                "parameter index {} out of range 1..={}",
                index, count
            ))),
        }
    }

    fn clear_parameters(&mut self) {
        self.params.iter_mut().for_each(|v| *v = Value::Null);
    }

    fn add_batch(&mut self) -> Result<()> {
        self.batch.push(self.params.clone());
        Ok(())
    }

    fn clear_batch(&mut self) {
        self.batch.clear();
    }

    async fn execute_batch(&mut self) -> Result<Vec<u64>> {
        self.session.ensure_begun().await?;
        let mut counts = Vec::with_capacity(self.batch.len());
        for entry in &self.batch {
            counts.push(self.run(entry).await?);
        }
        Ok(counts)
    }

    async fn execute(&mut self) -> Result<u64> {
        self.session.ensure_begun().await?;
        self.run(&self.params).await
    }

    async fn query(&mut self) -> Result<Pin<Box<dyn RowStream>>> {
        self.session.ensure_begun().await?;
        let boxed: Vec<PgParam> = self.params.iter().map(value_to_sql).collect();
        let rows = self
            .session
            .client
            .query_raw(&self.statement, param_refs(&boxed))
            .await
            .map_err(|e| map_pg_error(e, &self.sql))?;
        Ok(Box::pin(PgRowStream::new(rows, &self.sql)))
    }

    async fn close(&mut self) -> Result<()> {
        self.batch.clear();
        Ok(())
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::connection_with_source("invalid connection url", e))?;
        pg_config.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }

        let (client, connection) = pg_config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect", e))?;
        debug!(application_name = ?config.application_name, "postgres connection established");

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection error");
            }
        });

        Ok(Box::new(PgConnection::new(client)))
    }
}

/// Connect to PostgreSQL database
pub async fn connect(url: &str) -> Result<Box<dyn Connection>> {
    PgConnectionFactory
        .connect(&ConnectionConfig::new(url))
        .await
}
