//! Prepared named queries
//!
//! A `NamedQuery` owns everything one statement execution needs: the compiled
//! SQL, the driver statement and the connection lease. `close` releases them
//! in that order on every path; dropping an unclosed query logs a warning and
//! releases in the background.

use std::pin::Pin;
use std::sync::Arc;
use tracing::warn;

use crate::binder::{self, Params};
use crate::connection::{Connection, PreparedStatement, RowStream};
use crate::dataset::DataSet;
use crate::error::{settle, Error, Result};
use crate::parsed_sql::ParsedSql;
use crate::transaction::ConnectionLease;
use crate::types::Value;

/// Compiled SQL bound to a prepared statement on a leased connection
pub struct NamedQuery {
    parsed: Arc<ParsedSql>,
    stmt: Option<Box<dyn PreparedStatement>>,
    lease: Option<ConnectionLease>,
}

impl NamedQuery {
    /// Assemble a query from its parts
    pub fn new(
        parsed: Arc<ParsedSql>,
        stmt: Box<dyn PreparedStatement>,
        lease: ConnectionLease,
    ) -> Self {
        Self {
            parsed,
            stmt: Some(stmt),
            lease: Some(lease),
        }
    }

    /// Prepare `parsed` on the leased connection.
    ///
    /// The lease is released if preparation fails.
    pub async fn prepare(parsed: Arc<ParsedSql>, lease: ConnectionLease) -> Result<Self> {
        let conn = Arc::clone(lease.connection());
        let sql = parsed.positional_sql(conn.placeholder_style()).into_owned();
        match conn.prepare(&sql).await {
            Ok(stmt) => Ok(Self::new(parsed, stmt, lease)),
            Err(e) => {
                let released = lease.release().await;
                settle(Err(e), released, "connection")
            }
        }
    }

    /// The compiled SQL
    #[inline]
    pub fn parsed(&self) -> &ParsedSql {
        &self.parsed
    }

    /// The leased connection
    pub fn connection(&self) -> Result<&Arc<dyn Connection>> {
        self.lease
            .as_ref()
            .map(ConnectionLease::connection)
            .ok_or_else(|| Error::internal("query already closed"))
    }

    /// Whether commit and rollback belong to a surrounding transaction
    pub fn in_transaction(&self) -> bool {
        self.lease
            .as_ref()
            .is_some_and(ConnectionLease::in_transaction)
    }

    pub(crate) fn statement_mut(&mut self) -> Result<&mut dyn PreparedStatement> {
        match self.stmt.as_deref_mut() {
            Some(stmt) => Ok(stmt),
            None => Err(Error::internal("query already closed")),
        }
    }

    /// Bind a value to every occurrence of `name`
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<&mut Self> {
        let parsed = Arc::clone(&self.parsed);
        binder::bind_name(self.statement_mut()?, &parsed, name, value.into())?;
        Ok(self)
    }

    /// Bind a boolean; `None` binds `false`
    pub fn set_bool(&mut self, name: &str, value: Option<bool>) -> Result<&mut Self> {
        self.set(name, value.unwrap_or_default())
    }

    /// Bind an `i32`; `None` binds `0`
    pub fn set_i32(&mut self, name: &str, value: Option<i32>) -> Result<&mut Self> {
        self.set(name, value.unwrap_or_default())
    }

    /// Bind an `i64`; `None` binds `0`
    pub fn set_i64(&mut self, name: &str, value: Option<i64>) -> Result<&mut Self> {
        self.set(name, value.unwrap_or_default())
    }

    /// Bind an `f64`; `None` binds `0.0`
    pub fn set_f64(&mut self, name: &str, value: Option<f64>) -> Result<&mut Self> {
        self.set(name, value.unwrap_or_default())
    }

    /// Bind a string; `None` binds NULL
    pub fn set_string(&mut self, name: &str, value: Option<&str>) -> Result<&mut Self> {
        self.set(name, value)
    }

    /// Bind a value at a 1-based position
    pub fn set_index(&mut self, index: usize, value: impl Into<Value>) -> Result<&mut Self> {
        let count = self.parsed.parameter_count();
        if index == 0 || index > count {
            return Err(Error::config(format!(
                "parameter index {} out of range 1..={}",
                index, count
            )));
        }
        self.statement_mut()?.set_value(index, value.into())?;
        Ok(self)
    }

    /// Bind a full parameter set
    pub fn bind(&mut self, params: &Params) -> Result<&mut Self> {
        let parsed = Arc::clone(&self.parsed);
        binder::bind_params(self.statement_mut()?, &parsed, params)?;
        Ok(self)
    }

    /// Clear bound values
    pub fn clear_parameters(&mut self) -> Result<()> {
        self.statement_mut()?.clear_parameters();
        Ok(())
    }

    /// Execute with the bound values, returns affected row count
    pub async fn execute(&mut self) -> Result<u64> {
        self.statement_mut()?.execute().await
    }

    /// Query with the bound values
    pub async fn query(&mut self) -> Result<Pin<Box<dyn RowStream>>> {
        self.statement_mut()?.query().await
    }

    /// Query and collect a window of the result into a `DataSet`
    pub async fn query_data_set(&mut self, offset: u64, count: Option<u64>) -> Result<DataSet> {
        let mut rows = self.query().await?;
        DataSet::collect(&mut *rows, offset, count).await
    }

    /// Close the statement, then release the connection.
    ///
    /// The first failure is returned; a later one is only logged.
    pub async fn close(mut self) -> Result<()> {
        let closed = match self.stmt.take() {
            Some(mut stmt) => stmt.close().await,
            None => Ok(()),
        };
        let released = match self.lease.take() {
            Some(lease) => lease.release().await,
            None => Ok(()),
        };
        settle(closed, released, "connection")
    }
}

impl Drop for NamedQuery {
    fn drop(&mut self) {
        if self.stmt.is_none() && self.lease.is_none() {
            return;
        }
        warn!(sql = %self.parsed.sql(), "query dropped without close, releasing in background");

        let stmt = self.stmt.take();
        let lease = self.lease.take();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Some(mut stmt) = stmt {
                    if let Err(e) = stmt.close().await {
                        warn!(error = %e, "failed to close abandoned statement");
                    }
                }
                if let Some(lease) = lease {
                    if let Err(e) = lease.release().await {
                        warn!(error = %e, "failed to release connection of abandoned statement");
                    }
                }
            });
        }
    }
}

impl std::fmt::Debug for NamedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedQuery")
            .field("sql", &self.parsed.sql())
            .field("lease", &self.lease)
            .field("closed", &self.stmt.is_none())
            .finish()
    }
}
