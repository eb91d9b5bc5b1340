//! In-memory driver used by the integration tests
//!
//! Every connection records what happened to it (commits, rollbacks,
//! auto-commit switches, batch flushes) so tests can assert on the exact
//! driver-level effects.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rivven_dbkit::prelude::*;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("rivven_dbkit=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Driver-level event
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Prepare(String),
    Execute(Vec<Value>),
    Query(Vec<Value>),
    Flush(usize),
    Commit,
    Rollback,
    AutoCommit(bool),
    Isolation(IsolationLevel),
    StatementClosed,
}

/// Recorded state of one mock connection, shared with its statements
pub struct ConnState {
    auto_commit: Mutex<bool>,
    isolation: Mutex<Option<IsolationLevel>>,
    events: Mutex<Vec<Event>>,
    rows: Mutex<Vec<Row>>,
    flushes: AtomicUsize,
    fail_flush_at: Mutex<Option<usize>>,
    fail_commit: AtomicBool,
}

impl ConnState {
    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// Connection that records driver calls
pub struct MockConnection {
    state: Arc<ConnState>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ConnState {
                auto_commit: Mutex::new(true),
                isolation: Mutex::new(None),
                events: Mutex::new(Vec::new()),
                rows: Mutex::new(Vec::new()),
                flushes: AtomicUsize::new(0),
                fail_flush_at: Mutex::new(None),
                fail_commit: AtomicBool::new(false),
            }),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.events.lock().clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.state.events.lock().iter().filter(|e| *e == event).count()
    }

    pub fn flush_sizes(&self) -> Vec<usize> {
        self.state
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Flush(n) => Some(*n),
                _ => None,
            })
            .collect()
    }

    pub fn executed(&self) -> Vec<Vec<Value>> {
        self.state
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Execute(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn prepared(&self) -> Vec<String> {
        self.state
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Prepare(sql) => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_auto_commit(&self) -> bool {
        *self.state.auto_commit.lock()
    }

    pub fn current_isolation(&self) -> Option<IsolationLevel> {
        *self.state.isolation.lock()
    }

    /// Rows returned by every query on this connection
    pub fn set_rows(&self, rows: Vec<Row>) {
        *self.state.rows.lock() = rows;
    }

    /// Fail the n-th flush (1-based)
    pub fn fail_flush_at(&self, n: usize) {
        *self.state.fail_flush_at.lock() = Some(n);
    }

    pub fn fail_commit(&self) {
        self.state.fail_commit.store(true, Ordering::SeqCst);
    }
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        self.state.record(Event::Prepare(sql.to_string()));
        let count = sql.matches('?').count();
        Ok(Box::new(MockStatement {
            conn: Arc::clone(&self.state),
            sql: sql.to_string(),
            params: vec![Value::Null; count],
            batch: Vec::new(),
        }))
    }

    async fn execute(&self, _sql: &str, params: &[Value]) -> Result<u64> {
        self.state.record(Event::Execute(params.to_vec()));
        Ok(1)
    }

    async fn query_stream(&self, _sql: &str, params: &[Value]) -> Result<Pin<Box<dyn RowStream>>> {
        self.state.record(Event::Query(params.to_vec()));
        Ok(Box::pin(VecRowStream::new(self.state.rows.lock().clone())))
    }

    async fn auto_commit(&self) -> Result<bool> {
        Ok(*self.state.auto_commit.lock())
    }

    async fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        *self.state.auto_commit.lock() = auto_commit;
        self.state.record(Event::AutoCommit(auto_commit));
        Ok(())
    }

    async fn isolation_level(&self) -> Result<Option<IsolationLevel>> {
        Ok(*self.state.isolation.lock())
    }

    async fn set_isolation_level(&self, level: IsolationLevel) -> Result<()> {
        *self.state.isolation.lock() = Some(level);
        self.state.record(Event::Isolation(level));
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        if self.state.fail_commit.load(Ordering::SeqCst) {
            return Err(Error::transaction("commit refused"));
        }
        self.state.record(Event::Commit);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.state.record(Event::Rollback);
        Ok(())
    }

    async fn is_valid(&self) -> bool {
        // Gives other tasks a chance to run, like a network round trip.
        tokio::task::yield_now().await;
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MockStatement {
    conn: Arc<ConnState>,
    sql: String,
    params: Vec<Value>,
    batch: Vec<Vec<Value>>,
}

#[async_trait]
impl PreparedStatement for MockStatement {
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
            None => Err(Error::config(format!("index {} out of range 1..={}", index, count))),
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
        let n = self.conn.flushes.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.conn.fail_flush_at.lock() == Some(n) {
            return Err(Error::query("injected flush failure"));
        }
        self.conn.record(Event::Flush(self.batch.len()));
        for entry in &self.batch {
            self.conn.record(Event::Execute(entry.clone()));
        }
        Ok(vec![1; self.batch.len()])
    }

    async fn execute(&mut self) -> Result<u64> {
        self.conn.record(Event::Execute(self.params.clone()));
        Ok(1)
    }

    async fn query(&mut self) -> Result<Pin<Box<dyn RowStream>>> {
        self.conn.record(Event::Query(self.params.clone()));
        let rows = self.conn.rows.lock().clone();
        Ok(Box::pin(VecRowStream::new(rows)))
    }

    async fn close(&mut self) -> Result<()> {
        self.conn.record(Event::StatementClosed);
        Ok(())
    }
}

/// Provider creating a fresh mock connection per acquire
pub struct MockProvider {
    id: ProviderId,
    acquired: AtomicUsize,
    released: AtomicUsize,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    rows: Mutex<Vec<Row>>,
    fail_flush_at: Mutex<Option<usize>>,
    fail_commit: AtomicBool,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ProviderId::next(),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
            rows: Mutex::new(Vec::new()),
            fail_flush_at: Mutex::new(None),
            fail_commit: AtomicBool::new(false),
        })
    }

    /// Rows returned by queries on connections acquired from now on
    pub fn with_rows(self: Arc<Self>, rows: Vec<Row>) -> Arc<Self> {
        *self.rows.lock() = rows;
        self
    }

    /// Connections acquired from now on fail their n-th flush
    pub fn with_failing_flush(self: Arc<Self>, n: usize) -> Arc<Self> {
        *self.fail_flush_at.lock() = Some(n);
        self
    }

    /// Connections acquired from now on refuse to commit
    pub fn with_failing_commit(self: Arc<Self>) -> Arc<Self> {
        self.fail_commit.store(true, Ordering::SeqCst);
        self
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        self.acquired() - self.released()
    }

    /// The n-th connection handed out (0-based)
    pub fn connection(&self, n: usize) -> Arc<MockConnection> {
        Arc::clone(&self.connections.lock()[n])
    }

    pub fn as_provider(self: &Arc<Self>) -> Arc<dyn ConnectionProvider> {
        Arc::clone(self) as Arc<dyn ConnectionProvider>
    }
}

#[async_trait]
impl ConnectionProvider for MockProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn acquire(&self) -> Result<Arc<dyn Connection>> {
        let conn = Arc::new(MockConnection::new());
        conn.set_rows(self.rows.lock().clone());
        if let Some(n) = *self.fail_flush_at.lock() {
            conn.fail_flush_at(n);
        }
        if self.fail_commit.load(Ordering::SeqCst) {
            conn.fail_commit();
        }
        self.connections.lock().push(Arc::clone(&conn));
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(conn as Arc<dyn Connection>)
    }

    async fn release(&self, _conn: Arc<dyn Connection>) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// External transaction manager with a single switchable transaction
pub struct MockExternal {
    pub active: AtomicBool,
    pub rollback_only: AtomicBool,
    pub conn: Arc<MockConnection>,
}

impl MockExternal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicBool::new(true),
            rollback_only: AtomicBool::new(false),
            conn: Arc::new(MockConnection::new()),
        })
    }
}

#[async_trait]
impl ExternalTransactionManager for MockExternal {
    fn is_transaction_active(&self, _ctx: &ExecutionContext, _provider: ProviderId) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn current_connection(
        &self,
        _ctx: &ExecutionContext,
        _provider: ProviderId,
    ) -> Result<Arc<dyn Connection>> {
        Ok(Arc::clone(&self.conn) as Arc<dyn Connection>)
    }

    fn set_rollback_only(&self, _ctx: &ExecutionContext, _provider: ProviderId) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }
}

/// `n` rows with columns `id` and `name`
pub fn people(n: usize) -> Vec<Row> {
    (0..n)
        .map(|i| {
            Row::new(
                vec!["id".into(), "name".into()],
                vec![Value::Int64(i as i64), Value::String(format!("person-{}", i))],
            )
        })
        .collect()
}
