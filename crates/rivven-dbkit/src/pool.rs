//! Connection pool for rivven-dbkit
//!
//! `SimpleConnectionPool` is a `ConnectionProvider`:
//! - Semaphore-bounded: at most `max_size` connections are lent out
//! - `min_size` connections are opened eagerly
//! - Expired and invalid idle connections are recycled on acquire
//! - Connections come back through `release`, never through `Drop`
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_dbkit::prelude::*;
//! use rivven_dbkit::pool::SimpleConnectionPool;
//!
//! let pool = SimpleConnectionPool::builder("postgres://localhost/db")
//!     .max_size(10)
//!     .build(Arc::new(PgConnectionFactory))
//!     .await?;
//!
//! let conn = pool.acquire().await?;
//! conn.execute("SELECT 1", &[]).await?;
//! pool.release(conn).await?;
//! ```

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
use crate::error::{Error, Result};
use crate::provider::{ConnectionProvider, ProviderId};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Minimum pool size (idle connections)
    pub min_size: usize,
    /// Maximum pool size
    pub max_size: usize,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Maximum connection lifetime (for recycling)
    pub max_lifetime: Duration,
    /// Idle timeout (connections idle longer are closed)
    pub idle_timeout: Duration,
    /// Whether to test connections on borrow
    pub test_on_borrow: bool,
    /// Whether to test connections on return
    pub test_on_return: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(1800),
            idle_timeout: Duration::from_secs(600),
            test_on_borrow: true,
            test_on_return: false,
        }
    }
}

impl PoolConfig {
    /// Create pool config from a connection URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(url),
            ..Default::default()
        }
    }

    /// Set minimum pool size
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set maximum connection lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enable/disable test on borrow
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }

    /// Enable/disable test on return
    pub fn with_test_on_return(mut self, test: bool) -> Self {
        self.test_on_return = test;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::config("pool max_size must be > 0"));
        }
        if self.min_size > self.max_size {
            return Err(Error::config(format!(
                "pool min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of connection acquisitions
    pub acquisitions: u64,
    /// Total number of releases
    pub releases: u64,
    /// Number of times pool was exhausted
    pub exhausted_count: u64,
    /// Total wait time for connections (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Number of health check failures
    pub health_check_failures: u64,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
pub struct AtomicPoolStats {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    acquisitions: AtomicU64,
    releases: AtomicU64,
    exhausted_count: AtomicU64,
    total_wait_time_ms: AtomicU64,
    health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition
    pub fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record a release
    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Record pool exhaustion
    pub fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record health check failure
    pub fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }

    /// Calculate average wait time in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        let acquisitions = self.acquisitions.load(Ordering::Relaxed);
        if acquisitions == 0 {
            0.0
        } else {
            self.total_wait_time_ms.load(Ordering::Relaxed) as f64 / acquisitions as f64
        }
    }
}

/// Pool builder for fluent configuration
pub struct PoolBuilder {
    config: PoolConfig,
}

impl PoolBuilder {
    /// Create a new pool builder
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            config: PoolConfig::new(url),
        }
    }

    /// Set minimum pool size
    pub fn min_size(mut self, size: usize) -> Self {
        self.config.min_size = size;
        self
    }

    /// Set maximum pool size
    pub fn max_size(mut self, size: usize) -> Self {
        self.config.max_size = size;
        self
    }

    /// Set acquire timeout
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    /// Set max lifetime
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.max_lifetime = lifetime;
        self
    }

    /// Set idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Enable test on borrow
    pub fn test_on_borrow(mut self, test: bool) -> Self {
        self.config.test_on_borrow = test;
        self
    }

    /// Get the configuration
    pub fn config(self) -> PoolConfig {
        self.config
    }

    /// Build the pool
    pub async fn build(self, factory: Arc<dyn ConnectionFactory>) -> Result<Arc<SimpleConnectionPool>> {
        SimpleConnectionPool::new(self.config, factory).await
    }
}

/// Idle connection with metadata
struct PoolEntry {
    conn: Arc<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

/// Address of the connection object, used to track creation time while lent out
fn conn_key(conn: &Arc<dyn Connection>) -> usize {
    Arc::as_ptr(conn) as *const () as usize
}

/// Semaphore-bounded connection pool.
///
/// Idle connections are reused LIFO. A permit is held for every lent-out
/// connection and given back on `release`.
pub struct SimpleConnectionPool {
    id: ProviderId,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<Vec<PoolEntry>>,
    /// Creation time of lent-out connections
    lent: SyncMutex<HashMap<usize, Instant>>,
    semaphore: Semaphore,
    total_connections: AtomicUsize,
    stats: AtomicPoolStats,
    shutdown: AtomicBool,
}

impl SimpleConnectionPool {
    /// Create a new connection pool.
    ///
    /// Initializes with `min_size` connections eagerly.
    pub async fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Arc<Self>> {
        config.validate()?;
        let pool = Arc::new(Self {
            id: ProviderId::next(),
            semaphore: Semaphore::new(config.max_size),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            lent: SyncMutex::new(HashMap::new()),
            config,
            factory,
            total_connections: AtomicUsize::new(0),
            stats: AtomicPoolStats::new(),
            shutdown: AtomicBool::new(false),
        });

        for _ in 0..pool.config.min_size {
            match pool.create_connection().await {
                Ok(conn) => {
                    let now = Instant::now();
                    pool.idle.lock().await.push(PoolEntry {
                        conn,
                        created_at: now,
                        last_used: now,
                    });
                }
                Err(e) => warn!(error = %e, "failed to pre-populate pool connection"),
            }
        }

        debug!(pool = %pool.id, min_size = pool.config.min_size, max_size = pool.config.max_size, "connection pool created");
        Ok(pool)
    }

    /// Create a new connection pool with a builder pattern.
    pub fn builder(url: impl Into<String>) -> PoolBuilder {
        PoolBuilder::new(url)
    }

    async fn create_connection(&self) -> Result<Arc<dyn Connection>> {
        let conn: Arc<dyn Connection> = Arc::from(self.factory.connect(&self.config.connection).await?);
        self.total_connections.fetch_add(1, Ordering::Release);
        self.stats.record_created();
        Ok(conn)
    }

    async fn discard(&self, conn: Arc<dyn Connection>) {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "error closing pooled connection");
        }
        self.total_connections.fetch_sub(1, Ordering::Release);
        self.stats.record_closed();
    }

    fn should_recycle(&self, entry: &PoolEntry) -> bool {
        entry.created_at.elapsed() > self.config.max_lifetime
            || entry.last_used.elapsed() > self.config.idle_timeout
    }

    async fn take_idle(&self) -> Option<PoolEntry> {
        loop {
            let entry = self.idle.lock().await.pop()?;
            if self.should_recycle(&entry) {
                self.discard(entry.conn).await;
                continue;
            }
            if self.config.test_on_borrow && !entry.conn.is_valid().await {
                self.stats.record_health_check_failure();
                self.discard(entry.conn).await;
                continue;
            }
            return Some(entry);
        }
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Total open connections, idle and lent out
    pub fn size(&self) -> usize {
        self.total_connections.load(Ordering::Acquire)
    }

    /// Connections currently lent out
    pub fn in_use(&self) -> usize {
        self.lent.lock().len()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Close idle connections and refuse further acquisitions.
    ///
    /// Lent-out connections are closed as they are released.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        let drained: Vec<PoolEntry> = self.idle.lock().await.drain(..).collect();
        for entry in drained {
            self.discard(entry.conn).await;
        }
        debug!(pool = %self.id, "connection pool closed");
        Ok(())
    }
}

#[async_trait]
impl ConnectionProvider for SimpleConnectionPool {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn acquire(&self) -> Result<Arc<dyn Connection>> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolExhausted {
                message: "Pool is shut down".to_string(),
            });
        }

        let start = Instant::now();
        let permit = tokio::time::timeout(self.config.acquire_timeout, self.semaphore.acquire())
            .await
            .map_err(|_| {
                self.stats.record_exhausted();
                Error::PoolExhausted {
                    message: format!(
                        "Timeout waiting for connection ({}ms)",
                        self.config.acquire_timeout.as_millis()
                    ),
                }
            })?
            .map_err(|_| Error::PoolExhausted {
                message: "Pool semaphore closed".to_string(),
            })?;

        let (conn, created_at) = match self.take_idle().await {
            Some(entry) => (entry.conn, entry.created_at),
            // The permit is dropped (returned) on the error path.
            None => (self.create_connection().await?, Instant::now()),
        };

        self.stats
            .record_acquisition(start.elapsed().as_millis() as u64);
        self.lent.lock().insert(conn_key(&conn), created_at);
        // Given back in `release`.
        permit.forget();
        Ok(conn)
    }

    async fn release(&self, conn: Arc<dyn Connection>) -> Result<()> {
        let Some(created_at) = self.lent.lock().remove(&conn_key(&conn)) else {
            return Err(Error::internal(format!(
                "connection released to {} was not acquired from it",
                self.id
            )));
        };

        let reusable = if self.shutdown.load(Ordering::Acquire) {
            false
        } else if self.config.test_on_return && !conn.is_valid().await {
            self.stats.record_health_check_failure();
            false
        } else {
            true
        };

        if reusable {
            self.idle.lock().await.push(PoolEntry {
                conn,
                created_at,
                last_used: Instant::now(),
            });
        } else {
            self.discard(conn).await;
        }

        // A woken waiter must find the connection in `idle`.
        self.semaphore.add_permits(1);
        self.stats.record_release();
        Ok(())
    }
}

impl std::fmt::Debug for SimpleConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleConnectionPool")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("size", &self.size())
            .finish()
    }
}
