//! Transaction coordination
//!
//! One `LogicalTransaction` exists per (execution context, provider) pair.
//! The first `begin` acquires a connection and creates it; nested `begin`
//! calls with the same context join it and bump its reference count. Every
//! `Transaction` handle makes exactly one terminal call (commit or rollback),
//! and only the call that takes the count to zero touches the database:
//!
//! ```text
//! begin (owner)       ref 1
//!   begin (join)      ref 2
//!   rollback          ref 1, rollback-only
//! commit              ref 0 -> real ROLLBACK, error returned
//! ```
//!
//! A handle dropped without a terminal call counts as a rollback.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::classify::SqlOperation;
use crate::connection::{Connection, IsolationLevel};
use crate::context::{ContextId, ExecutionContext};
use crate::error::{settle, Error, Result};
use crate::provider::{
    AcquiredConnection, ConnectionAcquisition, ConnectionProvider, ExternalTransactionManager,
    ProviderId,
};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a logical transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    fn next() -> Self {
        Self(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Registry key: one logical transaction per context and provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    /// Owning execution context
    pub context: ContextId,
    /// Provider the connection came from
    pub provider: ProviderId,
}

/// Options for `begin`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionOptions {
    /// Isolation level; `None` keeps the connection's current level
    pub isolation: Option<IsolationLevel>,
    /// Route pure reads around this transaction
    pub for_update_only: bool,
}

impl TransactionOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set isolation level
    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    /// Set the for-update-only flag
    pub fn with_for_update_only(mut self, for_update_only: bool) -> Self {
        self.for_update_only = for_update_only;
        self
    }
}

/// Lifecycle state of a logical transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Open; may be joined
    Active,
    /// Committed (terminal)
    Committed,
    /// Rolled back (terminal)
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Commit,
    Rollback,
}

#[derive(Debug)]
struct TxState {
    ref_count: usize,
    status: TransactionStatus,
    rollback_only: bool,
}

/// Connection settings to put back before release
#[derive(Debug, Clone, Copy)]
struct SavedSettings {
    auto_commit: bool,
    isolation: Option<IsolationLevel>,
}

/// One unit of work bound to one connection, shared by all joined callers
pub struct LogicalTransaction {
    id: TransactionId,
    key: TransactionKey,
    ctx: ExecutionContext,
    options: TransactionOptions,
    conn: Arc<dyn Connection>,
    acquired: Mutex<Option<AcquiredConnection>>,
    saved: Option<SavedSettings>,
    external: Option<Arc<dyn ExternalTransactionManager>>,
    state: Mutex<TxState>,
}

impl LogicalTransaction {
    /// Transaction id
    #[inline]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Registry key
    #[inline]
    pub fn key(&self) -> TransactionKey {
        self.key
    }

    /// Isolation level requested by the owner
    #[inline]
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.options.isolation
    }

    /// Whether pure reads bypass this transaction
    #[inline]
    pub fn is_for_update_only(&self) -> bool {
        self.options.for_update_only
    }

    /// The connection all joined callers share
    #[inline]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Whether the connection belongs to an external transaction manager
    #[inline]
    pub fn is_external(&self) -> bool {
        self.external.is_some()
    }

    /// Current status
    pub fn status(&self) -> TransactionStatus {
        self.state.lock().status
    }

    /// Number of handles that have not made their terminal call
    pub fn ref_count(&self) -> usize {
        self.state.lock().ref_count
    }

    /// Whether a joined caller requested rollback
    pub fn is_rollback_only(&self) -> bool {
        self.state.lock().rollback_only
    }

    fn try_join(&self) -> bool {
        let mut state = self.state.lock();
        if state.status == TransactionStatus::Active && state.ref_count > 0 {
            state.ref_count += 1;
            true
        } else {
            false
        }
    }

    /// Drop one reference; true when it was the last
    fn release_reference(&self, outcome: Outcome) -> bool {
        let mut state = self.state.lock();
        if outcome == Outcome::Rollback {
            state.rollback_only = true;
        }
        state.ref_count = state.ref_count.saturating_sub(1);
        state.ref_count == 0
    }

    fn set_status(&self, status: TransactionStatus) {
        self.state.lock().status = status;
    }

    /// Perform the real commit or rollback, then restore and release the
    /// connection. Called once, by whoever released the last reference.
    async fn complete(
        self: Arc<Self>,
        registry: &DashMap<TransactionKey, Arc<LogicalTransaction>>,
        requested: Outcome,
    ) -> Result<()> {
        registry.remove_if(&self.key, |_, v| Arc::ptr_eq(v, &self));
        let rollback_only = self.is_rollback_only();

        if self.external.is_some() {
            return self.complete_external(requested, rollback_only);
        }

        let result = if rollback_only || requested == Outcome::Rollback {
            let rolled_back = self.conn.rollback().await;
            self.set_status(TransactionStatus::RolledBack);
            match rolled_back {
                Ok(()) if requested == Outcome::Commit => {
                    warn!(transaction = %self.id, "commit requested on rollback-only transaction, rolled back");
                    Err(Error::transaction(format!(
                        "transaction {} was marked rollback-only by a joined caller and has been rolled back",
                        self.id
                    )))
                }
                Ok(()) => {
                    debug!(transaction = %self.id, "transaction rolled back");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            match self.conn.commit().await {
                Ok(()) => {
                    self.set_status(TransactionStatus::Committed);
                    debug!(transaction = %self.id, "transaction committed");
                    Ok(())
                }
                Err(e) => {
                    warn!(transaction = %self.id, error = %e, "commit failed, rolling back");
                    if let Err(rollback_err) = self.conn.rollback().await {
                        warn!(transaction = %self.id, error = %rollback_err, "rollback after failed commit also failed");
                    }
                    self.set_status(TransactionStatus::RolledBack);
                    Err(e)
                }
            }
        };

        let released = self.restore_and_release().await;
        settle(result, released, "transaction connection")
    }

    fn complete_external(&self, requested: Outcome, rollback_only: bool) -> Result<()> {
        if rollback_only {
            self.set_status(TransactionStatus::RolledBack);
            if requested == Outcome::Commit {
                return Err(Error::transaction(format!(
                    "transaction {} was marked rollback-only on the external transaction manager",
                    self.id
                )));
            }
        } else {
            self.set_status(TransactionStatus::Committed);
        }
        trace!(transaction = %self.id, "external transaction reference completed");
        Ok(())
    }

    async fn restore_and_release(&self) -> Result<()> {
        let mut restored = Ok(());
        if let Some(saved) = self.saved {
            if let Err(e) = self.conn.set_auto_commit(saved.auto_commit).await {
                restored = Err(e);
            }
            if let (Some(applied), Some(previous)) = (self.options.isolation, saved.isolation) {
                if applied != previous {
                    if let Err(e) = self.conn.set_isolation_level(previous).await {
                        warn!(transaction = %self.id, error = %e, "failed to restore isolation level");
                    }
                }
            }
        }

        let acquired = self.acquired.lock().take();
        let released = match acquired {
            Some(acquired) => acquired.release().await,
            None => Ok(()),
        };
        settle(restored, released, "transaction connection")
    }
}

impl fmt::Debug for LogicalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LogicalTransaction")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("options", &self.options)
            .field("ref_count", &state.ref_count)
            .field("status", &state.status)
            .field("rollback_only", &state.rollback_only)
            .field("external", &self.external.is_some())
            .finish()
    }
}

type Registry = DashMap<TransactionKey, Arc<LogicalTransaction>>;

/// A caller's reference to a logical transaction.
///
/// Exactly one of `commit` / `rollback` takes effect per handle;
/// `rollback_if_not_committed` is the idempotent guard for cleanup paths.
pub struct Transaction {
    tx: Arc<LogicalTransaction>,
    registry: Arc<Registry>,
    owner: bool,
    finished: bool,
}

impl Transaction {
    /// Transaction id
    #[inline]
    pub fn id(&self) -> TransactionId {
        self.tx.id
    }

    /// Whether this handle created the transaction
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Whether this handle already made its terminal call
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The shared logical transaction
    #[inline]
    pub fn logical(&self) -> &Arc<LogicalTransaction> {
        &self.tx
    }

    /// The transaction's connection
    #[inline]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.tx.conn
    }

    /// Current status of the logical transaction
    pub fn status(&self) -> TransactionStatus {
        self.tx.status()
    }

    /// Commit. Only the last outstanding reference commits for real; a
    /// rollback-only transaction is rolled back and an error returned.
    pub async fn commit(&mut self) -> Result<()> {
        if self.finished {
            return Err(Error::transaction(format!(
                "transaction {} already completed by this handle",
                self.tx.id
            )));
        }
        self.finish(Outcome::Commit).await
    }

    /// Roll back. Marks the transaction rollback-only; the real rollback
    /// happens when the last reference completes.
    pub async fn rollback(&mut self) -> Result<()> {
        if self.finished {
            return Err(Error::transaction(format!(
                "transaction {} already completed by this handle",
                self.tx.id
            )));
        }
        self.finish(Outcome::Rollback).await
    }

    /// Roll back unless this handle already committed or rolled back
    pub async fn rollback_if_not_committed(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finish(Outcome::Rollback).await
    }

    async fn finish(&mut self, outcome: Outcome) -> Result<()> {
        self.finished = true;
        if outcome == Outcome::Rollback {
            self.forward_rollback_only();
        }

        let last = self.tx.release_reference(outcome);
        trace!(
            transaction = %self.tx.id,
            owner = self.owner,
            ?outcome,
            last,
            "transaction reference completed"
        );
        if !last {
            return Ok(());
        }

        Arc::clone(&self.tx).complete(&self.registry, outcome).await
    }

    fn forward_rollback_only(&self) {
        if let Some(external) = &self.tx.external {
            external.set_rollback_only(&self.tx.ctx, self.tx.key.provider);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(
            transaction = %self.tx.id,
            owner = self.owner,
            "transaction handle dropped without commit or rollback, rolling back"
        );
        self.finished = true;
        self.forward_rollback_only();
        if !self.tx.release_reference(Outcome::Rollback) {
            return;
        }

        let tx = Arc::clone(&self.tx);
        let registry = Arc::clone(&self.registry);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = tx.complete(&registry, Outcome::Rollback).await {
                        warn!(error = %e, "rollback of abandoned transaction failed");
                    }
                });
            }
            Err(_) => {
                registry.remove_if(&tx.key, |_, v| Arc::ptr_eq(v, &tx));
                tx.set_status(TransactionStatus::RolledBack);
                warn!(transaction = %tx.id, "no runtime to roll back abandoned transaction, connection not released");
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.tx.id)
            .field("owner", &self.owner)
            .field("finished", &self.finished)
            .finish()
    }
}

/// A connection lent to one statement
pub struct ConnectionLease {
    conn: Arc<dyn Connection>,
    kind: LeaseKind,
}

enum LeaseKind {
    Transaction(Arc<LogicalTransaction>),
    Owned(AcquiredConnection),
}

impl ConnectionLease {
    /// Lease of the transaction's connection; releasing it is a no-op
    pub fn transaction(tx: Arc<LogicalTransaction>) -> Self {
        Self {
            conn: Arc::clone(&tx.conn),
            kind: LeaseKind::Transaction(tx),
        }
    }

    /// Lease of a connection acquired for this statement only
    pub fn owned(acquired: AcquiredConnection) -> Self {
        Self {
            conn: Arc::clone(acquired.connection()),
            kind: LeaseKind::Owned(acquired),
        }
    }

    /// The connection
    #[inline]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Whether commit and rollback are managed by a surrounding transaction
    pub fn in_transaction(&self) -> bool {
        match &self.kind {
            LeaseKind::Transaction(_) => true,
            LeaseKind::Owned(acquired) => acquired.is_external(),
        }
    }

    /// The transaction this lease belongs to, if any
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match &self.kind {
            LeaseKind::Transaction(tx) => Some(tx.id),
            LeaseKind::Owned(_) => None,
        }
    }

    /// Give the connection back
    pub async fn release(self) -> Result<()> {
        match self.kind {
            LeaseKind::Transaction(_) => Ok(()),
            LeaseKind::Owned(acquired) => acquired.release().await,
        }
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("transaction", &self.transaction_id())
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

/// Registry of logical transactions keyed by (context, provider)
#[derive(Clone, Default)]
pub struct TransactionCoordinator {
    acquisition: ConnectionAcquisition,
    registry: Arc<Registry>,
}

impl TransactionCoordinator {
    /// Coordinator without an external transaction manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Coordinator using the given acquisition strategy
    pub fn with_acquisition(acquisition: ConnectionAcquisition) -> Self {
        Self {
            acquisition,
            registry: Arc::new(DashMap::new()),
        }
    }

    /// Connection acquisition in use
    pub fn acquisition(&self) -> &ConnectionAcquisition {
        &self.acquisition
    }

    /// Begin a transaction, or join the one already active for the context
    /// and provider.
    ///
    /// A joining call keeps the active transaction's isolation level and
    /// for-update-only flag, whatever `options` requests.
    pub async fn begin(
        &self,
        ctx: &ExecutionContext,
        provider: &Arc<dyn ConnectionProvider>,
        options: TransactionOptions,
    ) -> Result<Transaction> {
        let key = TransactionKey {
            context: ctx.id(),
            provider: provider.id(),
        };

        if let Some(tx) = self.try_join(&key, &options) {
            return Ok(tx);
        }

        let acquired = self.acquisition.acquire(ctx, provider).await?;
        let tx = Arc::new(self.open(ctx, key, options, acquired).await?);

        let joined = match self.registry.entry(key) {
            Entry::Occupied(mut entry) => {
                if entry.get().try_join() {
                    Some(Arc::clone(entry.get()))
                } else {
                    entry.insert(Arc::clone(&tx));
                    None
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&tx));
                None
            }
        };

        if let Some(existing) = joined {
            // Lost a race with another begin on the same key.
            if let Err(e) = tx.restore_and_release().await {
                warn!(error = %e, "failed to release surplus transaction connection");
            }
            return Ok(self.handle(existing, false));
        }

        info!(
            transaction = %tx.id,
            context = %key.context,
            provider = %key.provider,
            isolation = ?options.isolation,
            for_update_only = options.for_update_only,
            external = tx.is_external(),
            "transaction started"
        );
        Ok(self.handle(tx, true))
    }

    fn try_join(&self, key: &TransactionKey, options: &TransactionOptions) -> Option<Transaction> {
        let existing = self.registry.get(key).map(|e| Arc::clone(e.value()))?;
        if !existing.try_join() {
            return None;
        }
        if options.isolation.is_some() && options.isolation != existing.isolation() {
            debug!(
                transaction = %existing.id,
                requested = ?options.isolation,
                active = ?existing.isolation(),
                "joined transaction keeps its isolation level"
            );
        }
        debug!(transaction = %existing.id, ref_count = existing.ref_count(), "joined transaction");
        Some(self.handle(existing, false))
    }

    async fn open(
        &self,
        ctx: &ExecutionContext,
        key: TransactionKey,
        options: TransactionOptions,
        acquired: AcquiredConnection,
    ) -> Result<LogicalTransaction> {
        let conn = Arc::clone(acquired.connection());

        let (saved, external) = if acquired.is_external() {
            (None, self.acquisition.external().cloned())
        } else {
            match Self::prepare_connection(conn.as_ref(), options).await {
                Ok(saved) => (Some(saved), None),
                Err(e) => {
                    if let Err(release_err) = acquired.release().await {
                        warn!(error = %release_err, "failed to release connection after begin failure");
                    }
                    return Err(e);
                }
            }
        };

        Ok(LogicalTransaction {
            id: TransactionId::next(),
            key,
            ctx: ctx.clone(),
            options,
            conn,
            acquired: Mutex::new(Some(acquired)),
            saved,
            external,
            state: Mutex::new(TxState {
                ref_count: 1,
                status: TransactionStatus::Active,
                rollback_only: false,
            }),
        })
    }

    async fn prepare_connection(
        conn: &dyn Connection,
        options: TransactionOptions,
    ) -> Result<SavedSettings> {
        let auto_commit = conn.auto_commit().await?;
        let isolation = match options.isolation {
            Some(level) => {
                let previous = conn.isolation_level().await?;
                if previous != Some(level) {
                    conn.set_isolation_level(level).await?;
                }
                previous
            }
            None => None,
        };
        if auto_commit {
            conn.set_auto_commit(false).await?;
        }
        Ok(SavedSettings {
            auto_commit,
            isolation,
        })
    }

    fn handle(&self, tx: Arc<LogicalTransaction>, owner: bool) -> Transaction {
        Transaction {
            tx,
            registry: Arc::clone(&self.registry),
            owner,
            finished: false,
        }
    }

    /// The active logical transaction for the context and provider
    pub fn current(
        &self,
        ctx: &ExecutionContext,
        provider: ProviderId,
    ) -> Option<Arc<LogicalTransaction>> {
        let key = TransactionKey {
            context: ctx.id(),
            provider,
        };
        self.registry
            .get(&key)
            .map(|e| Arc::clone(e.value()))
            .filter(|tx| tx.status() == TransactionStatus::Active)
    }

    /// Whether a transaction is active for the context and provider, locally
    /// or on the external transaction manager
    pub fn is_in_transaction(&self, ctx: &ExecutionContext, provider: ProviderId) -> bool {
        self.current(ctx, provider).is_some() || self.acquisition.is_external_active(ctx, provider)
    }

    /// Number of registered logical transactions
    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    /// Connection to run a statement of kind `operation` on.
    ///
    /// Inside a transaction this is the transaction's connection, except that
    /// a pure read under a for-update-only transaction gets an independent
    /// connection from the provider.
    pub async fn connection_for(
        &self,
        ctx: &ExecutionContext,
        provider: &Arc<dyn ConnectionProvider>,
        operation: SqlOperation,
    ) -> Result<ConnectionLease> {
        if let Some(tx) = self.current(ctx, provider.id()) {
            if tx.is_for_update_only() && operation.is_read_only() {
                debug!(transaction = %tx.id, "read bypasses for-update-only transaction");
                let acquired = ConnectionAcquisition::acquire_from_provider(provider).await?;
                return Ok(ConnectionLease::owned(acquired));
            }
            return Ok(ConnectionLease::transaction(tx));
        }

        let acquired = self.acquisition.acquire(ctx, provider).await?;
        Ok(ConnectionLease::owned(acquired))
    }

    /// Run `action` detached from the caller's transactions.
    ///
    /// The action receives a fresh context, so everything it does acquires
    /// its own connections and neither sees nor joins uncommitted work of
    /// `ctx`. The caller's context is untouched on every exit path.
    pub async fn run_outside_transaction<F, Fut>(&self, ctx: &ExecutionContext, action: F) -> Result<()>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.call_outside_transaction(ctx, action).await
    }

    /// Like `run_outside_transaction`, returning the action's value
    pub async fn call_outside_transaction<T, F, Fut>(
        &self,
        ctx: &ExecutionContext,
        action: F,
    ) -> Result<T>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let detached = ctx.detached();
        trace!(context = %ctx.id(), detached = %detached.id(), "running outside transaction");
        action(detached).await
    }
}

impl fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("acquisition", &self.acquisition)
            .field("active", &self.registry.len())
            .finish()
    }
}
