//! Connection acquisition
//!
//! Connections come from a `ConnectionProvider` (usually a pool). When an
//! external transaction manager is installed and has a transaction active for
//! the provider, its connection is used instead and is never released here:
//! the external manager owns its lifecycle.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::connection::Connection;
use crate::context::ExecutionContext;
use crate::error::Result;

static NEXT_PROVIDER_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a connection provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(u64);

impl ProviderId {
    /// Allocate a new, process-unique provider id
    pub fn next() -> Self {
        Self(NEXT_PROVIDER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider-{}", self.0)
    }
}

/// Source of connections
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Identity used to scope transactions
    fn id(&self) -> ProviderId;

    /// Obtain a connection, waiting if none is available
    async fn acquire(&self) -> Result<Arc<dyn Connection>>;

    /// Hand a connection back
    async fn release(&self, conn: Arc<dyn Connection>) -> Result<()>;
}

/// Transaction manager living outside this layer (e.g. an application
/// framework) that may already have a transaction open on a provider.
#[async_trait]
pub trait ExternalTransactionManager: Send + Sync {
    /// Whether the external manager has a transaction active for the provider
    fn is_transaction_active(&self, ctx: &ExecutionContext, provider: ProviderId) -> bool;

    /// The connection bound to the external transaction
    async fn current_connection(
        &self,
        ctx: &ExecutionContext,
        provider: ProviderId,
    ) -> Result<Arc<dyn Connection>>;

    /// Ask the external manager to roll back its transaction when it completes
    fn set_rollback_only(&self, _ctx: &ExecutionContext, _provider: ProviderId) {}
}

/// Where an acquired connection came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOrigin {
    /// Acquired from the provider, must be released to it
    Provider,
    /// Owned by the external transaction manager
    External,
}

/// A connection plus the knowledge of how to give it back
pub struct AcquiredConnection {
    conn: Arc<dyn Connection>,
    origin: ConnectionOrigin,
    provider: Arc<dyn ConnectionProvider>,
}

impl AcquiredConnection {
    /// The connection
    #[inline]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Where the connection came from
    #[inline]
    pub fn origin(&self) -> ConnectionOrigin {
        self.origin
    }

    /// Whether the external transaction manager owns the connection
    #[inline]
    pub fn is_external(&self) -> bool {
        self.origin == ConnectionOrigin::External
    }

    /// Provider the connection belongs to
    pub fn provider(&self) -> &Arc<dyn ConnectionProvider> {
        &self.provider
    }

    /// Return the connection to its provider (no-op for external connections)
    pub async fn release(self) -> Result<()> {
        match self.origin {
            ConnectionOrigin::Provider => self.provider.release(self.conn).await,
            ConnectionOrigin::External => Ok(()),
        }
    }
}

impl fmt::Debug for AcquiredConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquiredConnection")
            .field("origin", &self.origin)
            .field("provider", &self.provider.id())
            .finish()
    }
}

/// Obtains connections, deferring to an external transaction manager when one
/// is installed, active and not disabled for the context.
#[derive(Clone, Default)]
pub struct ConnectionAcquisition {
    external: Option<Arc<dyn ExternalTransactionManager>>,
}

impl ConnectionAcquisition {
    /// Acquisition straight from providers
    pub fn new() -> Self {
        Self { external: None }
    }

    /// Acquisition that consults an external transaction manager first
    pub fn with_external(external: Arc<dyn ExternalTransactionManager>) -> Self {
        Self {
            external: Some(external),
        }
    }

    /// The installed external manager, if any
    pub fn external(&self) -> Option<&Arc<dyn ExternalTransactionManager>> {
        self.external.as_ref()
    }

    /// Whether an external transaction is active for the context and provider
    pub fn is_external_active(&self, ctx: &ExecutionContext, provider: ProviderId) -> bool {
        ctx.external_transactions_enabled()
            && self
                .external
                .as_ref()
                .is_some_and(|ext| ext.is_transaction_active(ctx, provider))
    }

    /// Acquire a connection for the context
    pub async fn acquire(
        &self,
        ctx: &ExecutionContext,
        provider: &Arc<dyn ConnectionProvider>,
    ) -> Result<AcquiredConnection> {
        if let Some(ext) = &self.external {
            if self.is_external_active(ctx, provider.id()) {
                let conn = ext.current_connection(ctx, provider.id()).await?;
                tracing::trace!(context = %ctx.id(), provider = %provider.id(), "using external transaction connection");
                return Ok(AcquiredConnection {
                    conn,
                    origin: ConnectionOrigin::External,
                    provider: Arc::clone(provider),
                });
            }
        }

        Self::acquire_from_provider(provider).await
    }

    /// Acquire directly from the provider, ignoring any external transaction
    pub async fn acquire_from_provider(
        provider: &Arc<dyn ConnectionProvider>,
    ) -> Result<AcquiredConnection> {
        let conn = provider.acquire().await?;
        Ok(AcquiredConnection {
            conn,
            origin: ConnectionOrigin::Provider,
            provider: Arc::clone(provider),
        })
    }
}

impl fmt::Debug for ConnectionAcquisition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionAcquisition")
            .field("external", &self.external.is_some())
            .finish()
    }
}
