//! Execution context identity
//!
//! Transactions are scoped to an explicit `ExecutionContext` instead of the
//! current thread. Every call that may begin, join or look up a transaction
//! takes the context; nested calls that pass the same context join the same
//! logical transaction.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric id
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// A logical unit of execution (a request, a job, a task chain).
///
/// Cloning keeps the identity, so a clone handed to a nested call joins the
/// caller's transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    id: ContextId,
    external_transactions: bool,
}

impl ExecutionContext {
    /// Create a context with a fresh identity
    pub fn new() -> Self {
        Self {
            id: ContextId::next(),
            external_transactions: true,
        }
    }

    /// Context identity
    #[inline]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Whether an external transaction manager may supply connections
    #[inline]
    pub fn external_transactions_enabled(&self) -> bool {
        self.external_transactions
    }

    /// Same identity, but never consult the external transaction manager
    pub fn without_external_transactions(mut self) -> Self {
        self.external_transactions = false;
        self
    }

    /// A fresh identity that shares nothing with this context.
    ///
    /// Work run under the detached context neither sees nor joins the
    /// transactions of `self`, and does not use external transactions.
    pub fn detached(&self) -> Self {
        Self {
            id: ContextId::next(),
            external_transactions: false,
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_are_unique() {
        let a = ExecutionContext::new();
        let b = ExecutionContext::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_detached_context() {
        let ctx = ExecutionContext::new();
        let detached = ctx.detached();
        assert_ne!(ctx.id(), detached.id());
        assert!(ctx.external_transactions_enabled());
        assert!(!detached.external_transactions_enabled());
    }

    #[test]
    fn test_without_external_transactions_keeps_identity() {
        let ctx = ExecutionContext::new();
        let id = ctx.id();
        let ctx = ctx.without_external_transactions();
        assert_eq!(ctx.id(), id);
        assert!(!ctx.external_transactions_enabled());
        assert!(format!("{}", id).starts_with("ctx-"));
    }
}
