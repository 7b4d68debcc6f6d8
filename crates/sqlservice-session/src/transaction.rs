//! Nestable transaction scopes.
//!
//! Scopes share one counter per session. Entering the outermost scope begins
//! a transaction; inner scopes only move the counter. When the outermost
//! scope exits the session issues exactly one `COMMIT` or `ROLLBACK`. A
//! rollback requested at any depth (by an error exit or by
//! [`ScopeOptions::rollback`]) is sticky until then.
//!
//! A [`TransactionScope`] that is dropped without being passed to
//! [`Session::exit_scope`] (its future was cancelled, or it panicked) counts
//! as an error exit. Drop cannot await, so when the last scope is dropped
//! this way the session records a pending rollback. The next session call
//! that talks to the database (`begin`, `flush`, `commit`, `get`, queries and
//! `execute`) issues that rollback before doing anything else, so the
//! abandoned writes can never be committed. Work registered with `add` or
//! `delete` in between is discarded with them.

use crate::Session;
use asupersync::{Cx, Outcome};
use sqlservice_core::{Connection, Error, TransactionError, TransactionErrorKind};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Boxed future returned by a [`Session::transaction`] body.
pub type ScopedFuture<'s, T> = Pin<Box<dyn Future<Output = Outcome<T, Error>> + 's>>;

/// Options for one transaction scope.
#[derive(Debug, Clone, Copy)]
pub struct ScopeOptions {
    /// Commit when this scope is the outermost one and exits normally.
    pub commit: bool,
    /// Roll back the whole transaction when the outermost scope exits, even
    /// without an error.
    pub rollback: bool,
}

impl Default for ScopeOptions {
    fn default() -> Self {
        Self {
            commit: true,
            rollback: false,
        }
    }
}

impl ScopeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(mut self, value: bool) -> Self {
        self.commit = value;
        self
    }

    pub fn rollback(mut self, value: bool) -> Self {
        self.rollback = value;
        self
    }
}

/// Depth and rollback flags shared by a session and its open scopes.
#[derive(Debug, Default)]
pub(crate) struct ScopeCounter {
    depth: AtomicUsize,
    rollback_requested: AtomicBool,
    /// Set when the last open scope was dropped without exiting.
    abandoned: AtomicBool,
}

impl ScopeCounter {
    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    fn enter(&self) -> usize {
        self.depth.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrement the depth, returning the remaining depth.
    fn leave(&self) -> usize {
        self.depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1))
            .map_or(0, |previous| previous - 1)
    }

    fn request_rollback(&self) {
        self.rollback_requested.store(true, Ordering::SeqCst);
    }

    fn take_rollback(&self) -> bool {
        self.rollback_requested.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn take_abandoned(&self) -> bool {
        self.abandoned.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn clear_abandoned(&self) {
        self.abandoned.store(false, Ordering::SeqCst);
    }
}

/// Guard for an entered scope. Pass it back to [`Session::exit_scope`].
#[must_use = "a scope must be exited with Session::exit_scope"]
#[derive(Debug)]
pub struct TransactionScope {
    counter: Arc<ScopeCounter>,
    depth: usize,
    options: ScopeOptions,
    exited: bool,
}

impl TransactionScope {
    /// Depth of this scope; the outermost scope has depth 1.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_outermost(&self) -> bool {
        self.depth == 1
    }

    pub fn options(&self) -> ScopeOptions {
        self.options
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        self.counter.request_rollback();
        let remaining = self.counter.leave();
        if remaining == 0 {
            self.counter.take_rollback();
            self.counter.abandoned.store(true, Ordering::SeqCst);
            tracing::warn!(
                depth = self.depth,
                "transaction scope dropped without exiting; rollback is pending"
            );
        } else {
            tracing::debug!(depth = self.depth, "inner transaction scope dropped");
        }
    }
}

impl<C: Connection> Session<C> {
    /// Current scope nesting depth (0 outside any scope).
    pub fn transaction_depth(&self) -> usize {
        self.scopes.depth()
    }

    /// Whether the open transaction is already doomed to roll back.
    pub fn rollback_requested(&self) -> bool {
        self.scopes.rollback_requested.load(Ordering::SeqCst)
    }

    /// Whether a dropped scope left a rollback to be issued.
    pub fn rollback_pending(&self) -> bool {
        self.scopes.abandoned.load(Ordering::SeqCst)
    }

    /// Issue the rollback a dropped scope left pending, if any.
    pub(crate) async fn settle_dropped_scope(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.scopes.take_abandoned() {
            return Outcome::Ok(());
        }
        tracing::warn!("rolling back transaction left open by a dropped scope");
        self.rollback(cx).await
    }

    /// Enter a scope. The outermost scope begins a transaction.
    pub async fn enter_scope(
        &mut self,
        cx: &Cx,
        options: ScopeOptions,
    ) -> Outcome<TransactionScope, Error> {
        let depth = self.scopes.enter();
        let mut scope = TransactionScope {
            counter: Arc::clone(&self.scopes),
            depth,
            options,
            exited: false,
        };
        tracing::debug!(depth, "entered transaction scope");
        if depth > 1 {
            return Outcome::Ok(scope);
        }

        let failed = match self.begin(cx).await {
            Outcome::Ok(()) => return Outcome::Ok(scope),
            other => other,
        };
        // Unwind the counter; nothing was begun.
        scope.exited = true;
        self.scopes.leave();
        self.scopes.take_rollback();
        match failed {
            Outcome::Ok(()) => Outcome::Ok(scope),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Exit a scope with the result of its body.
    ///
    /// Any non-`Ok` result requests a rollback of the whole transaction and
    /// is returned unchanged. When the outermost scope exits, a requested
    /// rollback is issued; otherwise, if its options say so, the session is
    /// flushed and committed. A failed commit is followed by a rollback and
    /// its error is returned.
    #[tracing::instrument(level = "debug", skip_all, fields(depth = scope.depth))]
    pub async fn exit_scope<T>(
        &mut self,
        cx: &Cx,
        mut scope: TransactionScope,
        result: Outcome<T, Error>,
    ) -> Outcome<T, Error> {
        scope.exited = true;
        let failed = !matches!(result, Outcome::Ok(_));
        if failed || scope.options.rollback {
            self.scopes.request_rollback();
        }

        let expected = self.scopes.depth();
        let remaining = self.scopes.leave();
        if expected != scope.depth {
            self.scopes.request_rollback();
            if remaining == 0 {
                self.scopes.take_rollback();
                self.scopes.abandoned.store(true, Ordering::SeqCst);
            }
            return Outcome::Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::ScopeMismatch,
                message: format!(
                    "exited scope at depth {} while depth {} was innermost",
                    scope.depth, expected
                ),
            }));
        }
        if remaining > 0 {
            return result;
        }

        if self.scopes.take_rollback() {
            return match self.rollback(cx).await {
                Outcome::Ok(()) => result,
                Outcome::Err(e) => {
                    tracing::warn!(error = %e, "rollback at scope exit failed");
                    if failed { result } else { Outcome::Err(e) }
                }
                Outcome::Cancelled(r) => {
                    if failed { result } else { Outcome::Cancelled(r) }
                }
                Outcome::Panicked(p) => {
                    if failed { result } else { Outcome::Panicked(p) }
                }
            };
        }

        if !scope.options.commit || !(self.in_transaction || self.has_pending_changes()) {
            return result;
        }

        match self.commit(cx).await {
            Outcome::Ok(()) => result,
            Outcome::Err(e) => {
                self.rollback_after_failed_commit(cx).await;
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                self.rollback_after_failed_commit(cx).await;
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.rollback_after_failed_commit(cx).await;
                Outcome::Panicked(p)
            }
        }
    }

    async fn rollback_after_failed_commit(&mut self, cx: &Cx) {
        match self.rollback(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                tracing::warn!(error = %e, "rollback after failed commit also failed");
            }
            Outcome::Cancelled(_) | Outcome::Panicked(_) => {
                tracing::warn!("rollback after failed commit did not complete");
            }
        }
    }

    /// Run `body` inside a transaction scope.
    ///
    /// Scopes nest: only the outermost one begins and ends the transaction.
    ///
    /// ```ignore
    /// session
    ///     .transaction(&cx, ScopeOptions::default(), |s, cx| {
    ///         Box::pin(async move { s.save(cx, input, &mut SaveOptions::default()).await })
    ///     })
    ///     .await
    /// ```
    pub async fn transaction<T, F>(
        &mut self,
        cx: &Cx,
        options: ScopeOptions,
        body: F,
    ) -> Outcome<T, Error>
    where
        F: for<'s> FnOnce(&'s mut Session<C>, &'s Cx) -> ScopedFuture<'s, T>,
    {
        let scope = match self.enter_scope(cx, options).await {
            Outcome::Ok(scope) => scope,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let result = body(self, cx).await;
        self.exit_scope(cx, scope, result).await
    }
}
