//! Session, save/upsert and transaction scopes for SQLService.
//!
//! `sqlservice-session` is the **unit-of-work layer**. A [`Session`] owns one
//! [`Connection`] and tracks the model instances it has loaded or been given.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: a single tracked instance per stored row.
//! - **Change tracking**: pending inserts and deletes plus snapshot-based
//!   dirty detection, written out by [`Session::flush`].
//! - **Save/upsert**: [`Session::save`] and [`Session::save_all`] resolve each
//!   input against stored rows and merge or insert, recursing into
//!   relationships.
//! - **Bulk statements**: [`Session::destroy`] deletes by key and
//!   [`Session::bulk_insert`] and friends write many rows per statement,
//!   outside the unit of work.
//! - **Transaction scopes**: [`Session::transaction`] nests freely and issues
//!   exactly one `COMMIT` or `ROLLBACK` when the outermost scope exits.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(conn);
//!
//! let user = session
//!     .save(&cx, (&USERS, json!({"id": 1, "name": "Ada"})), &mut SaveOptions::default())
//!     .await?;
//!
//! session
//!     .transaction(&cx, ScopeOptions::default(), |s, cx| {
//!         Box::pin(async move {
//!             s.delete(&user);
//!             s.flush(cx).await.map(|_| ())
//!         })
//!     })
//!     .await?;
//! ```

pub mod bulk;
pub mod flush;
pub mod identity;
pub mod save;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transaction;

pub use bulk::DestroyTarget;
pub use flush::FlushResult;
pub use identity::{Identity, IdentityFn, ObjectKey, resolve_identity};
pub use save::{Input, SaveHook, SaveOptions};
pub use transaction::{ScopeOptions, ScopedFuture, TransactionScope};

use asupersync::{Cx, Outcome};
use sqlservice_core::{
    Connection, Error, Instance, IsolationLevel, ModelEvent, ModelSchema, QueryError,
    QueryErrorKind, Record, Row, TransactionError, TransactionErrorKind, Value,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use transaction::ScopeCounter;

type Snapshot = BTreeMap<&'static str, Value>;

// ============================================================================
// Session Events
// ============================================================================

/// Session event callback. Returning `Err` aborts the operation that fired it.
type SessionEventFn = Box<dyn FnMut() -> Result<(), Error> + Send>;

/// Registered session-level callbacks, fired around flush, commit and rollback.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    fn fire(&mut self, event: SessionEvent) -> Result<(), Error> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush executes pending changes.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before commit (after flush).
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Begin a transaction automatically when a flush has work to do.
    pub auto_begin: bool,
    /// Expire tracked instances after commit; they are refreshed from the
    /// database the next time the session resolves them.
    pub expire_on_commit: bool,
    /// Isolation level requested by `BEGIN`, if any.
    pub isolation_level: Option<IsolationLevel>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            expire_on_commit: true,
            isolation_level: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_begin(mut self, value: bool) -> Self {
        self.auto_begin = value;
        self
    }

    pub fn expire_on_commit(mut self, value: bool) -> Self {
        self.expire_on_commit = value;
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }
}

// ============================================================================
// Object State
// ============================================================================

/// State of a tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Registered for insertion, not yet flushed.
    New,
    /// Backed by a row in the current transaction.
    Persistent,
    /// Registered for deletion.
    Deleted,
    /// Persistent, but values may be stale after a commit.
    Expired,
}

struct TrackedObject {
    instance: Instance,
    state: ObjectState,
    /// Values as of the last flush or load; drives dirty detection.
    original: Option<Snapshot>,
    /// Values as of the last commit or load; `None` for rows that were never
    /// committed. Rollback restores these.
    committed: Option<Snapshot>,
    key: Option<ObjectKey>,
}

/// Counters describing session state, for debugging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionDebugInfo {
    pub tracked: usize,
    pub pending_new: usize,
    pub pending_delete: usize,
    pub in_transaction: bool,
    pub scope_depth: usize,
}

// ============================================================================
// Session
// ============================================================================

/// The central unit-of-work manager.
///
/// Tracks instances loaded from or added to the database, writes their
/// changes on flush and coordinates transaction scopes.
pub struct Session<C: Connection> {
    connection: C,
    in_transaction: bool,
    /// Tracked instances keyed by [`Instance::address`].
    objects: HashMap<usize, TrackedObject>,
    /// Addresses in tracking order.
    order: Vec<usize>,
    /// Primary key -> address.
    identity_map: HashMap<ObjectKey, usize>,
    pending_new: Vec<usize>,
    pending_delete: Vec<usize>,
    config: SessionConfig,
    event_callbacks: SessionEventCallbacks,
    scopes: Arc<ScopeCounter>,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.debug_state())
            .field("config", &self.config)
            .field("event_callbacks", &self.event_callbacks)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Session<C> {
    /// Create a new session from an existing connection.
    pub fn new(connection: C) -> Self {
        Self::with_config(connection, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(connection: C, config: SessionConfig) -> Self {
        Self {
            connection,
            in_transaction: false,
            objects: HashMap::new(),
            order: Vec::new(),
            identity_map: HashMap::new(),
            pending_new: Vec::new(),
            pending_delete: Vec::new(),
            config,
            event_callbacks: SessionEventCallbacks::default(),
            scopes: Arc::new(ScopeCounter::default()),
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Close the underlying connection, discarding tracked state.
    pub async fn close(self, cx: &Cx) -> sqlservice_core::Result<()> {
        self.connection.close(cx).await
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before flush. Returning `Err` aborts the flush.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback to run before `COMMIT`. Returning `Err` aborts the commit.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.before_commit.push(Box::new(f));
    }

    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.after_commit.push(Box::new(f));
    }

    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Object Tracking
    // ========================================================================

    /// Register an instance for insertion on the next flush.
    ///
    /// Adding an instance that is already tracked is a no-op, except that a
    /// pending delete is cancelled.
    pub fn add(&mut self, instance: &Instance) {
        let addr = instance.address();
        if let Some(tracked) = self.objects.get_mut(&addr) {
            if tracked.state == ObjectState::Deleted {
                tracked.state = ObjectState::Persistent;
                self.pending_delete.retain(|a| *a != addr);
            }
            return;
        }
        self.track(instance, ObjectState::New, None, None);
        self.pending_new.push(addr);
        self.register_key(addr);
    }

    pub fn add_all<'a, I>(&mut self, instances: I)
    where
        I: IntoIterator<Item = &'a Instance>,
    {
        for instance in instances {
            self.add(instance);
        }
    }

    /// Register an instance for deletion on the next flush.
    ///
    /// A pending (never flushed) instance is simply forgotten. An untracked
    /// instance with a primary key is attached in the deleted state.
    pub fn delete(&mut self, instance: &Instance) {
        let addr = instance.address();
        match self.objects.get_mut(&addr).map(|t| t.state) {
            Some(ObjectState::New) => self.untrack(addr),
            Some(ObjectState::Deleted) => {}
            Some(_) => {
                if let Some(tracked) = self.objects.get_mut(&addr) {
                    tracked.state = ObjectState::Deleted;
                }
                self.pending_delete.push(addr);
            }
            None => {
                if instance.primary_key_values().is_none() {
                    return;
                }
                let snapshot = instance.read().snapshot();
                self.track(
                    instance,
                    ObjectState::Deleted,
                    Some(snapshot.clone()),
                    Some(snapshot),
                );
                self.register_key(addr);
                self.pending_delete.push(addr);
            }
        }
    }

    /// Whether this exact instance is tracked by the session.
    pub fn contains(&self, instance: &Instance) -> bool {
        self.objects.contains_key(&instance.address())
    }

    pub fn object_state(&self, instance: &Instance) -> Option<ObjectState> {
        self.objects.get(&instance.address()).map(|t| t.state)
    }

    /// Stop tracking an instance. Pending work for it is discarded.
    pub fn expunge(&mut self, instance: &Instance) {
        self.untrack(instance.address());
    }

    pub fn expunge_all(&mut self) {
        self.objects.clear();
        self.order.clear();
        self.identity_map.clear();
        self.pending_new.clear();
        self.pending_delete.clear();
    }

    /// Whether flushing would write anything for this instance.
    pub fn is_modified(&self, instance: &Instance) -> bool {
        let Some(tracked) = self.objects.get(&instance.address()) else {
            return false;
        };
        match tracked.state {
            ObjectState::New | ObjectState::Deleted => true,
            ObjectState::Persistent | ObjectState::Expired => tracked
                .original
                .as_ref()
                .is_some_and(|original| !instance.read().changed_since(original).is_empty()),
        }
    }

    /// Mark a persistent instance as stale.
    pub fn expire(&mut self, instance: &Instance) {
        if let Some(tracked) = self.objects.get_mut(&instance.address()) {
            if tracked.state == ObjectState::Persistent {
                tracked.state = ObjectState::Expired;
            }
        }
    }

    pub fn expire_all(&mut self) {
        for tracked in self.objects.values_mut() {
            if tracked.state == ObjectState::Persistent {
                tracked.state = ObjectState::Expired;
            }
        }
    }

    /// Whether any insert, update or delete is waiting for a flush.
    pub fn has_pending_changes(&self) -> bool {
        !self.pending_new.is_empty() || !self.pending_delete.is_empty() || !self.dirty().is_empty()
    }

    pub fn pending_new_count(&self) -> usize {
        self.pending_new.len()
    }

    pub fn pending_delete_count(&self) -> usize {
        self.pending_delete.len()
    }

    pub fn tracked_count(&self) -> usize {
        self.objects.len()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn debug_state(&self) -> SessionDebugInfo {
        SessionDebugInfo {
            tracked: self.objects.len(),
            pending_new: self.pending_new.len(),
            pending_delete: self.pending_delete.len(),
            in_transaction: self.in_transaction,
            scope_depth: self.scopes.depth(),
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Find the instance with `identity`.
    ///
    /// Tracked instances are consulted first (the identity map for primary
    /// key identities, a scan otherwise). On a miss the row is selected and
    /// registered as persistent, firing `Load` handlers. A non-primary-key
    /// identity matching more than one row is an [`Error::Identity`].
    #[tracing::instrument(
        level = "debug",
        skip(self, cx, identity),
        fields(table = identity.schema().table(), primary = identity.is_primary_key())
    )]
    pub async fn get(&mut self, cx: &Cx, identity: &Identity) -> Outcome<Option<Instance>, Error> {
        match self.settle_dropped_scope(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if let Some(addr) = self.find_tracked(identity) {
            let Some(tracked) = self.objects.get(&addr) else {
                return Outcome::Ok(None);
            };
            let instance = tracked.instance.clone();
            let state = tracked.state;
            match state {
                ObjectState::New | ObjectState::Persistent => {
                    tracing::debug!("identity map hit");
                    return Outcome::Ok(Some(instance));
                }
                ObjectState::Deleted => return Outcome::Ok(None),
                ObjectState::Expired => {
                    return match self.refresh(cx, &instance).await {
                        Outcome::Ok(found) => Outcome::Ok(found.then_some(instance)),
                        Outcome::Err(e) => Outcome::Err(e),
                        Outcome::Cancelled(r) => Outcome::Cancelled(r),
                        Outcome::Panicked(p) => Outcome::Panicked(p),
                    };
                }
            }
        }

        let schema = identity.schema();
        let columns: Vec<&str> = identity.columns().collect();
        // Two rows are enough to tell a unique match from an ambiguous one.
        let limit = if identity.is_primary_key() { 1 } else { 2 };
        let sql = flush::select_sql(self.connection.dialect(), schema, &columns, Some(limit));
        tracing::debug!(sql = %sql, "identity map miss, querying");

        let rows = match self.connection.query(cx, &sql, &identity.values()).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if rows.len() > 1 {
            return Outcome::Err(Error::Identity(sqlservice_core::IdentityError {
                model: schema.name(),
                message: format!(
                    "identity ({}) matches more than one row",
                    columns.join(", ")
                ),
            }));
        }
        match rows.first() {
            Some(row) => match self.track_row(schema, row) {
                Ok(instance) => Outcome::Ok(Some(instance)),
                Err(e) => Outcome::Err(e),
            },
            None => Outcome::Ok(None),
        }
    }

    /// Find an instance by primary key values in declaration order.
    pub async fn get_by_pk(
        &mut self,
        cx: &Cx,
        schema: &'static ModelSchema,
        pk: Vec<Value>,
    ) -> Outcome<Option<Instance>, Error> {
        match Identity::primary_key(schema, pk) {
            Ok(Some(identity)) => self.get(cx, &identity).await,
            Ok(None) => Outcome::Ok(None),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Attach the state of `instance` to the session.
    ///
    /// If the session already tracks the row with the same primary key, the
    /// values `instance` explicitly set are copied onto the tracked instance,
    /// which is returned. With `load`, the row is looked up in the database
    /// when it is not tracked. Otherwise `instance` itself is added.
    #[tracing::instrument(level = "debug", skip(self, cx, instance), fields(model = instance.schema().name()))]
    pub async fn merge(
        &mut self,
        cx: &Cx,
        instance: &Instance,
        load: bool,
    ) -> Outcome<Instance, Error> {
        if self.contains(instance) {
            return Outcome::Ok(instance.clone());
        }
        let identity = match resolve_identity(instance, None) {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                self.add(instance);
                return Outcome::Ok(instance.clone());
            }
            Err(e) => return Outcome::Err(e),
        };

        let existing = if load {
            match self.get(cx, &identity).await {
                Outcome::Ok(found) => found,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        } else {
            self.find_tracked(&identity)
                .and_then(|addr| self.objects.get(&addr))
                .filter(|t| t.state != ObjectState::Deleted)
                .map(|t| t.instance.clone())
        };

        match existing {
            Some(existing) => {
                let changed = existing.write().merge_values_from(&instance.read());
                tracing::debug!(changed, "merged into tracked instance");
                Outcome::Ok(existing)
            }
            None => {
                self.add(instance);
                Outcome::Ok(instance.clone())
            }
        }
    }

    /// Reload a tracked instance from its row.
    ///
    /// Columns changed locally since the last flush keep their local value.
    /// Returns `false` (and stops tracking the instance) when the row no
    /// longer exists.
    pub async fn refresh(&mut self, cx: &Cx, instance: &Instance) -> Outcome<bool, Error> {
        match self.settle_dropped_scope(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let addr = instance.address();
        let schema = instance.schema();
        let Some(tracked) = self.objects.get(&addr) else {
            return Outcome::Ok(false);
        };
        let original = tracked.original.clone().unwrap_or_default();
        let pk = primary_key_from(schema, &original).or_else(|| instance.primary_key_values());
        let Some(pk) = pk else {
            return Outcome::Ok(false);
        };

        let sql = flush::select_sql(
            self.connection.dialect(),
            schema,
            schema.primary_key(),
            Some(1),
        );
        let row = match self.connection.query_one(cx, &sql, &pk).await {
            Outcome::Ok(row) => row,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let Some(row) = row else {
            self.untrack(addr);
            return Outcome::Ok(false);
        };

        let loaded = match record_from_row(schema, &row) {
            Ok(record) => record,
            Err(e) => return Outcome::Err(e),
        };
        let fresh = loaded.snapshot();
        {
            let mut record = instance.write();
            let local_changes: Vec<&'static str> = record
                .changed_since(&original)
                .iter()
                .map(|c| c.name)
                .collect();
            for (name, value) in &fresh {
                if !local_changes.contains(name) {
                    if let Err(e) = record.set_silent(name, value.clone()) {
                        return Outcome::Err(e);
                    }
                }
            }
        }
        if let Some(tracked) = self.objects.get_mut(&addr) {
            tracked.state = ObjectState::Persistent;
            tracked.original = Some(fresh.clone());
            tracked.committed = Some(fresh);
        }
        Outcome::Ok(true)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Run a query and return every row.
    pub async fn all(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        match self.settle_dropped_scope(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        self.connection.query(cx, sql, params).await
    }

    /// Execute a statement that returns no rows, such as DDL.
    ///
    /// Tracked instances are not touched; callers that change mapped rows
    /// this way should expire them.
    pub async fn execute(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<u64, Error> {
        match self.settle_dropped_scope(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        tracing::debug!(sql, "execute");
        self.connection.execute(cx, sql, params).await
    }

    /// First row of a query, if any.
    pub async fn first(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Option<Row>, Error> {
        match self.settle_dropped_scope(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        self.connection.query_one(cx, sql, params).await
    }

    /// Exactly one row; no row or several rows is a query error.
    pub async fn one(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<Row, Error> {
        match self.one_or_none(cx, sql, params).await {
            Outcome::Ok(Some(row)) => Outcome::Ok(row),
            Outcome::Ok(None) => Outcome::Err(result_error(
                QueryErrorKind::NoResult,
                "no row was found when one was required",
                sql,
            )),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// At most one row; several rows is a query error.
    pub async fn one_or_none(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Option<Row>, Error> {
        match self.settle_dropped_scope(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match self.connection.query(cx, sql, params).await {
            Outcome::Ok(rows) if rows.len() > 1 => Outcome::Err(result_error(
                QueryErrorKind::MultipleResults,
                "multiple rows were found when one or none was required",
                sql,
            )),
            Outcome::Ok(rows) => Outcome::Ok(rows.into_iter().next()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Run a query over `schema`'s table and return tracked instances.
    ///
    /// Rows whose primary key is already tracked resolve to the tracked
    /// instance; the others are registered as persistent.
    #[tracing::instrument(level = "debug", skip(self, cx, schema, params), fields(table = schema.table()))]
    pub async fn load_all(
        &mut self,
        cx: &Cx,
        schema: &'static ModelSchema,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Vec<Instance>, Error> {
        match self.settle_dropped_scope(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let rows = match self.connection.query(cx, sql, params).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.track_row(schema, row) {
                Ok(instance) => instances.push(instance),
                Err(e) => return Outcome::Err(e),
            }
        }
        Outcome::Ok(instances)
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Begin a transaction if none is active.
    ///
    /// A rollback left pending by a dropped transaction scope is issued first,
    /// as it is by every other call that reaches the database.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.settle_dropped_scope(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if self.in_transaction {
            return Outcome::Ok(());
        }

        let dialect = self.connection.dialect();
        for sql in dialect.begin_statements(self.config.isolation_level) {
            match self.connection.execute(cx, &sql, &[]).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        self.in_transaction = true;
        tracing::debug!(dialect = dialect.name(), "transaction started");
        Outcome::Ok(())
    }

    /// Flush pending changes and commit the current transaction.
    ///
    /// Fails with [`TransactionErrorKind::NotActive`] when, after the flush,
    /// no transaction is open.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.settle_dropped_scope(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match self.flush(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeCommit) {
            return Outcome::Err(e);
        }

        if !self.in_transaction {
            return Outcome::Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NotActive,
                message: "commit called with no active transaction".to_string(),
            }));
        }

        match self.connection.execute(cx, "COMMIT", &[]).await {
            Outcome::Ok(_) => {
                self.in_transaction = false;
            }
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let expire = self.config.expire_on_commit;
        for tracked in self.objects.values_mut() {
            if matches!(tracked.state, ObjectState::Persistent | ObjectState::Expired) {
                tracked.committed.clone_from(&tracked.original);
                if expire {
                    tracked.state = ObjectState::Expired;
                }
            }
        }
        tracing::debug!(tracked = self.objects.len(), "transaction committed");

        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterCommit) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    /// Roll back the current transaction.
    ///
    /// Pending work is discarded, instances whose rows were never committed
    /// stop being tracked and the others are restored to their last committed
    /// values.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.scopes.clear_abandoned();
        if self.in_transaction {
            match self.connection.execute(cx, "ROLLBACK", &[]).await {
                Outcome::Ok(_) => {
                    self.in_transaction = false;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        self.pending_new.clear();
        self.pending_delete.clear();

        let mut discard = Vec::new();
        for (addr, tracked) in &mut self.objects {
            match tracked.committed.clone() {
                Some(committed) if tracked.state != ObjectState::New => {
                    tracked.instance.write().restore(committed.clone());
                    tracked.original = Some(committed);
                    tracked.state = ObjectState::Persistent;
                }
                _ => discard.push(*addr),
            }
        }
        for addr in discard {
            self.untrack(addr);
        }
        // Restored primary keys may differ from the flushed ones.
        self.identity_map.clear();
        for addr in self.order.clone() {
            self.register_key(addr);
        }
        tracing::debug!(tracked = self.objects.len(), "transaction rolled back");

        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterRollback) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn track(
        &mut self,
        instance: &Instance,
        state: ObjectState,
        original: Option<Snapshot>,
        committed: Option<Snapshot>,
    ) {
        let addr = instance.address();
        self.objects.insert(
            addr,
            TrackedObject {
                instance: instance.clone(),
                state,
                original,
                committed,
                key: None,
            },
        );
        self.order.push(addr);
    }

    fn untrack(&mut self, addr: usize) {
        if let Some(tracked) = self.objects.remove(&addr) {
            if let Some(key) = tracked.key {
                if self.identity_map.get(&key) == Some(&addr) {
                    self.identity_map.remove(&key);
                }
            }
        }
        self.order.retain(|a| *a != addr);
        self.pending_new.retain(|a| *a != addr);
        self.pending_delete.retain(|a| *a != addr);
    }

    /// (Re)compute the identity-map entry of a tracked instance.
    fn register_key(&mut self, addr: usize) {
        let Some(tracked) = self.objects.get_mut(&addr) else {
            return;
        };
        let key = ObjectKey::from_instance(&tracked.instance);
        if let Some(old) = tracked.key {
            if Some(old) != key && self.identity_map.get(&old) == Some(&addr) {
                self.identity_map.remove(&old);
            }
        }
        tracked.key = key;
        if let Some(key) = key {
            self.identity_map.entry(key).or_insert(addr);
        }
    }

    fn find_tracked(&self, identity: &Identity) -> Option<usize> {
        if let Some(key) = identity.object_key() {
            return self.identity_map.get(&key).copied().filter(|addr| {
                self.objects
                    .get(addr)
                    .is_some_and(|t| identity.matches(&t.instance.read()))
            });
        }
        let schema = identity.schema();
        self.order.iter().copied().find(|addr| {
            self.objects.get(addr).is_some_and(|t| {
                t.instance.schema().same_as(schema)
                    && t.state != ObjectState::Deleted
                    && identity.matches(&t.instance.read())
            })
        })
    }

    /// Register a loaded row, or return the instance already tracking it.
    fn track_row(&mut self, schema: &'static ModelSchema, row: &Row) -> sqlservice_core::Result<Instance> {
        let mut record = record_from_row(schema, row)?;
        if let Some(pk) = record.primary_key_values() {
            let key = ObjectKey::from_pk(schema, &pk);
            if let Some(tracked) = self
                .identity_map
                .get(&key)
                .and_then(|addr| self.objects.get(addr))
            {
                return Ok(tracked.instance.clone());
            }
        }
        schema.events().dispatch(ModelEvent::Load, &mut record)?;
        let snapshot = record.snapshot();
        let instance = Instance::from_record(record);
        self.track(
            &instance,
            ObjectState::Persistent,
            Some(snapshot.clone()),
            Some(snapshot),
        );
        self.register_key(instance.address());
        Ok(instance)
    }

    /// Persistent instances whose values differ from their last flush, in tracking order.
    fn dirty(&self) -> Vec<usize> {
        self.order
            .iter()
            .copied()
            .filter(|addr| {
                self.objects.get(addr).is_some_and(|t| {
                    matches!(t.state, ObjectState::Persistent | ObjectState::Expired)
                        && t.original
                            .as_ref()
                            .is_some_and(|o| !t.instance.read().changed_since(o).is_empty())
                })
            })
            .collect()
    }
}

fn record_from_row(schema: &'static ModelSchema, row: &Row) -> sqlservice_core::Result<Record> {
    let mut record = Record::new(schema);
    for (name, value) in row.iter() {
        if schema.column(name).is_some() {
            record.set_silent(name, value.clone())?;
        }
    }
    Ok(record)
}

fn primary_key_from(schema: &ModelSchema, values: &Snapshot) -> Option<Vec<Value>> {
    schema
        .primary_key()
        .iter()
        .map(|name| values.get(name).filter(|v| !v.is_null()).cloned())
        .collect()
}

fn result_error(kind: QueryErrorKind, message: &str, sql: &str) -> Error {
    let mut err = QueryError::new(kind, message);
    err.sql = Some(sql.to_string());
    Error::Query(err)
}
