//! Flush: write pending session changes as SQL statements.
//!
//! Order is fixed: deletes (latest registration first), then inserts in
//! registration order, then updates of the columns that changed since the
//! last flush. Model event handlers run around every statement.

use crate::{ObjectState, Session, SessionEvent, Snapshot, primary_key_from};
use asupersync::{Cx, Outcome};
use sqlservice_core::{Connection, Dialect, Error, Instance, ModelEvent, ModelSchema, Value};
use std::time::Instant;

/// Counts of statements a flush executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl FlushResult {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl<C: Connection> Session<C> {
    /// Flush pending changes to the database.
    ///
    /// Executes INSERT, UPDATE and DELETE statements but does not commit.
    /// When a statement fails the work that was not yet written stays
    /// pending.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        match self.settle_dropped_scope(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeFlush) {
            return Outcome::Err(e);
        }

        if !self.has_pending_changes() {
            if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterFlush) {
                return Outcome::Err(e);
            }
            return Outcome::Ok(FlushResult::default());
        }

        if self.config.auto_begin && !self.in_transaction {
            match self.begin(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let started = Instant::now();
        let mut result = FlushResult::default();

        // 1. DELETEs, most recently registered first so children go before parents.
        let deletes = std::mem::take(&mut self.pending_delete);
        for (i, addr) in deletes.iter().enumerate().rev() {
            match self.flush_delete(cx, *addr).await {
                Outcome::Ok(n) => result.deleted += n,
                Outcome::Err(e) => {
                    self.pending_delete = deletes[..=i].to_vec();
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.pending_delete = deletes[..=i].to_vec();
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.pending_delete = deletes[..=i].to_vec();
                    return Outcome::Panicked(p);
                }
            }
        }

        // 2. INSERTs in registration order.
        let inserts = std::mem::take(&mut self.pending_new);
        for (i, addr) in inserts.iter().enumerate() {
            match self.flush_insert(cx, *addr).await {
                Outcome::Ok(n) => result.inserted += n,
                Outcome::Err(e) => {
                    self.pending_new = inserts[i..].to_vec();
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.pending_new = inserts[i..].to_vec();
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.pending_new = inserts[i..].to_vec();
                    return Outcome::Panicked(p);
                }
            }
        }

        // 3. UPDATEs of changed columns.
        for addr in self.dirty() {
            match self.flush_update(cx, addr).await {
                Outcome::Ok(n) => result.updated += n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        tracing::info!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            "flush complete"
        );

        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterFlush) {
            return Outcome::Err(e);
        }
        Outcome::Ok(result)
    }

    async fn flush_delete(&mut self, cx: &Cx, addr: usize) -> Outcome<usize, Error> {
        let Some(tracked) = self.objects.get(&addr) else {
            return Outcome::Ok(0);
        };
        if tracked.state != ObjectState::Deleted {
            return Outcome::Ok(0);
        }
        let instance = tracked.instance.clone();
        let schema = instance.schema();
        let pk = tracked
            .original
            .as_ref()
            .and_then(|original| primary_key_from(schema, original))
            .or_else(|| instance.primary_key_values());
        let Some(pk) = pk else {
            self.untrack(addr);
            return Outcome::Ok(0);
        };

        if let Err(e) = dispatch(&instance, ModelEvent::BeforeDelete) {
            return Outcome::Err(e);
        }
        let sql = delete_sql(self.connection.dialect(), schema);
        tracing::debug!(sql = %sql, "flush delete");
        match self.connection.execute(cx, &sql, &pk).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        self.untrack(addr);

        if let Err(e) = dispatch(&instance, ModelEvent::AfterDelete) {
            return Outcome::Err(e);
        }
        Outcome::Ok(1)
    }

    async fn flush_insert(&mut self, cx: &Cx, addr: usize) -> Outcome<usize, Error> {
        let Some(tracked) = self.objects.get(&addr) else {
            return Outcome::Ok(0);
        };
        if tracked.state != ObjectState::New {
            return Outcome::Ok(0);
        }
        let instance = tracked.instance.clone();
        let schema = instance.schema();

        if let Err(e) = dispatch(&instance, ModelEvent::BeforeInsert) {
            return Outcome::Err(e);
        }

        let (columns, params): (Vec<&'static str>, Vec<Value>) = instance
            .read()
            .set_values()
            .filter(|(column, value)| !(column.auto_increment && value.is_null()))
            .map(|(column, value)| (column.name, value.clone()))
            .unzip();
        let generated = schema
            .auto_increment_column()
            .filter(|column| !columns.contains(&column.name));

        let dialect = self.connection.dialect();
        let sql = insert_sql(dialect, schema, &columns);
        tracing::debug!(sql = %sql, "flush insert");

        if let Some(column) = generated {
            let id = match self.connection.insert(cx, &sql, &params).await {
                Outcome::Ok(id) => id,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if let Err(e) = instance.write().set_silent(column.name, id) {
                return Outcome::Err(e);
            }
        } else {
            match self.connection.execute(cx, &sql, &params).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let snapshot = instance.read().snapshot();
        if let Some(tracked) = self.objects.get_mut(&addr) {
            tracked.state = ObjectState::Persistent;
            tracked.original = Some(snapshot);
        }
        self.register_key(addr);

        if let Err(e) = dispatch(&instance, ModelEvent::AfterInsert) {
            return Outcome::Err(e);
        }
        Outcome::Ok(1)
    }

    async fn flush_update(&mut self, cx: &Cx, addr: usize) -> Outcome<usize, Error> {
        let Some(tracked) = self.objects.get(&addr) else {
            return Outcome::Ok(0);
        };
        let Some(original) = tracked.original.clone() else {
            return Outcome::Ok(0);
        };
        let instance = tracked.instance.clone();
        let schema = instance.schema();

        if let Err(e) = dispatch(&instance, ModelEvent::BeforeUpdate) {
            return Outcome::Err(e);
        }

        let Some((sql, params)) = update_statement(self.connection.dialect(), &instance, &original)
        else {
            return Outcome::Ok(0);
        };
        tracing::debug!(sql = %sql, table = schema.table(), "flush update");
        match self.connection.execute(cx, &sql, &params).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let snapshot = instance.read().snapshot();
        if let Some(tracked) = self.objects.get_mut(&addr) {
            tracked.original = Some(snapshot);
        }
        self.register_key(addr);

        if let Err(e) = dispatch(&instance, ModelEvent::AfterUpdate) {
            return Outcome::Err(e);
        }
        Outcome::Ok(1)
    }
}

/// Run the model handlers for `event` against the instance's record.
fn dispatch(instance: &Instance, event: ModelEvent) -> sqlservice_core::Result<()> {
    let schema = instance.schema();
    if !schema.events().has_listeners(event) {
        return Ok(());
    }
    let mut record = instance.write();
    schema.events().dispatch(event, &mut record)
}

/// `UPDATE` of the changed columns, keyed by the last flushed primary key.
fn update_statement(
    dialect: Dialect,
    instance: &Instance,
    original: &Snapshot,
) -> Option<(String, Vec<Value>)> {
    let schema = instance.schema();
    let record = instance.read();
    let changed = record.changed_since(original);
    if changed.is_empty() {
        return None;
    }
    let key = primary_key_from(schema, original).or_else(|| record.primary_key_values())?;

    let set_columns: Vec<&str> = changed.iter().map(|c| c.name).collect();
    let mut params: Vec<Value> = changed.iter().map(|c| record.value(c.name)).collect();
    params.extend(key);
    Some((update_sql(dialect, schema, &set_columns), params))
}

/// `SELECT * FROM t WHERE c1 = $1 AND ...`, optionally limited.
pub fn select_sql(
    dialect: Dialect,
    schema: &ModelSchema,
    columns: &[&str],
    limit: Option<usize>,
) -> String {
    let mut sql = format!("SELECT * FROM {}", dialect.quote_identifier(schema.table()));
    if !columns.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates(dialect, columns, 1));
    }
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    sql
}

pub fn insert_sql(dialect: Dialect, schema: &ModelSchema, columns: &[&str]) -> String {
    let table = dialect.quote_identifier(schema.table());
    if columns.is_empty() {
        return match dialect {
            Dialect::Mysql => format!("INSERT INTO {table} () VALUES ()"),
            Dialect::Postgres | Dialect::Sqlite => format!("INSERT INTO {table} DEFAULT VALUES"),
        };
    }
    let names: Vec<String> = columns.iter().map(|c| dialect.quote_identifier(c)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| dialect.placeholder(i)).collect();
    format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        names.join(", "),
        placeholders.join(", ")
    )
}

/// `UPDATE t SET ... WHERE <primary key>`; set values come first in the parameters.
pub fn update_sql(dialect: Dialect, schema: &ModelSchema, set_columns: &[&str]) -> String {
    let assignments: Vec<String> = set_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = {}", dialect.quote_identifier(c), dialect.placeholder(i + 1)))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {}",
        dialect.quote_identifier(schema.table()),
        assignments.join(", "),
        predicates(dialect, schema.primary_key(), set_columns.len() + 1)
    )
}

pub fn delete_sql(dialect: Dialect, schema: &ModelSchema) -> String {
    format!(
        "DELETE FROM {} WHERE {}",
        dialect.quote_identifier(schema.table()),
        predicates(dialect, schema.primary_key(), 1)
    )
}

/// Multi-row `INSERT INTO t (...) VALUES (...), (...)`; `columns` must not be empty.
pub fn insert_rows_sql(dialect: Dialect, schema: &ModelSchema, columns: &[&str], rows: usize) -> String {
    let names: Vec<String> = columns.iter().map(|c| dialect.quote_identifier(c)).collect();
    let width = columns.len();
    let tuples: Vec<String> = (0..rows)
        .map(|row| {
            let placeholders: Vec<String> = (1..=width)
                .map(|i| dialect.placeholder(row * width + i))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        dialect.quote_identifier(schema.table()),
        names.join(", "),
        tuples.join(", ")
    )
}

/// `DELETE FROM t WHERE <primary key> IN (...)` for `rows` keys.
pub fn delete_in_sql(dialect: Dialect, schema: &ModelSchema, rows: usize) -> String {
    format!(
        "DELETE FROM {} WHERE {}",
        dialect.quote_identifier(schema.table()),
        in_list(dialect, schema.primary_key(), rows, 1)
    )
}

/// `UPDATE t SET ... WHERE <key columns> IN (...)`; set values come first in
/// the parameters, then the flattened keys.
pub fn update_in_sql(
    dialect: Dialect,
    schema: &ModelSchema,
    set_columns: &[&str],
    key_columns: &[&str],
    rows: usize,
) -> String {
    let assignments: Vec<String> = set_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = {}", dialect.quote_identifier(c), dialect.placeholder(i + 1)))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {}",
        dialect.quote_identifier(schema.table()),
        assignments.join(", "),
        in_list(dialect, key_columns, rows, set_columns.len() + 1)
    )
}

/// `"a" IN ($1, $2)`, or `("a", "b") IN (($1, $2), ($3, $4))` for composite keys.
fn in_list(dialect: Dialect, columns: &[&str], rows: usize, first: usize) -> String {
    let width = columns.len();
    let group = |values: Vec<String>| {
        if width == 1 {
            values.join(", ")
        } else {
            format!("({})", values.join(", "))
        }
    };
    let target = group(columns.iter().map(|c| dialect.quote_identifier(c)).collect());
    let keys: Vec<String> = (0..rows)
        .map(|row| group((0..width).map(|i| dialect.placeholder(first + row * width + i)).collect()))
        .collect();
    format!("{target} IN ({})", keys.join(", "))
}

fn predicates(dialect: Dialect, columns: &[&str], first: usize) -> String {
    columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = {}", dialect.quote_identifier(c), dialect.placeholder(first + i)))
        .collect::<Vec<_>>()
        .join(" AND ")
}
