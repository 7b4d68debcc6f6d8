//! In-memory [`Connection`] for tests.
//!
//! `MemoryConnection` understands the statements the session renders for the
//! Postgres dialect (`SELECT * FROM`, single and multi-row `INSERT`, `UPDATE`
//! and `DELETE` filtered by equality predicates or a key `IN` list, and
//! transaction control). Tables are declared from
//! model schemas, `BEGIN` snapshots them and `ROLLBACK` restores the snapshot.
//! Primary key and unique columns are enforced with SQLSTATE `23505`.

use asupersync::{Cx, Outcome};
use sqlservice_core::{
    Connection, Error, ModelSchema, QueryError, QueryErrorKind, Result, Row, SqlType, Value,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

type StoredRow = BTreeMap<String, Value>;

#[derive(Debug, Clone)]
struct Table {
    columns: Vec<(String, SqlType)>,
    primary_key: Vec<String>,
    unique: Vec<String>,
    auto_increment: Option<String>,
    rows: Vec<StoredRow>,
}

impl Table {
    fn from_schema(schema: &ModelSchema) -> Self {
        Self {
            columns: schema
                .columns()
                .iter()
                .map(|c| (c.name.to_string(), c.sql_type))
                .collect(),
            primary_key: schema.primary_key().iter().map(|s| (*s).to_string()).collect(),
            unique: schema
                .columns()
                .iter()
                .filter(|c| c.unique)
                .map(|c| c.name.to_string())
                .collect(),
            auto_increment: schema.auto_increment_column().map(|c| c.name.to_string()),
            rows: Vec::new(),
        }
    }

    fn sql_type(&self, column: &str) -> Option<SqlType> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, ty)| *ty)
    }

    fn next_id(&self, column: &str) -> i64 {
        self.rows
            .iter()
            .filter_map(|row| row.get(column).and_then(Value::as_i64))
            .max()
            .unwrap_or(0)
            + 1
    }

    fn to_row(&self, stored: &StoredRow) -> Row {
        let names = self.columns.iter().map(|(name, _)| name.clone()).collect();
        let values = self
            .columns
            .iter()
            .map(|(name, _)| stored.get(name).cloned().unwrap_or(Value::Null))
            .collect();
        Row::new(names, values)
    }

    /// Find a row other than `skip` that collides with `candidate` on a key.
    fn conflict(&self, candidate: &StoredRow, skip: Option<usize>) -> Option<String> {
        let keys = std::iter::once(self.primary_key.clone())
            .chain(self.unique.iter().map(|c| vec![c.clone()]));
        for key in keys {
            let values: Vec<&Value> = key
                .iter()
                .filter_map(|c| candidate.get(c).filter(|v| !v.is_null()))
                .collect();
            if values.len() != key.len() || key.is_empty() {
                continue;
            }
            let clash = self.rows.iter().enumerate().any(|(i, row)| {
                Some(i) != skip
                    && key
                        .iter()
                        .zip(&values)
                        .all(|(c, v)| row.get(c).is_some_and(|r| same(r, v)))
            });
            if clash {
                return Some(key.join(", "));
            }
        }
        None
    }
}

/// Counters of the statements a [`MemoryConnection`] has executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub statements: usize,
    pub queries: usize,
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Table>,
    snapshot: Option<BTreeMap<String, Table>>,
    stats: MemoryStats,
    log: Vec<String>,
    fail_on: Option<String>,
}

enum Applied {
    Rows(Vec<Row>),
    Affected(u64),
    Inserted(i64),
}

/// Shared in-memory database. Clones see the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection with one empty table per schema.
    pub fn with_models(models: &[&ModelSchema]) -> Self {
        let conn = Self::new();
        for schema in models {
            conn.register(schema);
        }
        conn
    }

    /// Declare (or reset) the table backing `schema`.
    pub fn register(&self, schema: &ModelSchema) {
        self.lock()
            .tables
            .insert(schema.table().to_string(), Table::from_schema(schema));
    }

    /// Insert rows directly, bypassing statement counters.
    ///
    /// `rows` is a JSON array of objects whose values are converted to the
    /// declared column types.
    pub fn seed(&self, table: &str, rows: &serde_json::Value) -> Result<()> {
        let mut state = self.lock();
        let Some(target) = state.tables.get_mut(table) else {
            return Err(missing_table(table));
        };
        let items = rows.as_array().map_or(&[][..], Vec::as_slice);
        for item in items {
            let Some(object) = item.as_object() else {
                return Err(Error::Custom(format!("seed rows for '{table}' must be objects")));
            };
            let mut row = StoredRow::new();
            for (name, json) in object {
                let Some(sql_type) = target.sql_type(name) else {
                    return Err(Error::Custom(format!("table '{table}' has no column '{name}'")));
                };
                row.insert(name.clone(), Value::from_json(json, sql_type, name)?);
            }
            target.rows.push(row);
        }
        Ok(())
    }

    /// Current rows of `table` in storage order.
    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// First row of `table` whose `column` equals `value`.
    pub fn find(&self, table: &str, column: &str, value: impl Into<Value>) -> Option<StoredRow> {
        let value = value.into();
        self.lock().tables.get(table).and_then(|t| {
            t.rows
                .iter()
                .find(|row| row.get(column).is_some_and(|v| same(v, &value)))
                .cloned()
        })
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats
    }

    /// Every statement executed so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Forget the statement log and counters, keeping table contents.
    pub fn reset_stats(&self) {
        let mut state = self.lock();
        state.stats = MemoryStats::default();
        state.log.clear();
    }

    /// Make the next statement starting with `prefix` fail with a database error.
    pub fn fail_next(&self, prefix: &str) {
        self.lock().fail_on = Some(prefix.to_string());
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().snapshot.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self, sql: &str, params: &[Value]) -> Result<Applied> {
        let mut state = self.lock();
        state.stats.statements += 1;
        state.log.push(sql.to_string());
        if state
            .fail_on
            .as_deref()
            .is_some_and(|prefix| sql.starts_with(prefix))
        {
            state.fail_on = None;
            let mut err = QueryError::new(QueryErrorKind::Database, "injected failure");
            err.sql = Some(sql.to_string());
            return Err(Error::Query(err));
        }
        apply(&mut state, sql, params).map_err(|e| match e {
            Error::Query(mut q) => {
                q.sql = Some(sql.to_string());
                Error::Query(q)
            }
            other => other,
        })
    }
}

fn apply(state: &mut MemoryState, sql: &str, params: &[Value]) -> Result<Applied> {
    let upper = sql.trim_start().to_ascii_uppercase();
    if upper.starts_with("BEGIN") || upper.starts_with("START TRANSACTION") {
        if state.snapshot.is_some() {
            return Err(query_error(
                QueryErrorKind::Database,
                "there is already a transaction in progress",
            ));
        }
        state.stats.begins += 1;
        state.snapshot = Some(state.tables.clone());
        return Ok(Applied::Affected(0));
    }
    if upper.starts_with("COMMIT") {
        state.stats.commits += 1;
        state.snapshot = None;
        return Ok(Applied::Affected(0));
    }
    if upper.starts_with("ROLLBACK") {
        state.stats.rollbacks += 1;
        if let Some(snapshot) = state.snapshot.take() {
            state.tables = snapshot;
        }
        return Ok(Applied::Affected(0));
    }
    if upper.starts_with("SELECT") {
        state.stats.queries += 1;
        return select(state, sql, params).map(Applied::Rows);
    }
    if upper.starts_with("INSERT") {
        state.stats.inserts += 1;
        return insert(state, sql, params).map(|(rows, id)| {
            if rows == 1 {
                Applied::Inserted(id)
            } else {
                Applied::Affected(rows)
            }
        });
    }
    if upper.starts_with("UPDATE") {
        state.stats.updates += 1;
        return update(state, sql, params).map(Applied::Affected);
    }
    if upper.starts_with("DELETE") {
        state.stats.deletes += 1;
        return delete(state, sql, params).map(Applied::Affected);
    }
    // SET TRANSACTION, DDL and anything else are accepted as no-ops.
    Ok(Applied::Affected(0))
}

fn select(state: &MemoryState, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let (head, rest) = split_keyword(sql, " WHERE ");
    let table = table_of(state, head)?;

    let mut tail = rest.unwrap_or(head);
    let mut limit = None;
    if let (before, Some(n)) = split_keyword(tail, " LIMIT ") {
        limit = n.trim().parse::<usize>().ok();
        tail = before;
    }
    let mut order_by = None;
    if let (before, Some(column)) = split_keyword(tail, " ORDER BY ") {
        order_by = quoted(column).into_iter().next();
        tail = before;
    }
    let filter = Filter::parse(rest.map(|_| tail), params);

    let mut matching: Vec<&StoredRow> = table
        .rows
        .iter()
        .filter(|row| filter.matches(row))
        .collect();
    if let Some(column) = order_by {
        matching.sort_by(|a, b| compare(a.get(&column), b.get(&column)));
    }
    Ok(matching
        .into_iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(|row| table.to_row(row))
        .collect())
}

/// Returns the number of rows inserted and the last generated (or given) key.
fn insert(state: &mut MemoryState, sql: &str, params: &[Value]) -> Result<(u64, i64)> {
    let names = quoted(sql);
    let Some((table_name, columns)) = names.split_first() else {
        return Err(query_error(QueryErrorKind::Syntax, "INSERT without a table"));
    };
    let Some(table) = state.tables.get_mut(table_name) else {
        return Err(missing_table(table_name));
    };
    if let Some(column) = columns.iter().find(|c| table.sql_type(c).is_none()) {
        return Err(missing_column(table_name, column));
    }

    let groups: Vec<&[Value]> = if columns.is_empty() {
        vec![&params[..0]]
    } else {
        params.chunks(columns.len()).collect()
    };
    // A failing row undoes the rows of the same statement.
    let before = table.rows.len();
    let mut last_id = 0;
    for group in groups {
        let mut row = StoredRow::new();
        for (column, value) in columns.iter().zip(group) {
            row.insert(column.clone(), value.clone());
        }

        let mut generated = None;
        if let Some(auto) = table.auto_increment.clone() {
            if row.get(&auto).is_none_or(Value::is_null) {
                let id = table.next_id(&auto);
                row.insert(auto.clone(), Value::BigInt(id));
                generated = Some(id);
            }
        }

        if let Some(key) = table.conflict(&row, None) {
            table.rows.truncate(before);
            return Err(unique_violation(table_name, &key));
        }

        last_id = generated.unwrap_or_else(|| {
            table
                .primary_key
                .first()
                .and_then(|pk| row.get(pk))
                .and_then(Value::as_i64)
                .unwrap_or(0)
        });
        table.rows.push(row);
    }
    Ok(((table.rows.len() - before) as u64, last_id))
}

fn update(state: &mut MemoryState, sql: &str, params: &[Value]) -> Result<u64> {
    let (head, rest) = split_keyword(sql, " WHERE ");
    let names = quoted(head);
    let Some((table_name, set_columns)) = names.split_first() else {
        return Err(query_error(QueryErrorKind::Syntax, "UPDATE without a table"));
    };
    let Some(table) = state.tables.get_mut(table_name) else {
        return Err(missing_table(table_name));
    };
    let (set_params, where_params) = params.split_at(set_columns.len().min(params.len()));
    let filter = Filter::parse(rest, where_params);

    let targets: Vec<usize> = table
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| filter.matches(row))
        .map(|(i, _)| i)
        .collect();

    for &i in &targets {
        let mut candidate = table.rows[i].clone();
        for (column, value) in set_columns.iter().zip(set_params) {
            if table.sql_type(column).is_none() {
                return Err(missing_column(table_name, column));
            }
            candidate.insert(column.clone(), value.clone());
        }
        if let Some(key) = table.conflict(&candidate, Some(i)) {
            return Err(unique_violation(table_name, &key));
        }
        table.rows[i] = candidate;
    }
    Ok(targets.len() as u64)
}

fn delete(state: &mut MemoryState, sql: &str, params: &[Value]) -> Result<u64> {
    let (head, rest) = split_keyword(sql, " WHERE ");
    let Some(table_name) = quoted(head).into_iter().next() else {
        return Err(query_error(QueryErrorKind::Syntax, "DELETE without a table"));
    };
    let Some(table) = state.tables.get_mut(&table_name) else {
        return Err(missing_table(&table_name));
    };
    let filter = Filter::parse(rest, params);
    let before = table.rows.len();
    table.rows.retain(|row| !filter.matches(row));
    Ok((before - table.rows.len()) as u64)
}

fn table_of<'a>(state: &'a MemoryState, head: &str) -> Result<&'a Table> {
    let (_, from) = split_keyword(head, " FROM ");
    let name = from
        .and_then(|f| quoted(f).into_iter().next())
        .ok_or_else(|| query_error(QueryErrorKind::Syntax, "SELECT without FROM"))?;
    state.tables.get(&name).ok_or_else(|| missing_table(&name))
}

fn split_keyword<'a>(sql: &'a str, keyword: &str) -> (&'a str, Option<&'a str>) {
    match sql.find(keyword) {
        Some(at) => (&sql[..at], Some(&sql[at + keyword.len()..])),
        None => (sql, None),
    }
}

/// Double-quoted identifiers in order of appearance.
fn quoted(fragment: &str) -> Vec<String> {
    fragment
        .split('"')
        .skip(1)
        .step_by(2)
        .map(str::to_string)
        .collect()
}

/// Parsed `WHERE` clause.
enum Filter<'a> {
    /// `"a" = $1 AND "b" = $2`; empty matches every row.
    Equal(Vec<(String, &'a Value)>),
    /// `"a" IN ($1, $2)` or `("a", "b") IN (($1, $2), ($3, $4))`.
    In(Vec<String>, &'a [Value]),
}

impl<'a> Filter<'a> {
    fn parse(clause: Option<&str>, params: &'a [Value]) -> Self {
        let Some(clause) = clause else {
            return Filter::Equal(Vec::new());
        };
        match split_keyword(clause, " IN ") {
            (columns, Some(_)) => Filter::In(quoted(columns), params),
            (_, None) => Filter::Equal(quoted(clause).into_iter().zip(params.iter()).collect()),
        }
    }

    fn matches(&self, row: &StoredRow) -> bool {
        let equal = |column: &String, value: &Value| row.get(column).is_some_and(|v| same(v, value));
        match self {
            Filter::Equal(pairs) => pairs.iter().all(|(column, value)| equal(column, *value)),
            Filter::In(columns, params) if !columns.is_empty() => params
                .chunks(columns.len())
                .any(|key| columns.iter().zip(key).all(|(column, value)| equal(column, value))),
            Filter::In(..) => false,
        }
    }
}

fn same(a: &Value, b: &Value) -> bool {
    crate::identity::same_value(a, b)
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    let key = |v: Option<&Value>| {
        v.and_then(|v| {
            v.as_i64()
                .map(|n| format!("{n:020}"))
                .or_else(|| v.as_str().map(str::to_string))
        })
    };
    key(a).cmp(&key(b))
}

fn query_error(kind: QueryErrorKind, message: &str) -> Error {
    Error::Query(QueryError::new(kind, message))
}

fn missing_table(table: &str) -> Error {
    query_error(
        QueryErrorKind::Database,
        &format!("relation \"{table}\" does not exist"),
    )
}

fn missing_column(table: &str, column: &str) -> Error {
    query_error(
        QueryErrorKind::Database,
        &format!("column \"{column}\" of relation \"{table}\" does not exist"),
    )
}

fn unique_violation(table: &str, key: &str) -> Error {
    let mut err = QueryError::new(
        QueryErrorKind::Constraint,
        format!("duplicate key value violates unique constraint on \"{table}\""),
    );
    err.sqlstate = Some("23505".to_string());
    err.detail = Some(format!("Key ({key}) already exists."));
    Error::Query(err)
}

impl Connection for MemoryConnection {
    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.run(sql, params);
        async move {
            match result {
                Ok(Applied::Rows(rows)) => Outcome::Ok(rows),
                Ok(Applied::Affected(_) | Applied::Inserted(_)) => Outcome::Ok(Vec::new()),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.run(sql, params);
        async move {
            match result {
                Ok(Applied::Rows(rows)) => Outcome::Ok(rows.len() as u64),
                Ok(Applied::Affected(n)) => Outcome::Ok(n),
                Ok(Applied::Inserted(_)) => Outcome::Ok(1),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let result = self.run(sql, params);
        async move {
            match result {
                Ok(Applied::Inserted(id)) => Outcome::Ok(id),
                Ok(Applied::Rows(_) | Applied::Affected(_)) => Outcome::Ok(0),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }

    fn close(self, _cx: &Cx) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use sqlservice_core::Column;
    use std::sync::LazyLock;

    static ITEMS: LazyLock<ModelSchema> = LazyLock::new(|| {
        ModelSchema::builder("Item", "items")
            .column(Column::new("id", SqlType::BigInt).primary_key().auto_increment())
            .column(Column::new("code", SqlType::Text).unique())
            .column(Column::new("qty", SqlType::Integer))
            .build()
            .unwrap()
    });

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    #[test]
    fn interprets_crud_statements() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MemoryConnection::with_models(&[&ITEMS]);

        rt.block_on(async {
            let id = unwrap_outcome(
                conn.insert(
                    &cx,
                    r#"INSERT INTO "items" ("code", "qty") VALUES ($1, $2)"#,
                    &[Value::from("a"), Value::Int(1)],
                )
                .await,
            );
            assert_eq!(id, 1);
            let updated = unwrap_outcome(
                conn.execute(
                    &cx,
                    r#"UPDATE "items" SET "qty" = $1 WHERE "id" = $2"#,
                    &[Value::Int(5), Value::BigInt(1)],
                )
                .await,
            );
            assert_eq!(updated, 1);
            let rows = unwrap_outcome(
                conn.query(
                    &cx,
                    r#"SELECT * FROM "items" WHERE "code" = $1 LIMIT 1"#,
                    &[Value::from("a")],
                )
                .await,
            );
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].get_by_name("qty"), Some(&Value::Int(5)));
            let deleted = unwrap_outcome(
                conn.execute(
                    &cx,
                    r#"DELETE FROM "items" WHERE "id" = $1"#,
                    &[Value::BigInt(1)],
                )
                .await,
            );
            assert_eq!(deleted, 1);
        });

        let stats = conn.stats();
        assert_eq!((stats.inserts, stats.updates, stats.deletes), (1, 1, 1));
        assert_eq!(stats.queries, 1);
        assert_eq!(conn.row_count("items"), 0);
    }

    #[test]
    fn rollback_restores_snapshot_and_unique_keys_are_enforced() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MemoryConnection::with_models(&[&ITEMS]);
        conn.seed("items", &serde_json::json!([{"id": 1, "code": "a"}]))
            .unwrap();

        rt.block_on(async {
            unwrap_outcome(conn.execute(&cx, "BEGIN", &[]).await);
            let dup = conn
                .insert(
                    &cx,
                    r#"INSERT INTO "items" ("code") VALUES ($1)"#,
                    &[Value::from("a")],
                )
                .await;
            match dup {
                Outcome::Err(Error::Query(e)) => {
                    assert!(e.is_unique_violation());
                    assert!(e.sql.is_some());
                }
                other => std::panic::panic_any(format!("expected violation: {other:?}")),
            }
            unwrap_outcome(
                conn.insert(
                    &cx,
                    r#"INSERT INTO "items" ("code") VALUES ($1)"#,
                    &[Value::from("b")],
                )
                .await,
            );
            assert_eq!(conn.row_count("items"), 2);
            unwrap_outcome(conn.execute(&cx, "ROLLBACK", &[]).await);
        });

        assert_eq!(conn.row_count("items"), 1);
        assert!(conn.find("items", "code", "b").is_none());
        assert_eq!(conn.stats().rollbacks, 1);
        assert!(!conn.in_transaction());
    }

    #[test]
    fn injected_failures_fire_once() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MemoryConnection::with_models(&[&ITEMS]);
        conn.fail_next("COMMIT");

        rt.block_on(async {
            assert!(matches!(
                conn.execute(&cx, "COMMIT", &[]).await,
                Outcome::Err(_)
            ));
            assert!(matches!(
                conn.execute(&cx, "COMMIT", &[]).await,
                Outcome::Ok(0)
            ));
        });
        assert_eq!(conn.statements(), vec!["COMMIT", "COMMIT"]);
    }

    #[test]
    fn multi_row_inserts_and_key_lists() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MemoryConnection::with_models(&[&ITEMS]);

        rt.block_on(async {
            let inserted = unwrap_outcome(
                conn.execute(
                    &cx,
                    r#"INSERT INTO "items" ("code", "qty") VALUES ($1, $2), ($3, $4), ($5, $6)"#,
                    &[
                        Value::from("a"),
                        Value::Int(1),
                        Value::from("b"),
                        Value::Int(2),
                        Value::from("c"),
                        Value::Int(3),
                    ],
                )
                .await,
            );
            assert_eq!(inserted, 3);

            let updated = unwrap_outcome(
                conn.execute(
                    &cx,
                    r#"UPDATE "items" SET "qty" = $1 WHERE "id" IN ($2, $3)"#,
                    &[Value::Int(9), Value::BigInt(1), Value::BigInt(3)],
                )
                .await,
            );
            assert_eq!(updated, 2);

            let deleted = unwrap_outcome(
                conn.execute(
                    &cx,
                    r#"DELETE FROM "items" WHERE "id" IN ($1, $2)"#,
                    &[Value::BigInt(2), Value::BigInt(3)],
                )
                .await,
            );
            assert_eq!(deleted, 2);

            let dup = conn
                .execute(
                    &cx,
                    r#"INSERT INTO "items" ("code") VALUES ($1), ($2)"#,
                    &[Value::from("d"), Value::from("a")],
                )
                .await;
            assert!(matches!(dup, Outcome::Err(Error::Query(ref e)) if e.is_unique_violation()));
        });

        assert_eq!(conn.row_count("items"), 1);
        let left = conn.find("items", "id", 1_i64).expect("row 1");
        assert_eq!(left.get("qty"), Some(&Value::Int(9)));
        assert!(conn.find("items", "code", "d").is_none());
    }

    #[test]
    fn select_orders_and_limits() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MemoryConnection::with_models(&[&ITEMS]);
        conn.seed(
            "items",
            &serde_json::json!([{"id": 3, "code": "c"}, {"id": 1, "code": "a"}, {"id": 2}]),
        )
        .unwrap();

        rt.block_on(async {
            let rows = unwrap_outcome(
                conn.query(&cx, r#"SELECT * FROM "items" ORDER BY "id" LIMIT 2"#, &[])
                    .await,
            );
            let ids: Vec<_> = rows
                .iter()
                .map(|r| r.get_by_name("id").and_then(Value::as_i64))
                .collect();
            assert_eq!(ids, vec![Some(1), Some(2)]);
        });
    }
}
