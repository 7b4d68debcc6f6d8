//! Bulk statements: delete by key, multi-row inserts and grouped updates.
//!
//! These write rows directly instead of going through the unit of work.
//! Model event handlers do not run and inserted rows are not tracked. Every
//! call validates all of its input before `BEGIN`, then runs in its own
//! transaction scope: it nests inside an open scope and commits on its own
//! otherwise.

use crate::flush::{delete_in_sql, insert_rows_sql, insert_sql, update_in_sql};
use crate::transaction::ScopeOptions;
use crate::{ObjectKey, Session};
use asupersync::{Cx, Outcome};
use sqlservice_core::{
    Connection, Error, IdentityError, Instance, ModelSchema, SchemaError, SchemaErrorKind,
    ValidationError, ValidationErrorKind, Value,
};
use std::collections::BTreeMap;

type JsonObject = serde_json::Map<String, serde_json::Value>;

/// A row to delete with [`Session::destroy`].
#[derive(Debug, Clone)]
pub enum DestroyTarget {
    /// The instance's own model decides the table.
    Instance(Instance),
    /// Primary key values in declaration order.
    Key(Vec<Value>),
    /// JSON object holding every primary key column; other keys are ignored.
    Mapping(serde_json::Value),
}

impl From<Instance> for DestroyTarget {
    fn from(instance: Instance) -> Self {
        DestroyTarget::Instance(instance)
    }
}

impl From<&Instance> for DestroyTarget {
    fn from(instance: &Instance) -> Self {
        DestroyTarget::Instance(instance.clone())
    }
}

impl From<Value> for DestroyTarget {
    fn from(value: Value) -> Self {
        DestroyTarget::Key(vec![value])
    }
}

impl From<Vec<Value>> for DestroyTarget {
    fn from(values: Vec<Value>) -> Self {
        DestroyTarget::Key(values)
    }
}

impl From<serde_json::Value> for DestroyTarget {
    fn from(json: serde_json::Value) -> Self {
        DestroyTarget::Mapping(json)
    }
}

/// Primary keys to delete from one table.
#[derive(Debug)]
struct KeyBatch {
    schema: &'static ModelSchema,
    keys: Vec<Vec<Value>>,
}

/// Validated insert rows; every row holds a value for each column.
#[derive(Debug, Default)]
struct InsertRows {
    columns: Vec<&'static str>,
    rows: Vec<Vec<Value>>,
}

/// Rows that receive the same new values.
#[derive(Debug)]
struct UpdateGroup {
    set: Vec<(&'static str, Value)>,
    keys: Vec<Vec<Value>>,
}

impl<C: Connection> Session<C> {
    /// Delete rows given as instances, primary key values or key mappings.
    ///
    /// Targets are grouped by model and each model gets one
    /// `DELETE ... WHERE <key> IN (...)`. `model` names the table for targets
    /// that are not instances. Instances without a complete primary key are
    /// skipped. Tracked instances whose rows are deleted stop being tracked.
    /// Returns the number of rows the database reports as deleted.
    #[tracing::instrument(level = "debug", skip_all, fields(model = model.map_or("-", ModelSchema::name)))]
    pub async fn destroy<I>(
        &mut self,
        cx: &Cx,
        targets: I,
        model: Option<&'static ModelSchema>,
    ) -> Outcome<u64, Error>
    where
        I: IntoIterator,
        I::Item: Into<DestroyTarget>,
    {
        let batches = match key_batches(targets, model) {
            Ok(batches) => batches,
            Err(e) => return Outcome::Err(e),
        };
        if batches.is_empty() {
            return Outcome::Ok(0);
        }
        self.transaction(cx, ScopeOptions::default(), move |s, cx| {
            Box::pin(async move { s.delete_batches(cx, batches).await })
        })
        .await
    }

    /// Insert `mappings` with a single multi-row `INSERT`.
    ///
    /// Every mapping must be a JSON object setting the same columns.
    /// Returns the number of rows inserted.
    #[tracing::instrument(level = "debug", skip(self, cx, schema, mappings), fields(table = schema.table(), rows = mappings.len()))]
    pub async fn bulk_insert(
        &mut self,
        cx: &Cx,
        schema: &'static ModelSchema,
        mappings: &[serde_json::Value],
    ) -> Outcome<u64, Error> {
        self.insert_mappings(cx, schema, mappings, true).await
    }

    /// Like [`bulk_insert`](Self::bulk_insert), with one `INSERT` per mapping.
    #[tracing::instrument(level = "debug", skip(self, cx, schema, mappings), fields(table = schema.table(), rows = mappings.len()))]
    pub async fn bulk_insert_many(
        &mut self,
        cx: &Cx,
        schema: &'static ModelSchema,
        mappings: &[serde_json::Value],
    ) -> Outcome<u64, Error> {
        self.insert_mappings(cx, schema, mappings, false).await
    }

    /// Update rows identified by `key_columns`, one `UPDATE` per distinct
    /// set of new values.
    ///
    /// Each mapping holds the key columns plus the values to write. Mappings
    /// that write the same values share one `UPDATE ... WHERE <key> IN (...)`.
    /// Returns the number of rows the database reports as updated.
    #[tracing::instrument(level = "debug", skip(self, cx, schema, mappings), fields(table = schema.table(), rows = mappings.len()))]
    pub async fn bulk_common_update(
        &mut self,
        cx: &Cx,
        schema: &'static ModelSchema,
        key_columns: &[&str],
        mappings: &[serde_json::Value],
    ) -> Outcome<u64, Error> {
        let keys = match key_columns_of(schema, key_columns) {
            Ok(keys) => keys,
            Err(e) => return Outcome::Err(e),
        };
        let groups = match update_groups(schema, &keys, mappings) {
            Ok(groups) => groups,
            Err(e) => return Outcome::Err(e),
        };
        if groups.is_empty() {
            return Outcome::Ok(0);
        }
        self.transaction(cx, ScopeOptions::default(), move |s, cx| {
            Box::pin(async move { s.update_grouped(cx, schema, &keys, &groups).await })
        })
        .await
    }

    /// Write only what differs between `mappings` and the rows they replace.
    ///
    /// `previous` holds the current rows as mappings. A mapping whose key is
    /// not among them is inserted with [`bulk_insert`](Self::bulk_insert).
    /// One whose key is found is reduced to its changed values (plus the
    /// key) and written with [`bulk_common_update`](Self::bulk_common_update);
    /// unchanged mappings are skipped. Returns the number of rows written.
    #[tracing::instrument(level = "debug", skip_all, fields(table = schema.table(), rows = mappings.len()))]
    pub async fn bulk_diff_update(
        &mut self,
        cx: &Cx,
        schema: &'static ModelSchema,
        key_columns: &[&str],
        previous: &[serde_json::Value],
        mappings: &[serde_json::Value],
    ) -> Outcome<u64, Error> {
        let keys = match key_columns_of(schema, key_columns) {
            Ok(keys) => keys,
            Err(e) => return Outcome::Err(e),
        };
        let (updates, inserts) = match split_changes(schema, &keys, previous, mappings) {
            Ok(split) => split,
            Err(e) => return Outcome::Err(e),
        };
        let groups = match update_groups(schema, &keys, &updates) {
            Ok(groups) => groups,
            Err(e) => return Outcome::Err(e),
        };
        let rows = match insert_rows(schema, &inserts) {
            Ok(rows) => rows,
            Err(e) => return Outcome::Err(e),
        };
        tracing::debug!(updates = updates.len(), inserts = inserts.len(), "diff computed");
        if groups.is_empty() && rows.rows.is_empty() {
            return Outcome::Ok(0);
        }
        self.transaction(cx, ScopeOptions::default(), move |s, cx| {
            Box::pin(async move {
                let updated = match s.update_grouped(cx, schema, &keys, &groups).await {
                    Outcome::Ok(n) => n,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                match s.insert_validated(cx, schema, &rows, true).await {
                    Outcome::Ok(inserted) => Outcome::Ok(updated + inserted),
                    other => other,
                }
            })
        })
        .await
    }

    async fn insert_mappings(
        &mut self,
        cx: &Cx,
        schema: &'static ModelSchema,
        mappings: &[serde_json::Value],
        multi_row: bool,
    ) -> Outcome<u64, Error> {
        let rows = match insert_rows(schema, mappings) {
            Ok(rows) => rows,
            Err(e) => return Outcome::Err(e),
        };
        if rows.rows.is_empty() {
            return Outcome::Ok(0);
        }
        self.transaction(cx, ScopeOptions::default(), move |s, cx| {
            Box::pin(async move { s.insert_validated(cx, schema, &rows, multi_row).await })
        })
        .await
    }

    async fn insert_validated(
        &mut self,
        cx: &Cx,
        schema: &'static ModelSchema,
        rows: &InsertRows,
        multi_row: bool,
    ) -> Outcome<u64, Error> {
        if rows.rows.is_empty() {
            return Outcome::Ok(0);
        }
        let dialect = self.connection.dialect();
        if multi_row {
            let sql = insert_rows_sql(dialect, schema, &rows.columns, rows.rows.len());
            let params: Vec<Value> = rows.rows.iter().flatten().cloned().collect();
            tracing::debug!(sql = %sql, rows = rows.rows.len(), "bulk insert");
            return self.connection.execute(cx, &sql, &params).await;
        }

        let sql = insert_sql(dialect, schema, &rows.columns);
        tracing::debug!(sql = %sql, rows = rows.rows.len(), "bulk insert, one statement per row");
        let mut inserted = 0;
        for params in &rows.rows {
            match self.connection.execute(cx, &sql, params).await {
                Outcome::Ok(n) => inserted += n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(inserted)
    }

    async fn update_grouped(
        &mut self,
        cx: &Cx,
        schema: &'static ModelSchema,
        key_columns: &[&'static str],
        groups: &[UpdateGroup],
    ) -> Outcome<u64, Error> {
        let dialect = self.connection.dialect();
        let mut updated = 0;
        for group in groups {
            let set_columns: Vec<&str> = group.set.iter().map(|(name, _)| *name).collect();
            let sql = update_in_sql(dialect, schema, &set_columns, key_columns, group.keys.len());
            let params: Vec<Value> = group
                .set
                .iter()
                .map(|(_, value)| value.clone())
                .chain(group.keys.iter().flatten().cloned())
                .collect();
            tracing::debug!(sql = %sql, rows = group.keys.len(), "bulk update");
            match self.connection.execute(cx, &sql, &params).await {
                Outcome::Ok(n) => updated += n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(updated)
    }

    async fn delete_batches(&mut self, cx: &Cx, batches: Vec<KeyBatch>) -> Outcome<u64, Error> {
        let dialect = self.connection.dialect();
        let mut deleted = 0;
        for batch in batches {
            let sql = delete_in_sql(dialect, batch.schema, batch.keys.len());
            let params: Vec<Value> = batch.keys.iter().flatten().cloned().collect();
            tracing::debug!(sql = %sql, rows = batch.keys.len(), "bulk delete");
            match self.connection.execute(cx, &sql, &params).await {
                Outcome::Ok(n) => deleted += n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            for key in &batch.keys {
                let object_key = ObjectKey::from_pk(batch.schema, key);
                if let Some(addr) = self.identity_map.get(&object_key).copied() {
                    self.untrack(addr);
                }
            }
        }
        Outcome::Ok(deleted)
    }
}

fn key_batches<I>(
    targets: I,
    model: Option<&'static ModelSchema>,
) -> sqlservice_core::Result<Vec<KeyBatch>>
where
    I: IntoIterator,
    I::Item: Into<DestroyTarget>,
{
    let mut batches: Vec<KeyBatch> = Vec::new();
    for (index, target) in targets.into_iter().enumerate() {
        let (schema, key) = match target.into() {
            DestroyTarget::Instance(instance) => {
                let Some(key) = instance.primary_key_values() else {
                    tracing::debug!(index, model = instance.schema().name(), "no primary key, skipped");
                    continue;
                };
                (instance.schema(), key)
            }
            DestroyTarget::Key(values) => {
                let schema = target_model(model, index)?;
                (schema, key_from_values(schema, values)?)
            }
            DestroyTarget::Mapping(json) => {
                let schema = target_model(model, index)?;
                (schema, key_from_mapping(schema, &json)?)
            }
        };
        match batches.iter_mut().find(|b| b.schema.same_as(schema)) {
            Some(batch) => batch.keys.push(key),
            None => batches.push(KeyBatch {
                schema,
                keys: vec![key],
            }),
        }
    }
    Ok(batches)
}

fn target_model(
    model: Option<&'static ModelSchema>,
    index: usize,
) -> sqlservice_core::Result<&'static ModelSchema> {
    model.ok_or_else(|| {
        Error::Schema(SchemaError {
            kind: SchemaErrorKind::TableNotFound,
            message: format!("target {index} is not an instance and no model was given"),
        })
    })
}

fn identity_error(schema: &ModelSchema, message: String) -> Error {
    Error::Identity(IdentityError {
        model: schema.name(),
        message,
    })
}

fn key_from_values(schema: &ModelSchema, values: Vec<Value>) -> sqlservice_core::Result<Vec<Value>> {
    let pk = schema.primary_key();
    if values.len() != pk.len() {
        return Err(identity_error(
            schema,
            format!("expected {} primary key values, got {}", pk.len(), values.len()),
        ));
    }
    pk.iter()
        .zip(values)
        .map(|(name, value)| {
            if value.is_null() {
                return Err(identity_error(schema, format!("primary key '{name}' is null")));
            }
            match schema.column(name) {
                Some(column) => value.coerce(column.sql_type, column.name),
                None => Ok(value),
            }
        })
        .collect()
}

fn key_from_mapping(schema: &ModelSchema, json: &serde_json::Value) -> sqlservice_core::Result<Vec<Value>> {
    let Some(object) = json.as_object() else {
        let mut err = ValidationError::new(schema.name());
        err.add("", ValidationErrorKind::NotAMapping, "expected a JSON object");
        return Err(err.into());
    };
    let mut key = Vec::with_capacity(schema.primary_key().len());
    for name in schema.primary_key() {
        let raw = object.get(*name).filter(|raw| !raw.is_null());
        let (Some(raw), Some(column)) = (raw, schema.column(name)) else {
            return Err(identity_error(
                schema,
                format!("mapping has no value for primary key '{name}'"),
            ));
        };
        key.push(Value::from_json(raw, column.sql_type, column.name)?);
    }
    Ok(key)
}

/// Resolve `names` to the schema's column names.
fn key_columns_of(
    schema: &'static ModelSchema,
    names: &[&str],
) -> sqlservice_core::Result<Vec<&'static str>> {
    if names.is_empty() {
        return Err(Error::Schema(SchemaError {
            kind: SchemaErrorKind::Invalid,
            message: format!("{}: bulk updates need at least one key column", schema.name()),
        }));
    }
    names
        .iter()
        .map(|name| {
            schema.column(name).map(|c| c.name).ok_or_else(|| {
                Error::Schema(SchemaError {
                    kind: SchemaErrorKind::ColumnNotFound,
                    message: format!("{} has no column '{name}'", schema.name()),
                })
            })
        })
        .collect()
}

/// Convert `raw` for `name`, recording type errors under `field`.
fn column_value(
    schema: &ModelSchema,
    name: &str,
    raw: &serde_json::Value,
    field: &str,
    errors: &mut ValidationError,
) -> sqlservice_core::Result<Option<Value>> {
    let Some(column) = schema.column(name) else {
        if schema.relationship(name).is_some() {
            errors.add(
                field,
                ValidationErrorKind::Shape,
                format!("'{name}' is a relationship; bulk statements take column values only"),
            );
        } else {
            errors.add_unknown(name);
        }
        return Ok(None);
    };
    match Value::from_json(raw, column.sql_type, column.name) {
        Ok(value) => Ok(Some(value)),
        Err(Error::Type(e)) => {
            errors.add(field, ValidationErrorKind::Type, e.to_string());
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn insert_rows(
    schema: &'static ModelSchema,
    mappings: &[serde_json::Value],
) -> sqlservice_core::Result<InsertRows> {
    let mut errors = ValidationError::new(schema.name());
    let Some(first) = mappings.first() else {
        return Ok(InsertRows::default());
    };
    let columns: Vec<&'static str> = match first.as_object() {
        Some(object) => schema
            .columns()
            .iter()
            .filter(|c| object.contains_key(c.name))
            .map(|c| c.name)
            .collect(),
        None => Vec::new(),
    };
    if columns.is_empty() {
        errors.add("[0]", ValidationErrorKind::Shape, "the first mapping sets no columns");
    }

    let mut rows = Vec::with_capacity(mappings.len());
    for (index, mapping) in mappings.iter().enumerate() {
        let Some(object) = mapping.as_object() else {
            errors.add(format!("[{index}]"), ValidationErrorKind::NotAMapping, "expected a JSON object");
            continue;
        };
        let mut row = Vec::with_capacity(columns.len());
        for (name, raw) in object {
            let field = format!("[{index}].{name}");
            let Some(value) = column_value(schema, name, raw, &field, &mut errors)? else {
                continue;
            };
            if !columns.contains(&name.as_str()) {
                errors.add(
                    field,
                    ValidationErrorKind::Shape,
                    "every mapping must set the same columns",
                );
                continue;
            }
            row.push((name.as_str(), value));
        }
        if columns.iter().any(|c| !object.contains_key(*c)) {
            errors.add(
                format!("[{index}]"),
                ValidationErrorKind::Shape,
                "every mapping must set the same columns",
            );
        }
        // Reorder to the column order of the statement.
        rows.push(
            columns
                .iter()
                .filter_map(|c| row.iter().find(|(name, _)| name == c).map(|(_, v)| v.clone()))
                .collect::<Vec<Value>>(),
        );
    }

    errors.into_result()?;
    Ok(InsertRows { columns, rows })
}

fn update_groups(
    schema: &'static ModelSchema,
    key_columns: &[&'static str],
    mappings: &[serde_json::Value],
) -> sqlservice_core::Result<Vec<UpdateGroup>> {
    let mut errors = ValidationError::new(schema.name());
    let mut groups: Vec<UpdateGroup> = Vec::new();

    for (index, mapping) in mappings.iter().enumerate() {
        let Some(object) = mapping.as_object() else {
            errors.add(format!("[{index}]"), ValidationErrorKind::NotAMapping, "expected a JSON object");
            continue;
        };
        let mut key = Vec::with_capacity(key_columns.len());
        for name in key_columns {
            let field = format!("[{index}].{name}");
            match object.get(*name) {
                Some(raw) => {
                    if let Some(value) = column_value(schema, name, raw, &field, &mut errors)? {
                        key.push(value);
                    }
                }
                None => errors.add(field, ValidationErrorKind::Shape, "missing key column"),
            }
        }

        let mut set = Vec::new();
        for (name, raw) in object {
            if key_columns.contains(&name.as_str()) {
                continue;
            }
            let field = format!("[{index}].{name}");
            if let Some(value) = column_value(schema, name, raw, &field, &mut errors)? {
                if let Some(column) = schema.column(name) {
                    set.push((column.name, value));
                }
            }
        }
        if set.is_empty() || key.len() != key_columns.len() {
            continue;
        }
        // Declaration order, so equal value sets compare equal.
        set.sort_by_key(|(name, _)| schema.columns().iter().position(|c| c.name == *name));

        match groups.iter_mut().find(|g| g.set == set) {
            Some(group) => group.keys.push(key),
            None => groups.push(UpdateGroup {
                set,
                keys: vec![key],
            }),
        }
    }

    errors.into_result()?;
    Ok(groups)
}

/// Split `mappings` into reduced updates and full inserts against `previous`.
fn split_changes(
    schema: &ModelSchema,
    key_columns: &[&'static str],
    previous: &[serde_json::Value],
    mappings: &[serde_json::Value],
) -> sqlservice_core::Result<(Vec<serde_json::Value>, Vec<serde_json::Value>)> {
    let identity = |object: &JsonObject| {
        let key: Vec<&serde_json::Value> = key_columns
            .iter()
            .map(|name| object.get(*name).unwrap_or(&serde_json::Value::Null))
            .collect();
        serde_json::to_string(&key)
    };

    let mut by_key: BTreeMap<String, &JsonObject> = BTreeMap::new();
    for row in previous {
        if let Some(object) = row.as_object() {
            by_key.insert(identity(object)?, object);
        }
    }

    let mut updates = Vec::new();
    let mut inserts = Vec::new();
    for mapping in mappings {
        let Some(object) = mapping.as_object() else {
            let mut err = ValidationError::new(schema.name());
            err.add("", ValidationErrorKind::NotAMapping, "expected a JSON object");
            return Err(err.into());
        };
        let Some(before) = by_key.get(&identity(object)?) else {
            inserts.push(mapping.clone());
            continue;
        };
        let changed: JsonObject = object
            .iter()
            .filter(|(name, value)| {
                key_columns.contains(&name.as_str()) || before.get(name.as_str()) != Some(*value)
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        if changed.len() > key_columns.len() {
            updates.push(serde_json::Value::Object(changed));
        }
    }
    Ok((updates, inserts))
}
