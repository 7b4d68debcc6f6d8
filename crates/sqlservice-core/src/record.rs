//! Dynamic model records and shared instance handles.
//!
//! A [`Record`] holds the column values that were explicitly set on a model
//! plus its relationship values. An [`Instance`] is the shared handle the
//! session tracks: cloning it never copies the record, so the caller and the
//! session always observe the same object.

use crate::error::{Error, SchemaErrorKind, ValidationError, ValidationErrorKind};
use crate::event::ModelEvent;
use crate::schema::{Column, ModelSchema, RelationshipInfo};
use crate::value::Value;
use crate::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Value of a relationship attribute.
#[derive(Debug, Clone)]
pub enum Related {
    /// To-one relationship; `None` clears it.
    One(Option<Instance>),
    /// To-many relationship; replaces the whole collection.
    Many(Vec<Instance>),
}

impl Related {
    /// Instances referenced by this value, in order.
    pub fn instances(&self) -> Vec<Instance> {
        match self {
            Related::One(one) => one.iter().cloned().collect(),
            Related::Many(many) => many.clone(),
        }
    }
}

/// Column and relationship values of one model object.
#[derive(Clone)]
pub struct Record {
    schema: &'static ModelSchema,
    values: BTreeMap<&'static str, Value>,
    relations: BTreeMap<&'static str, Related>,
}

impl Record {
    /// An empty record: no column has been set.
    pub fn new(schema: &'static ModelSchema) -> Self {
        Self {
            schema,
            values: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Build a record from a JSON object.
    ///
    /// Keys must be columns or relationships of `schema`; anything else is
    /// rejected. Relationship keys take a nested object (to-one), `null`
    /// (to-one, cleared) or an array of objects (to-many). `Set` handlers
    /// fire once the whole mapping has been accepted.
    pub fn from_mapping(
        schema: &'static ModelSchema,
        mapping: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self> {
        let mut record = Self::parse_mapping(schema, mapping)?;
        let assigned: Vec<&'static str> = record.set_values().map(|(c, _)| c.name).collect();
        for name in assigned {
            schema.events().dispatch(ModelEvent::Set(name), &mut record)?;
        }
        Ok(record)
    }

    fn parse_mapping(
        schema: &'static ModelSchema,
        mapping: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self> {
        let mut record = Record::new(schema);
        let mut errors = ValidationError::new(schema.name());

        for (key, raw) in mapping {
            if let Some(column) = schema.column(key) {
                match Value::from_json(raw, column.sql_type, column.name) {
                    Ok(value) => {
                        record.values.insert(column.name, value);
                    }
                    Err(Error::Type(e)) => errors.add(key, ValidationErrorKind::Type, e.to_string()),
                    Err(e) => return Err(e),
                }
            } else if let Some(rel) = schema.relationship(key) {
                match related_from_json(rel, raw) {
                    Ok(related) => {
                        record.relations.insert(rel.name, related);
                    }
                    Err(Error::Validation(nested)) => {
                        for e in nested.errors {
                            let field = if e.field.is_empty() {
                                key.clone()
                            } else {
                                format!("{}.{}", key, e.field)
                            };
                            errors.add(field, e.kind, e.message);
                        }
                    }
                    Err(e) => return Err(e),
                }
            } else {
                errors.add_unknown(key.as_str());
            }
        }

        errors.into_result()?;
        Ok(record)
    }

    pub fn schema(&self) -> &'static ModelSchema {
        self.schema
    }

    fn column(&self, name: &str) -> Result<&'static Column> {
        let schema = self.schema;
        if let Some(column) = schema.column(name) {
            return Ok(column);
        }
        let mut err = ValidationError::new(schema.name());
        if schema.relationship(name).is_some() {
            err.add(
                name,
                ValidationErrorKind::Shape,
                format!("'{}' is a relationship; assign it with set_related", name),
            );
        } else {
            err.add_unknown(name);
        }
        Err(err.into())
    }

    /// Assign a column value, firing the attribute's `Set` handlers.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let column = self.column(name)?;
        let value = value.into().coerce(column.sql_type, column.name)?;
        self.values.insert(column.name, value);
        let schema = self.schema;
        schema.events().dispatch(ModelEvent::Set(column.name), self)
    }

    /// Assign a column value without firing events.
    ///
    /// Used for values that originate from the database or from key
    /// propagation rather than from the application.
    pub fn set_silent(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let column = self.column(name)?;
        let value = value.into().coerce(column.sql_type, column.name)?;
        self.values.insert(column.name, value);
        Ok(())
    }

    /// Set every key of a JSON object, rejecting unknown keys before any assignment.
    pub fn set_many(&mut self, mapping: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        let incoming = Record::parse_mapping(self.schema, mapping)?;
        for (name, value) in incoming.values {
            self.set(name, value)?;
        }
        self.relations.extend(incoming.relations);
        Ok(())
    }

    /// Value of a column if it has been set.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Value of a column, `Null` when unset.
    pub fn value(&self, name: &str) -> Value {
        self.values.get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Primary key values in key declaration order, `Null` where unset.
    pub fn pk(&self) -> Vec<Value> {
        self.schema
            .primary_key()
            .iter()
            .map(|name| self.value(name))
            .collect()
    }

    /// Primary key as `(column, value)` pairs, or `None` while any part is
    /// unset or null.
    pub fn identity(&self) -> Option<Vec<(&'static str, Value)>> {
        self.schema
            .primary_key()
            .iter()
            .map(|&name| match self.values.get(name) {
                Some(value) if !value.is_null() => Some((name, value.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn unset(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    /// Explicitly set columns in declaration order.
    pub fn set_values(&self) -> impl Iterator<Item = (&'static Column, &Value)> + '_ {
        let schema = self.schema;
        schema
            .columns()
            .iter()
            .filter_map(|column| self.values.get(column.name).map(|v| (column, v)))
    }

    /// Copy of the column values, used as a change-tracking snapshot.
    pub fn snapshot(&self) -> BTreeMap<&'static str, Value> {
        self.values.clone()
    }

    /// Replace all column values with a snapshot.
    pub fn restore(&mut self, snapshot: BTreeMap<&'static str, Value>) {
        self.values = snapshot;
    }

    /// Columns whose current value differs from `snapshot`.
    pub fn changed_since(&self, snapshot: &BTreeMap<&'static str, Value>) -> Vec<&'static Column> {
        self.set_values()
            .filter(|(column, value)| snapshot.get(column.name) != Some(*value))
            .map(|(column, _)| column)
            .collect()
    }

    /// Copy every explicitly set column of `other` into this record.
    ///
    /// Columns `other` never set are left untouched. Returns how many
    /// values actually changed.
    pub fn merge_values_from(&mut self, other: &Record) -> usize {
        let mut changed = 0;
        for (name, value) in &other.values {
            if self.values.get(name) != Some(value) {
                self.values.insert(*name, value.clone());
                changed += 1;
            }
        }
        changed
    }

    /// Primary key values in declaration order, or `None` if any is missing or null.
    pub fn primary_key_values(&self) -> Option<Vec<Value>> {
        self.schema
            .primary_key()
            .iter()
            .map(|name| self.values.get(name).filter(|v| !v.is_null()).cloned())
            .collect()
    }

    /// Assign a relationship value after checking its shape and target model.
    pub fn set_related(&mut self, name: &str, related: Related) -> Result<()> {
        let schema = self.schema;
        let Some(rel) = schema.relationship(name) else {
            return Err(Error::schema(
                SchemaErrorKind::RelationshipNotFound,
                format!("{} has no relationship '{name}'", schema.name()),
            ));
        };
        let mut err = ValidationError::new(schema.name());
        match (&related, rel.kind.is_collection()) {
            (Related::One(_), true) => {
                err.add(name, ValidationErrorKind::Shape, "expected a collection");
            }
            (Related::Many(_), false) => {
                err.add(name, ValidationErrorKind::Shape, "expected a single object");
            }
            _ => {}
        }
        let target = rel.target();
        if related.instances().iter().any(|i| !i.schema().same_as(target)) {
            err.add(
                name,
                ValidationErrorKind::Type,
                format!("expected {} instances", target.name()),
            );
        }
        err.into_result()?;
        self.relations.insert(rel.name, related);
        Ok(())
    }

    pub fn related(&self, name: &str) -> Option<&Related> {
        self.relations.get(name)
    }

    /// Relationship values that were assigned, in declaration order.
    pub fn relations(&self) -> impl Iterator<Item = (&'static RelationshipInfo, &Related)> + '_ {
        let schema = self.schema;
        schema
            .relationships()
            .iter()
            .filter_map(|rel| self.relations.get(rel.name).map(|r| (rel, r)))
    }
}

fn related_from_json(rel: &RelationshipInfo, raw: &serde_json::Value) -> Result<Related> {
    let target = rel.target();
    let shape_error = |expected: &str| {
        let mut err = ValidationError::new(target.name());
        err.add("", ValidationErrorKind::Shape, format!("expected {}", expected));
        Error::Validation(err)
    };
    match (raw, rel.kind.is_collection()) {
        (serde_json::Value::Null, false) => Ok(Related::One(None)),
        (serde_json::Value::Object(map), false) => {
            Ok(Related::One(Some(Instance::from_mapping(target, map)?)))
        }
        (serde_json::Value::Array(items), true) => {
            let mut instances = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    serde_json::Value::Object(map) => {
                        instances.push(Instance::from_mapping(target, map)?);
                    }
                    _ => return Err(shape_error("an array of objects")),
                }
            }
            Ok(Related::Many(instances))
        }
        (_, true) => Err(shape_error("an array of objects")),
        (_, false) => Err(shape_error("an object or null")),
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.schema.name())?;
        for (i, (column, value)) in self.set_values().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", column.name, value.to_json())?;
        }
        write!(f, ")")
    }
}

/// Shared handle to a [`Record`].
///
/// Locks are only held for the duration of a single accessor call; callers
/// using [`Instance::read`] or [`Instance::write`] must not hold the guard
/// across an await.
#[derive(Clone)]
pub struct Instance {
    schema: &'static ModelSchema,
    record: Arc<RwLock<Record>>,
}

impl Instance {
    /// A new, empty instance of `schema`.
    pub fn new(schema: &'static ModelSchema) -> Self {
        Self::from_record(Record::new(schema))
    }

    pub fn from_record(record: Record) -> Self {
        Self {
            schema: record.schema,
            record: Arc::new(RwLock::new(record)),
        }
    }

    /// Build an instance (and nested relationship instances) from a JSON object.
    pub fn from_mapping(
        schema: &'static ModelSchema,
        mapping: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self> {
        Record::from_mapping(schema, mapping).map(Self::from_record)
    }

    /// Like [`Instance::from_mapping`] but accepts any JSON value.
    pub fn from_json(schema: &'static ModelSchema, json: &serde_json::Value) -> Result<Self> {
        match json {
            serde_json::Value::Object(map) => Self::from_mapping(schema, map),
            other => {
                let mut err = ValidationError::new(schema.name());
                err.add(
                    "",
                    ValidationErrorKind::NotAMapping,
                    format!("expected a JSON object, got {}", json_kind(other)),
                );
                Err(err.into())
            }
        }
    }

    pub fn schema(&self) -> &'static ModelSchema {
        self.schema
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Record> {
        self.record.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Record> {
        self.record.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Column value, `Null` when unset.
    pub fn get(&self, name: &str) -> Value {
        self.read().value(name)
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.write().set(name, value)
    }

    pub fn set_related(&self, name: &str, related: Related) -> Result<()> {
        self.write().set_related(name, related)
    }

    /// The instance assigned to a to-one relationship.
    pub fn related_one(&self, name: &str) -> Option<Instance> {
        match self.read().related(name) {
            Some(Related::One(one)) => one.clone(),
            _ => None,
        }
    }

    /// The instances assigned to a to-many relationship.
    pub fn related_many(&self, name: &str) -> Vec<Instance> {
        match self.read().related(name) {
            Some(Related::Many(many)) => many.clone(),
            _ => Vec::new(),
        }
    }

    pub fn primary_key_values(&self) -> Option<Vec<Value>> {
        self.read().primary_key_values()
    }

    /// Whether both handles point at the same record.
    pub fn ptr_eq(&self, other: &Instance) -> bool {
        Arc::ptr_eq(&self.record, &other.record)
    }

    /// Stable address of the shared record, used as a tracking key.
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.record) as *const () as usize
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.read(), f)
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use crate::types::SqlType;
    use crate::RelationshipInfo;
    use serde_json::json;
    use std::sync::LazyLock;

    static AUTHORS: LazyLock<ModelSchema> = LazyLock::new(|| {
        ModelSchema::builder("Author", "authors")
            .column(
                Column::new("id", SqlType::BigInt)
                    .primary_key()
                    .auto_increment(),
            )
            .column(Column::new("name", SqlType::Text))
            .column(Column::new("age", SqlType::Integer))
            .relationship(RelationshipInfo::one_to_many(
                "books",
                books,
                &["id"],
                &["author_id"],
            ))
            .on(ModelEvent::Set("name"), |record| {
                let upper = record
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_uppercase);
                if let Some(upper) = upper {
                    record.set_silent("name", upper)?;
                }
                Ok(())
            })
            .build()
            .unwrap()
    });

    static BOOKS: LazyLock<ModelSchema> = LazyLock::new(|| {
        ModelSchema::builder("Book", "books")
            .column(
                Column::new("id", SqlType::BigInt)
                    .primary_key()
                    .auto_increment(),
            )
            .column(Column::new("title", SqlType::Text))
            .column(Column::new("author_id", SqlType::BigInt).foreign_key("authors.id"))
            .build()
            .unwrap()
    });

    fn authors() -> &'static ModelSchema {
        &AUTHORS
    }

    fn books() -> &'static ModelSchema {
        &BOOKS
    }

    #[test]
    fn mapping_rejects_unknown_keys_and_bad_types() {
        let err = Instance::from_json(authors(), &json!({"name": "x", "nickname": "y", "age": "old"}))
            .unwrap_err();
        let Error::Validation(v) = err else {
            panic!("expected validation error");
        };
        let mut fields: Vec<_> = v.errors.iter().map(|e| (e.field.clone(), e.kind)).collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            fields,
            vec![
                ("age".to_string(), ValidationErrorKind::Type),
                ("nickname".to_string(), ValidationErrorKind::UnknownField),
            ]
        );
    }

    #[test]
    fn mapping_builds_nested_relationships() {
        let author = Instance::from_json(
            authors(),
            &json!({"name": "ann", "books": [{"title": "One"}, {"title": "Two"}]}),
        )
        .unwrap();
        let books = author.related_many("books");
        assert_eq!(books.len(), 2);
        assert!(books[0].schema().same_as(&BOOKS));
        assert_eq!(books[1].get("title"), Value::Text("Two".into()));

        let err = Instance::from_json(authors(), &json!({"books": [{"isbn": "1"}]})).unwrap_err();
        let Error::Validation(v) = err else {
            panic!("expected validation error");
        };
        assert_eq!(v.errors[0].field, "books.isbn");

        assert!(Instance::from_json(authors(), &json!({"books": {"title": "x"}})).is_err());
        assert!(Instance::from_json(authors(), &json!([1, 2])).is_err());
    }

    #[test]
    fn set_fires_attribute_handlers_but_set_silent_does_not() {
        let author = Instance::new(authors());
        author.set("name", "ann").unwrap();
        assert_eq!(author.get("name"), Value::Text("ANN".into()));

        author.write().set_silent("name", "bob").unwrap();
        assert_eq!(author.get("name"), Value::Text("bob".into()));

        let mapped = Instance::from_json(authors(), &json!({"name": "cy"})).unwrap();
        assert_eq!(mapped.get("name"), Value::Text("CY".into()));

        mapped.write().set_many(json!({"name": "dee", "age": 4}).as_object().unwrap()).unwrap();
        assert_eq!(mapped.get("name"), Value::Text("DEE".into()));
        assert_eq!(mapped.get("age"), Value::Int(4));
        assert!(mapped.write().set_many(json!({"bogus": 1}).as_object().unwrap()).is_err());
        assert_eq!(mapped.get("age"), Value::Int(4));
    }

    #[test]
    fn set_rejects_unknown_and_relationship_names() {
        let mut record = Record::new(authors());
        assert!(record.set("nickname", "x").is_err());
        let err = record.set("books", 1_i64).unwrap_err();
        assert!(err.to_string().contains("set_related"));
        assert!(record.set("age", "ten").is_err());
        assert!(!record.is_set("age"));
    }

    #[test]
    fn merge_copies_only_explicitly_set_columns() {
        let mut existing = Record::new(authors());
        existing.set_silent("id", 1_i64).unwrap();
        existing.set_silent("name", "A").unwrap();
        existing.set_silent("age", 30).unwrap();

        let mut incoming = Record::new(authors());
        incoming.set_silent("id", 1_i64).unwrap();
        incoming.set_silent("name", "AA").unwrap();

        let snapshot = existing.snapshot();
        assert_eq!(existing.merge_values_from(&incoming), 1);
        assert_eq!(existing.value("age"), Value::Int(30));
        assert_eq!(existing.value("name"), Value::Text("AA".into()));
        let changed: Vec<_> = existing.changed_since(&snapshot).iter().map(|c| c.name).collect();
        assert_eq!(changed, vec!["name"]);
        assert_eq!(existing.merge_values_from(&incoming), 0);
    }

    #[test]
    fn primary_key_values_require_every_component() {
        let mut record = Record::new(authors());
        assert_eq!(record.primary_key_values(), None);
        record.set_silent("id", Value::Null).unwrap();
        assert_eq!(record.primary_key_values(), None);
        assert_eq!(record.pk(), vec![Value::Null]);
        assert_eq!(record.identity(), None);
        record.set_silent("id", 5_i64).unwrap();
        assert_eq!(record.primary_key_values(), Some(vec![Value::BigInt(5)]));
        assert_eq!(record.pk(), vec![Value::BigInt(5)]);
        assert_eq!(record.identity(), Some(vec![("id", Value::BigInt(5))]));
    }

    #[test]
    fn set_related_checks_shape_and_target() {
        let author = Instance::new(authors());
        let book = Instance::new(books());
        assert!(
            author
                .set_related("books", Related::One(Some(book.clone())))
                .is_err()
        );
        assert!(
            author
                .set_related("books", Related::Many(vec![author.clone()]))
                .is_err()
        );
        author
            .set_related("books", Related::Many(vec![book.clone()]))
            .unwrap();
        assert!(author.related_many("books")[0].ptr_eq(&book));
    }

    #[test]
    fn unknown_relationship_is_a_schema_error() {
        let author = Instance::new(authors());
        let err = author
            .set_related("publisher", Related::One(None))
            .unwrap_err();
        assert!(
            matches!(err, Error::Schema(ref e) if e.kind == SchemaErrorKind::RelationshipNotFound),
            "{err:?}"
        );
    }

    #[test]
    fn debug_renders_set_columns_in_declaration_order() {
        let mut record = Record::new(authors());
        record.set_silent("age", 3).unwrap();
        record.set_silent("id", 1_i64).unwrap();
        assert_eq!(format!("{record:?}"), "Author(id=1, age=3)");
    }

    #[test]
    fn clones_share_the_record() {
        let a = Instance::new(authors());
        let b = a.clone();
        b.set("age", 4).unwrap();
        assert_eq!(a.get("age"), Value::Int(4));
        assert!(a.ptr_eq(&b));
        assert_eq!(a.address(), b.address());
        assert!(!a.ptr_eq(&Instance::new(authors())));
    }
}
