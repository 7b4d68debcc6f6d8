//! Declarative model metadata.
//!
//! A [`ModelSchema`] describes one mapped table: its columns in declaration
//! order, the primary key, relationships to other models and the model's
//! event handlers. Schemas are built once, usually into a `static`:
//!
//! ```ignore
//! static USERS: LazyLock<ModelSchema> = LazyLock::new(|| {
//!     ModelSchema::builder("User", "users")
//!         .column(Column::new("id", SqlType::BigInt).primary_key().auto_increment())
//!         .column(Column::new("name", SqlType::Text))
//!         .relationship(RelationshipInfo::one_to_one("about", user_abouts, &["id"], &["user_id"]))
//!         .build()
//!         .expect("valid users schema")
//! });
//! fn user_abouts() -> &'static ModelSchema { &USER_ABOUTS }
//! ```

use crate::error::{Error, SchemaErrorKind};
use crate::event::{EventHandler, EventRegistry, ModelEvent};
use crate::record::Record;
use crate::types::SqlType;
use crate::Result;
use regex::Regex;
use std::fmt;
use std::sync::{Arc, LazyLock};

static IDENTIFIER: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$"));

/// Check that `name` can be used as an unquoted SQL identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    name.len() <= 63
        && IDENTIFIER
            .as_ref()
            .is_ok_and(|pattern| pattern.is_match(name))
}

/// Metadata about one mapped column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub unique: bool,
    /// Server-side default expression, emitted verbatim in DDL
    pub default: Option<&'static str>,
    /// Foreign key reference as `"table.column"`
    pub foreign_key: Option<&'static str>,
}

impl Column {
    /// A nullable, non-key column.
    pub const fn new(name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            sql_type,
            nullable: true,
            primary_key: false,
            auto_increment: false,
            unique: false,
            default: None,
            foreign_key: None,
        }
    }

    /// Mark as part of the primary key (implies NOT NULL).
    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Key values are generated by the database when not supplied.
    pub const fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub const fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub const fn default(mut self, expr: &'static str) -> Self {
        self.default = Some(expr);
        self
    }

    pub const fn foreign_key(mut self, reference: &'static str) -> Self {
        self.foreign_key = Some(reference);
        self
    }

    /// Split the foreign key reference into `(table, column)`.
    pub fn foreign_key_target(&self) -> Option<(&'static str, &'static str)> {
        self.foreign_key.and_then(|fk| fk.split_once('.'))
    }
}

/// Shape of a relationship and which side holds the foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RelationshipKind {
    /// This model holds the foreign key to a single target (parent depends on child).
    #[default]
    ManyToOne,
    /// The target holds a foreign key to this model; at most one target.
    OneToOne,
    /// The target holds a foreign key to this model; any number of targets.
    OneToMany,
}

impl RelationshipKind {
    /// The target row must exist before this row can be written.
    pub const fn local_holds_foreign_key(self) -> bool {
        matches!(self, RelationshipKind::ManyToOne)
    }

    pub const fn is_collection(self) -> bool {
        matches!(self, RelationshipKind::OneToMany)
    }
}

/// Relationship from one model to another.
///
/// `local_keys[i]` on this model joins `remote_keys[i]` on the target. For
/// `ManyToOne` the local keys are the foreign key columns; for `OneToOne` and
/// `OneToMany` the remote keys are.
#[derive(Clone, Copy)]
pub struct RelationshipInfo {
    pub name: &'static str,
    pub kind: RelationshipKind,
    /// Resolves the target schema; a function so schemas can refer to each other.
    pub target: fn() -> &'static ModelSchema,
    pub local_keys: &'static [&'static str],
    pub remote_keys: &'static [&'static str],
}

impl RelationshipInfo {
    pub const fn many_to_one(
        name: &'static str,
        target: fn() -> &'static ModelSchema,
        foreign_keys: &'static [&'static str],
        referenced: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            kind: RelationshipKind::ManyToOne,
            target,
            local_keys: foreign_keys,
            remote_keys: referenced,
        }
    }

    pub const fn one_to_one(
        name: &'static str,
        target: fn() -> &'static ModelSchema,
        referenced: &'static [&'static str],
        foreign_keys: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            kind: RelationshipKind::OneToOne,
            target,
            local_keys: referenced,
            remote_keys: foreign_keys,
        }
    }

    pub const fn one_to_many(
        name: &'static str,
        target: fn() -> &'static ModelSchema,
        referenced: &'static [&'static str],
        foreign_keys: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            kind: RelationshipKind::OneToMany,
            target,
            local_keys: referenced,
            remote_keys: foreign_keys,
        }
    }

    pub fn target(&self) -> &'static ModelSchema {
        (self.target)()
    }

    /// Column pairs `(source, destination)` to copy once the key side is known.
    ///
    /// For `ManyToOne` keys flow from the target into this model; otherwise
    /// from this model into the target.
    pub fn key_flow(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        let forward = self.kind.local_holds_foreign_key();
        self.local_keys
            .iter()
            .zip(self.remote_keys.iter())
            .map(move |(local, remote)| if forward { (*remote, *local) } else { (*local, *remote) })
    }
}

impl fmt::Debug for RelationshipInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationshipInfo")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("local_keys", &self.local_keys)
            .field("remote_keys", &self.remote_keys)
            .finish_non_exhaustive()
    }
}

/// Static metadata for one mapped model.
#[derive(Debug)]
pub struct ModelSchema {
    name: &'static str,
    table: &'static str,
    columns: Vec<Column>,
    primary_key: Vec<&'static str>,
    relationships: Vec<RelationshipInfo>,
    events: EventRegistry,
}

impl ModelSchema {
    /// Start building a schema for model `name` mapped to `table`.
    pub fn builder(name: &'static str, table: &'static str) -> ModelSchemaBuilder {
        ModelSchemaBuilder {
            name,
            table,
            columns: Vec::new(),
            relationships: Vec::new(),
            events: EventRegistry::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Columns in declaration order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary key column names in declaration order.
    pub fn primary_key(&self) -> &[&'static str] {
        &self.primary_key
    }

    pub fn relationships(&self) -> &[RelationshipInfo] {
        &self.relationships
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipInfo> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    /// The auto-increment key column, if the model has one.
    pub fn auto_increment_column(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.auto_increment)
    }

    /// Whether `name` is a column or relationship of this model.
    pub fn has_attribute(&self, name: &str) -> bool {
        self.column(name).is_some() || self.relationship(name).is_some()
    }

    /// Schemas are compared by address; each model has exactly one.
    pub fn same_as(&self, other: &ModelSchema) -> bool {
        std::ptr::eq(self, other)
    }
}

/// Builder for [`ModelSchema`].
pub struct ModelSchemaBuilder {
    name: &'static str,
    table: &'static str,
    columns: Vec<Column>,
    relationships: Vec<RelationshipInfo>,
    events: EventRegistry,
}

impl ModelSchemaBuilder {
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn relationship(mut self, relationship: RelationshipInfo) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Register a handler for `event`.
    pub fn on<F>(mut self, event: ModelEvent, handler: F) -> Self
    where
        F: Fn(&mut Record) -> Result<()> + Send + Sync + 'static,
    {
        self.events.listen(event, Arc::new(handler));
        self
    }

    /// Register a handler that runs before both inserts and updates.
    pub fn before_save<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut Record) -> Result<()> + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.events.listen(ModelEvent::BeforeInsert, Arc::clone(&handler));
        self.events.listen(ModelEvent::BeforeUpdate, handler);
        self
    }

    /// Register a handler that runs after both inserts and updates.
    pub fn after_save<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut Record) -> Result<()> + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.events.listen(ModelEvent::AfterInsert, Arc::clone(&handler));
        self.events.listen(ModelEvent::AfterUpdate, handler);
        self
    }

    /// Validate the definition and produce the schema.
    pub fn build(self) -> Result<ModelSchema> {
        let invalid = |message: String| Error::schema(SchemaErrorKind::Invalid, message);

        for name in [self.name, self.table] {
            if !is_valid_identifier(name) {
                return Err(invalid(format!("'{}' is not a valid identifier", name)));
            }
        }
        if self.columns.is_empty() {
            return Err(invalid(format!("model {} declares no columns", self.name)));
        }

        let mut seen: Vec<&str> = Vec::new();
        for column in &self.columns {
            if !is_valid_identifier(column.name) {
                return Err(invalid(format!(
                    "{}: '{}' is not a valid column name",
                    self.name, column.name
                )));
            }
            if seen.contains(&column.name) {
                return Err(invalid(format!(
                    "{}: column '{}' declared twice",
                    self.name, column.name
                )));
            }
            seen.push(column.name);
            if column.auto_increment && !(column.primary_key && column.sql_type.is_integer()) {
                return Err(invalid(format!(
                    "{}: auto-increment column '{}' must be an integer primary key",
                    self.name, column.name
                )));
            }
            if let Some(fk) = column.foreign_key {
                let valid = column
                    .foreign_key_target()
                    .is_some_and(|(t, c)| is_valid_identifier(t) && is_valid_identifier(c));
                if !valid {
                    return Err(invalid(format!(
                        "{}: foreign key '{}' on '{}' must be written as table.column",
                        self.name, fk, column.name
                    )));
                }
            }
        }

        let primary_key: Vec<&'static str> = self
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name)
            .collect();
        if primary_key.is_empty() {
            return Err(invalid(format!("model {} has no primary key", self.name)));
        }
        if self.columns.iter().filter(|c| c.auto_increment).count() > 1 {
            return Err(invalid(format!(
                "model {} declares more than one auto-increment column",
                self.name
            )));
        }

        for rel in &self.relationships {
            if seen.contains(&rel.name) || !is_valid_identifier(rel.name) {
                return Err(invalid(format!(
                    "{}: relationship name '{}' is invalid or shadows a column",
                    self.name, rel.name
                )));
            }
            seen.push(rel.name);
            if rel.local_keys.is_empty() || rel.local_keys.len() != rel.remote_keys.len() {
                return Err(invalid(format!(
                    "{}.{}: local and remote key lists must be non-empty and of equal length",
                    self.name, rel.name
                )));
            }
            if let Some(missing) = rel
                .local_keys
                .iter()
                .find(|k| !self.columns.iter().any(|c| c.name == **k))
            {
                return Err(Error::schema(
                    SchemaErrorKind::ColumnNotFound,
                    format!("{}.{}: no column '{}'", self.name, rel.name, missing),
                ));
            }
        }

        Ok(ModelSchema {
            name: self.name,
            table: self.table,
            columns: self.columns,
            primary_key,
            relationships: self.relationships,
            events: self.events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn other() -> &'static ModelSchema {
        static OTHER: LazyLock<ModelSchema> = LazyLock::new(|| {
            ModelSchema::builder("Other", "others")
                .column(Column::new("id", SqlType::BigInt).primary_key())
                .column(Column::new("owner_id", SqlType::BigInt).foreign_key("owners.id"))
                .build()
                .unwrap()
        });
        &OTHER
    }

    fn owner() -> ModelSchemaBuilder {
        ModelSchema::builder("Owner", "owners")
            .column(
                Column::new("id", SqlType::BigInt)
                    .primary_key()
                    .auto_increment(),
            )
            .column(Column::new("name", SqlType::Text).not_null())
    }

    #[test]
    fn build_collects_primary_key_in_declaration_order() {
        let schema = ModelSchema::builder("Pair", "pairs")
            .column(Column::new("b", SqlType::Integer).primary_key())
            .column(Column::new("x", SqlType::Text))
            .column(Column::new("a", SqlType::Integer).primary_key())
            .build()
            .unwrap();
        assert_eq!(schema.primary_key(), &["b", "a"]);
        assert!(schema.auto_increment_column().is_none());
    }

    #[test]
    fn build_rejects_invalid_definitions() {
        assert!(
            ModelSchema::builder("Bad", "bad table")
                .column(Column::new("id", SqlType::BigInt).primary_key())
                .build()
                .is_err()
        );
        assert!(
            ModelSchema::builder("NoPk", "nopk")
                .column(Column::new("id", SqlType::BigInt))
                .build()
                .is_err()
        );
        assert!(
            ModelSchema::builder("Dup", "dup")
                .column(Column::new("id", SqlType::BigInt).primary_key())
                .column(Column::new("id", SqlType::Text))
                .build()
                .is_err()
        );
        assert!(
            ModelSchema::builder("TextSerial", "ts")
                .column(Column::new("id", SqlType::Text).primary_key().auto_increment())
                .build()
                .is_err()
        );
        assert!(
            ModelSchema::builder("Fk", "fk")
                .column(Column::new("id", SqlType::BigInt).primary_key())
                .column(Column::new("o", SqlType::BigInt).foreign_key("owners"))
                .build()
                .is_err()
        );
    }

    #[test]
    fn relationships_are_validated_against_local_columns() {
        let err = owner()
            .relationship(RelationshipInfo::one_to_many(
                "others",
                other,
                &["missing"],
                &["owner_id"],
            ))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Schema(ref e) if e.kind == SchemaErrorKind::ColumnNotFound
        ));

        let err = owner()
            .relationship(RelationshipInfo::one_to_many("name", other, &["id"], &["owner_id"]))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("shadows a column"));

        let schema = owner()
            .relationship(RelationshipInfo::one_to_many("others", other, &["id"], &["owner_id"]))
            .build()
            .unwrap();
        let rel = schema.relationship("others").unwrap();
        assert!(rel.target().same_as(other()));
        assert!(rel.kind.is_collection());
        assert!(schema.has_attribute("others"));
        assert!(schema.has_attribute("name"));
        assert!(!schema.has_attribute("nickname"));
    }

    #[test]
    fn key_flow_follows_foreign_key_side() {
        let one_to_many = RelationshipInfo::one_to_many("others", other, &["id"], &["owner_id"]);
        assert_eq!(one_to_many.key_flow().collect::<Vec<_>>(), vec![("id", "owner_id")]);

        let many_to_one = RelationshipInfo::many_to_one("owner", other, &["owner_id"], &["id"]);
        assert_eq!(many_to_one.key_flow().collect::<Vec<_>>(), vec![("id", "owner_id")]);
    }

    #[test]
    fn save_handlers_register_for_insert_and_update() {
        let schema = owner()
            .before_save(|_| Ok(()))
            .after_save(|_| Ok(()))
            .on(ModelEvent::Load, |_| Ok(()))
            .build()
            .unwrap();
        let events = schema.events();
        assert_eq!(events.listener_count(ModelEvent::BeforeInsert), 1);
        assert_eq!(events.listener_count(ModelEvent::BeforeUpdate), 1);
        assert_eq!(events.listener_count(ModelEvent::AfterInsert), 1);
        assert_eq!(events.listener_count(ModelEvent::AfterUpdate), 1);
        assert!(events.has_listeners(ModelEvent::Load));
        assert!(!events.has_listeners(ModelEvent::BeforeDelete));
    }

    #[test]
    fn identifiers() {
        assert!(is_valid_identifier("user_abouts"));
        assert!(is_valid_identifier("_x1"));
        assert!(!is_valid_identifier("1x"));
        assert!(!is_valid_identifier("users; DROP TABLE x"));
        assert!(!is_valid_identifier(""));
    }
}
