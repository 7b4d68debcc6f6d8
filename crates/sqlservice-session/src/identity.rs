//! Identity resolution: which stored row, if any, an instance corresponds to.

use sqlservice_core::{Error, IdentityError, Instance, ModelSchema, Record, Result, Value};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::Hasher;

/// Custom identity function: maps a record to `(column, value)` pairs.
///
/// Lets upserts match on keys other than the primary key, for example a
/// unique email column.
pub type IdentityFn<'a> = dyn Fn(&Record) -> Vec<(&'static str, Value)> + 'a;

/// An ordered tuple of column values that locates at most one stored row.
#[derive(Clone)]
pub struct Identity {
    schema: &'static ModelSchema,
    pairs: Vec<(&'static str, Value)>,
    primary: bool,
}

impl Identity {
    /// Identity made of primary key values in declaration order.
    ///
    /// Returns `None` when a value is null or the arity does not match the key.
    pub fn primary_key(schema: &'static ModelSchema, values: Vec<Value>) -> Result<Option<Self>> {
        let pk = schema.primary_key();
        if values.len() != pk.len() {
            return Err(ambiguous(
                schema,
                format!(
                    "primary key has {} column(s), got {} value(s)",
                    pk.len(),
                    values.len()
                ),
            ));
        }
        if values.iter().any(Value::is_null) {
            return Ok(None);
        }
        let mut pairs = Vec::with_capacity(pk.len());
        for (name, value) in pk.iter().zip(values) {
            pairs.push((*name, coerce(schema, name, value)?));
        }
        Ok(Some(Self {
            schema,
            pairs,
            primary: true,
        }))
    }

    pub fn schema(&self) -> &'static ModelSchema {
        self.schema
    }

    pub fn pairs(&self) -> &[(&'static str, Value)] {
        &self.pairs
    }

    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.pairs.iter().map(|(name, _)| *name)
    }

    pub fn values(&self) -> Vec<Value> {
        self.pairs.iter().map(|(_, value)| value.clone()).collect()
    }

    /// Whether the identity names exactly the primary key columns.
    ///
    /// Primary key identities are answered from the identity map; any other
    /// identity scans tracked instances and then queries.
    pub fn is_primary_key(&self) -> bool {
        self.primary
    }

    /// Identity-map key, available for primary key identities only.
    pub(crate) fn object_key(&self) -> Option<ObjectKey> {
        self.primary
            .then(|| ObjectKey::from_pk(self.schema, &self.values()))
    }

    /// Whether `record` currently holds every value of this identity.
    pub(crate) fn matches(&self, record: &Record) -> bool {
        self.pairs
            .iter()
            .all(|(name, value)| record.get(name).is_some_and(|v| same_value(v, value)))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("table", &self.schema.table())
            .field("pairs", &self.pairs)
            .field("primary", &self.primary)
            .finish()
    }
}

/// Resolve the identity of `instance`.
///
/// With `identity_fn` its pairs are used verbatim after validation; without it
/// the primary key columns are read in declaration order. `Ok(None)` means no
/// stored row can match and the instance must be inserted.
///
/// An identity function that returns no pairs, names a column the model does
/// not have, or names a column twice fails with [`Error::Identity`].
pub fn resolve_identity(
    instance: &Instance,
    identity_fn: Option<&IdentityFn<'_>>,
) -> Result<Option<Identity>> {
    let schema = instance.schema();
    let record = instance.read();

    let Some(identity_fn) = identity_fn else {
        return match record.primary_key_values() {
            Some(values) => Identity::primary_key(schema, values),
            None => Ok(None),
        };
    };

    let raw = identity_fn(&record);
    if raw.is_empty() {
        return Err(ambiguous(schema, "identity function returned no columns"));
    }

    let mut pairs: Vec<(&'static str, Value)> = Vec::with_capacity(raw.len());
    for (name, value) in raw {
        let Some(column) = schema.column(name) else {
            return Err(ambiguous(
                schema,
                format!("identity column '{name}' is not a column of {}", schema.name()),
            ));
        };
        if pairs.iter().any(|(seen, _)| *seen == column.name) {
            return Err(ambiguous(
                schema,
                format!("identity column '{name}' appears more than once"),
            ));
        }
        pairs.push((column.name, value));
    }

    if pairs.iter().any(|(_, value)| value.is_null()) {
        return Ok(None);
    }

    let mut coerced = Vec::with_capacity(pairs.len());
    for (name, value) in pairs {
        coerced.push((name, coerce(schema, name, value)?));
    }

    let pk = schema.primary_key();
    let primary =
        coerced.len() == pk.len() && coerced.iter().all(|(name, _)| pk.contains(name));
    if primary {
        // Primary key identities are kept in key declaration order.
        coerced.sort_by_key(|(name, _)| pk.iter().position(|p| p == name));
    }

    Ok(Some(Identity {
        schema,
        pairs: coerced,
        primary,
    }))
}

fn coerce(schema: &'static ModelSchema, name: &str, value: Value) -> Result<Value> {
    let Some(column) = schema.column(name) else {
        return Err(ambiguous(schema, format!("unknown column '{name}'")));
    };
    value.coerce(column.sql_type, column.name)
}

fn ambiguous(schema: &'static ModelSchema, message: impl Into<String>) -> Error {
    Error::Identity(IdentityError {
        model: schema.name(),
        message: message.into(),
    })
}

/// Equality that treats integers of different widths as equal.
pub(crate) fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (
            Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_),
            Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_),
        ) => a.as_i64() == b.as_i64(),
        _ => a == b,
    }
}

/// Identity-map key: table plus a hash of the primary key values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    table: &'static str,
    pk_hash: u64,
}

impl ObjectKey {
    pub fn from_pk(schema: &ModelSchema, pk: &[Value]) -> Self {
        Self {
            table: schema.table(),
            pk_hash: hash_values(pk),
        }
    }

    /// Key of an instance whose primary key is fully set.
    pub fn from_instance(instance: &Instance) -> Option<Self> {
        instance
            .primary_key_values()
            .map(|pk| Self::from_pk(instance.schema(), &pk))
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn pk_hash(&self) -> u64 {
        self.pk_hash
    }
}

fn hash_values(values: &[Value]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for v in values {
        v.hash_into(&mut hasher);
    }
    hasher.finish()
}
