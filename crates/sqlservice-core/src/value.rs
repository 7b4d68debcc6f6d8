//! Dynamic SQL values.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::types::SqlType;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// A dynamically-typed SQL value.
///
/// Records store column values as `Value`, connections bind them as
/// parameters and return them in rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    Bool(bool),

    /// 16-bit signed integer
    SmallInt(i16),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string, also used for ISO-8601 dates and timestamps
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::SmallInt(_) => "SMALLINT",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::SmallInt(v) => Some(*v != 0),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::SmallInt(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::SmallInt(v) => Some(f64::from(*v)),
            Value::Int(v) => Some(f64::from(*v)),
            Value::BigInt(v) => Some(*v as f64),
            Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Convert the value into the representation used for `sql_type`.
    ///
    /// Integers are narrowed or widened to the column's width so that values
    /// coming from different sources compare equal once stored in a record.
    #[allow(clippy::cast_possible_truncation)]
    pub fn coerce(self, sql_type: SqlType, column: &str) -> Result<Value> {
        let mismatch = |actual: &Value| {
            Error::Type(TypeError {
                expected: type_label(sql_type),
                actual: actual.type_name().to_string(),
                column: Some(column.to_string()),
            })
        };

        if self.is_null() {
            return Ok(Value::Null);
        }

        match sql_type {
            SqlType::SmallInt | SqlType::Integer | SqlType::BigInt => {
                let Some(v) = self.as_i64() else {
                    return Err(mismatch(&self));
                };
                match sql_type {
                    SqlType::SmallInt => i16::try_from(v)
                        .map(Value::SmallInt)
                        .map_err(|_| mismatch(&self)),
                    SqlType::Integer => i32::try_from(v)
                        .map(Value::Int)
                        .map_err(|_| mismatch(&self)),
                    _ => Ok(Value::BigInt(v)),
                }
            }
            SqlType::Double => self.as_f64().map(Value::Double).ok_or_else(|| mismatch(&self)),
            SqlType::Numeric { .. } => match self {
                Value::Decimal(s) | Value::Text(s) => Ok(Value::Decimal(s)),
                Value::Double(v) => Ok(Value::Decimal(v.to_string())),
                other => match other.as_i64() {
                    Some(v) => Ok(Value::Decimal(v.to_string())),
                    None => Err(mismatch(&other)),
                },
            },
            SqlType::Boolean => self.as_bool().map(Value::Bool).ok_or_else(|| mismatch(&self)),
            SqlType::VarChar(_)
            | SqlType::Text
            | SqlType::Date
            | SqlType::Time
            | SqlType::Timestamp
            | SqlType::TimestampTz => match self {
                Value::Text(_) => Ok(self),
                other => Err(mismatch(&other)),
            },
            SqlType::Blob => match self {
                Value::Bytes(_) => Ok(self),
                Value::Text(s) => Ok(Value::Bytes(s.into_bytes())),
                other => Err(mismatch(&other)),
            },
            SqlType::Uuid => match self {
                Value::Uuid(_) => Ok(self),
                Value::Text(ref s) => parse_uuid(s).map(Value::Uuid).ok_or_else(|| mismatch(&self)),
                other => Err(mismatch(&other)),
            },
            SqlType::Json => match self {
                Value::Json(_) => Ok(self),
                Value::Text(s) => Ok(Value::Json(serde_json::Value::String(s))),
                other => Ok(Value::Json(other.to_json())),
            },
        }
    }

    /// Build a value for a column of `sql_type` from a JSON scalar.
    pub fn from_json(json: &serde_json::Value, sql_type: SqlType, column: &str) -> Result<Value> {
        let raw = match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::BigInt(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Double(f)
                } else {
                    Value::Decimal(n.to_string())
                }
            }
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Json(other.clone()),
        };
        if sql_type == SqlType::Json && !raw.is_null() {
            return Ok(Value::Json(json.clone()));
        }
        raw.coerce(sql_type, column)
    }

    /// Render the value as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::SmallInt(v) => serde_json::Value::from(*v),
            Value::Int(v) => serde_json::Value::from(*v),
            Value::BigInt(v) => serde_json::Value::from(*v),
            Value::Double(v) => serde_json::Number::from_f64(*v)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::Decimal(s) | Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::Array(
                b.iter().map(|byte| serde_json::Value::from(*byte)).collect(),
            ),
            Value::Uuid(bytes) => serde_json::Value::String(format_uuid(bytes)),
            Value::Json(v) => v.clone(),
        }
    }

    /// Feed a canonical form of the value into `state`.
    ///
    /// Integers of every width hash alike, so identity keys built from a
    /// `SmallInt` and a `BigInt` of the same number collide as intended.
    pub fn hash_into<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {
                2u8.hash(state);
                self.as_i64().hash(state);
            }
            Value::Double(f) => {
                3u8.hash(state);
                f.to_bits().hash(state);
            }
            Value::Decimal(s) | Value::Text(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            Value::Bytes(b) => {
                5u8.hash(state);
                b.hash(state);
            }
            Value::Uuid(u) => {
                6u8.hash(state);
                u.hash(state);
            }
            Value::Json(j) => {
                7u8.hash(state);
                j.to_string().hash(state);
            }
        }
    }
}

fn type_label(sql_type: SqlType) -> &'static str {
    match sql_type {
        SqlType::SmallInt => "SMALLINT",
        SqlType::Integer => "INTEGER",
        SqlType::BigInt => "BIGINT",
        SqlType::Double => "DOUBLE",
        SqlType::Numeric { .. } => "NUMERIC",
        SqlType::Boolean => "BOOLEAN",
        SqlType::VarChar(_) | SqlType::Text => "TEXT",
        SqlType::Blob => "BLOB",
        SqlType::Date | SqlType::Time | SqlType::Timestamp | SqlType::TimestampTz => {
            "ISO-8601 TEXT"
        }
        SqlType::Uuid => "UUID",
        SqlType::Json => "JSON",
    }
}

fn parse_uuid(s: &str) -> Option<[u8; 16]> {
    let hex: Vec<u8> = s.bytes().filter(|b| *b != b'-').collect();
    if hex.len() != 32 {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, pair) in hex.chunks(2).enumerate() {
        let text = std::str::from_utf8(pair).ok()?;
        out[i] = u8::from_str_radix(text, 16).ok()?;
    }
    Some(out)
}

fn format_uuid(bytes: &[u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (i, b) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        out.push_str(&format!("{:02x}", b));
    }
    out
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| {
            Error::Type(TypeError {
                expected: "bool",
                actual: value.type_name().to_string(),
                column: None,
            })
        })
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Bool(_) => Err(Error::Type(TypeError {
                expected: "i64",
                actual: value.type_name().to_string(),
                column: None,
            })),
            other => other.as_i64().ok_or_else(|| {
                Error::Type(TypeError {
                    expected: "i64",
                    actual: other.type_name().to_string(),
                    column: None,
                })
            }),
        }
    }
}

impl TryFrom<Value> for f64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| {
            Error::Type(TypeError {
                expected: "f64",
                actual: value.type_name().to_string(),
                column: None,
            })
        })
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Text(s) | Value::Decimal(s) => Ok(s),
            other => Err(Error::Type(TypeError {
                expected: "string",
                actual: other.type_name().to_string(),
                column: None,
            })),
        }
    }
}

impl<T> TryFrom<Value> for Option<T>
where
    T: TryFrom<Value, Error = Error>,
{
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            v => T::try_from(v).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(value: &Value) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash_into(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn integers_coerce_to_column_width() {
        let v = Value::BigInt(7).coerce(SqlType::Integer, "id").unwrap();
        assert_eq!(v, Value::Int(7));
        let v = Value::Int(7).coerce(SqlType::BigInt, "id").unwrap();
        assert_eq!(v, Value::BigInt(7));
        assert!(
            Value::BigInt(i64::MAX)
                .coerce(SqlType::SmallInt, "n")
                .is_err()
        );
    }

    #[test]
    fn coerce_rejects_mismatched_types() {
        let err = Value::Text("abc".into())
            .coerce(SqlType::BigInt, "id")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Type error: expected BIGINT for column 'id', found TEXT"
        );
        assert_eq!(
            Value::Null.coerce(SqlType::BigInt, "id").unwrap(),
            Value::Null
        );
    }

    #[test]
    fn from_json_respects_column_type() {
        let id = Value::from_json(&serde_json::json!(1), SqlType::BigInt, "id").unwrap();
        assert_eq!(id, Value::BigInt(1));
        let name = Value::from_json(&serde_json::json!("AA"), SqlType::Text, "name").unwrap();
        assert_eq!(name, Value::Text("AA".into()));
        let tags =
            Value::from_json(&serde_json::json!(["a", "b"]), SqlType::Json, "tags").unwrap();
        assert_eq!(tags, Value::Json(serde_json::json!(["a", "b"])));
        let price = Value::from_json(
            &serde_json::json!(9.5),
            SqlType::Numeric {
                precision: 10,
                scale: 2,
            },
            "price",
        )
        .unwrap();
        assert_eq!(price, Value::Decimal("9.5".into()));
    }

    #[test]
    fn uuid_text_round_trips_through_json() {
        let text = "67e55044-10b1-426f-9247-bb680e5fe0c8";
        let v = Value::Text(text.into()).coerce(SqlType::Uuid, "id").unwrap();
        assert!(matches!(v, Value::Uuid(_)));
        assert_eq!(v.to_json(), serde_json::json!(text));
        assert!(
            Value::Text("not-a-uuid".into())
                .coerce(SqlType::Uuid, "id")
                .is_err()
        );
    }

    #[test]
    fn integer_widths_hash_alike() {
        assert_eq!(hash_of(&Value::Int(5)), hash_of(&Value::BigInt(5)));
        assert_ne!(hash_of(&Value::Int(5)), hash_of(&Value::Text("5".into())));
    }

    #[test]
    fn try_from_conversions() {
        assert_eq!(i64::try_from(Value::Int(3)).unwrap(), 3);
        assert_eq!(
            String::try_from(Value::Text("x".into())).unwrap(),
            "x".to_string()
        );
        assert_eq!(Option::<i64>::try_from(Value::Null).unwrap(), None);
        assert!(i64::try_from(Value::Bool(true)).is_err());
    }
}
