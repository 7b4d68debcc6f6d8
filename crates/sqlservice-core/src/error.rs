//! Error types for SQLService operations.

use std::fmt;

/// The primary error type for all SQLService operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, ping)
    Connection(ConnectionError),
    /// Query execution errors, including constraint violations
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction state errors
    Transaction(TransactionError),
    /// Model schema / registry errors
    Schema(SchemaError),
    /// Configuration errors
    Config(ConfigError),
    /// Validation errors (unknown attributes, bad mapping input)
    Validation(ValidationError),
    /// Identity resolution errors
    Identity(IdentityError),
    /// I/O errors
    Io(std::io::Error),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection was closed by the caller
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub detail: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, not-null, foreign key)
    Constraint,
    /// Table or column not found
    NotFound,
    /// `one()` found no row
    NoResult,
    /// `one()` / `one_or_none()` found more than one row
    MultipleResults,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Commit or rollback requested while no transaction is open
    NotActive,
    /// A scope was exited out of order
    ScopeMismatch,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Table registered twice
    TableExists,
    /// Table or model not found
    TableNotFound,
    /// Column not found
    ColumnNotFound,
    /// Relationship not found
    RelationshipNotFound,
    /// Invalid identifier or definition
    Invalid,
    /// Foreign keys form a cycle
    DependencyCycle,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Raised when an identity function produces a tuple that cannot identify a row.
#[derive(Debug, Clone)]
pub struct IdentityError {
    /// Model whose identity was being resolved
    pub model: &'static str,
    pub message: String,
}

/// Validation error for attribute-level problems on a model.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The model the errors belong to
    pub model: &'static str,
    pub errors: Vec<FieldValidationError>,
}

/// A single validation error for an attribute.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    pub field: String,
    pub kind: ValidationErrorKind,
    pub message: String,
}

/// The type of validation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Key is neither a column nor a relationship of the model
    UnknownField,
    /// Value cannot be stored in the column's type
    Type,
    /// Relationship value has the wrong shape (object vs array)
    Shape,
    /// Input is not a mapping
    NotAMapping,
}

impl ValidationError {
    /// Create a new empty validation error container for a model.
    pub fn new(model: &'static str) -> Self {
        Self {
            model,
            errors: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add a field validation error.
    pub fn add(
        &mut self,
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            kind,
            message: message.into(),
        });
    }

    /// Add an unknown attribute error.
    pub fn add_unknown(&mut self, field: impl Into<String>) {
        let field = field.into();
        let message = format!("'{}' is not an attribute of {}", field, self.model);
        self.add(field, ValidationErrorKind::UnknownField, message);
    }

    /// Convert to Result, returning Ok(()) if no errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Error {
    /// Is this an integrity / constraint violation reported by the database?
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::Query(q) if q.kind == QueryErrorKind::Constraint)
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }
}

impl QueryError {
    /// Build a query error of the given kind with just a message.
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            sqlstate: None,
            message: message.into(),
            detail: None,
            source: None,
        }
    }

    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Identity(e) => write!(f, "Identity error: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ambiguous identity for {}: {}", self.model, self.message)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "validation error on '{}': {}", err.field, err.message)
        } else {
            writeln!(f, "validation errors for {}:", self.model)?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.field, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<IdentityError> for Error {
    fn from(err: IdentityError) -> Self {
        Error::Identity(err)
    }
}

/// Result type alias for SQLService operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_violation() -> Error {
        Error::Query(QueryError {
            kind: QueryErrorKind::Constraint,
            sql: Some("INSERT INTO \"users\" (\"id\") VALUES ($1)".to_string()),
            sqlstate: Some("23505".to_string()),
            message: "duplicate key".to_string(),
            detail: None,
            source: None,
        })
    }

    #[test]
    fn constraint_violation_is_detected_by_kind_and_sqlstate() {
        let err = unique_violation();
        assert!(err.is_constraint_violation());
        assert_eq!(err.sqlstate(), Some("23505"));
        assert!(err.sql().is_some_and(|sql| sql.starts_with("INSERT")));
        match &err {
            Error::Query(q) => {
                assert!(q.is_unique_violation());
                assert!(!q.is_foreign_key_violation());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn display_includes_sqlstate() {
        assert_eq!(
            unique_violation().to_string(),
            "Query error (SQLSTATE 23505): duplicate key"
        );
    }

    #[test]
    fn validation_error_lists_every_field() {
        let mut err = ValidationError::new("User");
        assert!(err.clone().into_result().is_ok());
        err.add_unknown("nickname");
        assert_eq!(
            err.to_string(),
            "validation error on 'nickname': 'nickname' is not an attribute of User"
        );
        err.add("age", ValidationErrorKind::Type, "expected integer");
        let text = err.to_string();
        assert!(text.starts_with("validation errors for User:"));
        assert!(text.contains("  - age: expected integer"));
    }

    #[test]
    fn identity_error_display() {
        let err: Error = IdentityError {
            model: "User",
            message: "identity function returned no columns".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Identity error: ambiguous identity for User: identity function returned no columns"
        );
    }
}
