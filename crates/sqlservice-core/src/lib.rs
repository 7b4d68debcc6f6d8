//! Core types and traits for SQLService.
//!
//! This crate provides the foundations the session and save layers build on:
//!
//! - `ModelSchema` declarative metadata (columns, keys, relationships, events)
//! - `Record` / `Instance` dynamic model objects
//! - `Connection` trait the session drives
//! - `Value` / `Row` for parameters and results
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod dump;
pub mod error;
pub mod event;
pub mod record;
pub mod registry;
pub mod row;
pub mod schema;
pub mod types;
pub mod value;

pub use connection::{Connection, Dialect, IsolationLevel};
pub use dump::DumpOptions;
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, FieldValidationError, IdentityError,
    QueryError, QueryErrorKind, Result, SchemaError, SchemaErrorKind, TransactionError,
    TransactionErrorKind, TypeError, ValidationError, ValidationErrorKind,
};
pub use event::{EventHandler, EventRegistry, ModelEvent};
pub use record::{Instance, Record, Related};
pub use registry::Registry;
pub use row::{ColumnInfo, Row};
pub use schema::{
    Column, ModelSchema, ModelSchemaBuilder, RelationshipInfo, RelationshipKind,
    is_valid_identifier,
};
pub use types::SqlType;
pub use value::Value;
