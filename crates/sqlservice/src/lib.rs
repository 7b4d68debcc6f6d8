//! SQLService: sessions, save/upsert and nestable transactions over SQL
//! connections.
//!
//! This crate is the facade most applications depend on. It re-exports the
//! model and session layers and adds:
//!
//! - [`DatabaseSettings`] loaded fluently, from JSON or from `DATABASE_URL`
//! - the [`Connector`] trait drivers implement to open connections
//! - [`Database`], which hands out sessions and creates or drops the
//!   registered tables
//!
//! # Quick Start
//!
//! ```ignore
//! use sqlservice::prelude::*;
//!
//! let registry = Registry::new().with(users())?.with(posts())?;
//! let db = Database::new(connector, DatabaseSettings::from_env()?, registry)?;
//! db.create_all(&cx).await?;
//!
//! let user = db
//!     .begin(&cx, |session, cx| {
//!         Box::pin(async move {
//!             session
//!                 .save(cx, (users(), json!({"name": "Ada", "posts": [{"title": "Notes"}]})), &mut SaveOptions::default())
//!                 .await
//!         })
//!     })
//!     .await?;
//! ```

pub mod connector;
pub mod database;
pub mod ddl;
pub mod settings;

pub use connector::Connector;
pub use database::Database;
pub use settings::DatabaseSettings;

pub use sqlservice_core::{
    Column, Connection, Cx, Dialect, DumpOptions, Error, Instance, IsolationLevel, ModelEvent,
    ModelSchema, Outcome, Record, Registry, Related, RelationshipInfo, RelationshipKind, Result,
    Row, SqlType, Value,
};
pub use sqlservice_session::{
    DestroyTarget, Identity, Input, ObjectState, SaveOptions, ScopeOptions, ScopedFuture, Session,
    SessionConfig, TransactionScope, resolve_identity,
};

/// Commonly used items.
///
/// ```ignore
/// use sqlservice::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Column, Connection, Connector, Cx, Database, DatabaseSettings, Error, Instance,
        IsolationLevel, ModelSchema, Outcome, Record, Registry, Related, RelationshipInfo, Result,
        SaveOptions, ScopeOptions, Session, SqlType, Value,
    };
}
