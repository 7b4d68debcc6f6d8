//! Connection factories.

use asupersync::{Cx, Outcome};
use sqlservice_core::{Connection, Error};
use std::future::Future;

/// Opens connections for a [`Database`](crate::Database).
///
/// Driver crates implement this for their connection types; each call must
/// return a fresh connection that is not shared with an open session.
pub trait Connector: Send + Sync {
    type Connection: Connection;

    /// Open a new connection.
    fn connect(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Connection, Error>> + Send;
}

impl<K: Connector> Connector for &K {
    type Connection = K::Connection;

    fn connect(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Connection, Error>> + Send {
        (**self).connect(cx)
    }
}
