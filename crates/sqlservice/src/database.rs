//! The database facade.

use crate::connector::Connector;
use crate::ddl;
use crate::settings::DatabaseSettings;
use asupersync::{Cx, Outcome};
use sqlservice_core::{Connection, Dialect, Error, ModelSchema, Registry, Result};
use sqlservice_session::{ScopeOptions, ScopedFuture, Session, SessionConfig};

type RenderDdl = fn(&Registry, Dialect) -> Result<Vec<String>>;

/// Entry point tying settings, a connector and the model registry together.
///
/// Each [`session`](Self::session) gets its own connection from the
/// connector. Schema operations run inside a single transaction on a
/// dedicated connection.
pub struct Database<K: Connector> {
    connector: K,
    settings: DatabaseSettings,
    registry: Registry,
    session_config: SessionConfig,
}

impl<K: Connector> std::fmt::Debug for Database<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("url", &self.settings.redacted_url())
            .field("tables", &self.registry.tables())
            .field("session_config", &self.session_config)
            .finish_non_exhaustive()
    }
}

impl<K: Connector> Database<K> {
    /// Create a database facade. Fails if `settings` do not validate.
    pub fn new(connector: K, settings: DatabaseSettings, registry: Registry) -> Result<Self> {
        settings.validate()?;
        let session_config = settings.session_config()?;
        tracing::info!(
            url = %settings.redacted_url(),
            dialect = settings.dialect()?.name(),
            models = registry.models().len(),
            "database configured"
        );
        Ok(Self {
            connector,
            settings,
            registry,
            session_config,
        })
    }

    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Registered table names in registration order.
    pub fn tables(&self) -> Vec<&'static str> {
        self.registry.tables()
    }

    /// Registered models, parents before the tables that reference them.
    pub fn sorted_models(&self) -> Result<Vec<&'static ModelSchema>> {
        self.registry.sorted()
    }

    /// Open a connection, pinging it first when `pool_pre_ping` is set.
    pub async fn connect(&self, cx: &Cx) -> Outcome<K::Connection, Error> {
        let conn = match self.connector.connect(cx).await {
            Outcome::Ok(conn) => conn,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if self.settings.pool_pre_ping == Some(true) {
            match conn.ping(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    tracing::warn!(error = %e, "pre-ping failed, discarding connection");
                    close_connection(cx, conn).await;
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(conn)
    }

    /// A new session on a fresh connection.
    pub async fn session(&self, cx: &Cx) -> Outcome<Session<K::Connection>, Error> {
        match self.connect(cx).await {
            Outcome::Ok(conn) => Outcome::Ok(Session::with_config(conn, self.session_config)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Run `body` in the outermost transaction of a new session.
    ///
    /// The transaction commits if `body` succeeds and rolls back otherwise;
    /// the session's connection is closed either way.
    pub async fn begin<T, F>(&self, cx: &Cx, body: F) -> Outcome<T, Error>
    where
        F: for<'s> FnOnce(&'s mut Session<K::Connection>, &'s Cx) -> ScopedFuture<'s, T>,
    {
        let mut session = match self.session(cx).await {
            Outcome::Ok(session) => session,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let result = session.transaction(cx, ScopeOptions::default(), body).await;
        close_session(cx, session).await;
        result
    }

    /// Check that the database answers.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn ping(&self, cx: &Cx) -> Outcome<(), Error> {
        let conn = match self.connector.connect(cx).await {
            Outcome::Ok(conn) => conn,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let pinged = conn.ping(cx).await;
        close_connection(cx, conn).await;
        pinged
    }

    /// Create every registered table that does not exist yet.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn create_all(&self, cx: &Cx) -> Outcome<(), Error> {
        self.run_ddl(cx, "create_all", ddl::create_all_sql).await
    }

    /// Drop every registered table, children first.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn drop_all(&self, cx: &Cx) -> Outcome<(), Error> {
        self.run_ddl(cx, "drop_all", ddl::drop_all_sql).await
    }

    async fn run_ddl(&self, cx: &Cx, operation: &'static str, render: RenderDdl) -> Outcome<(), Error> {
        let mut session = match self.session(cx).await {
            Outcome::Ok(session) => session,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let statements = match render(&self.registry, session.connection().dialect()) {
            Ok(statements) => statements,
            Err(e) => {
                close_session(cx, session).await;
                return Outcome::Err(e);
            }
        };
        let count = statements.len();
        let echo = self.settings.echo == Some(true);

        let result = session
            .transaction(cx, ScopeOptions::default(), move |s, cx| {
                Box::pin(async move {
                    for sql in &statements {
                        if echo {
                            tracing::info!(%sql, "schema statement");
                        } else {
                            tracing::debug!(%sql, "schema statement");
                        }
                        match s.execute(cx, sql, &[]).await {
                            Outcome::Ok(_) => {}
                            Outcome::Err(e) => return Outcome::Err(e),
                            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                            Outcome::Panicked(p) => return Outcome::Panicked(p),
                        }
                    }
                    Outcome::Ok(())
                })
            })
            .await;
        close_session(cx, session).await;

        if let Outcome::Ok(()) = result {
            tracing::info!(operation, statements = count, "schema updated");
        }
        result
    }
}

async fn close_session<C: Connection>(cx: &Cx, session: Session<C>) {
    if let Err(e) = session.close(cx).await {
        tracing::warn!(error = %e, "failed to close session connection");
    }
}

async fn close_connection<C: Connection>(cx: &Cx, conn: C) {
    if let Err(e) = conn.close(cx).await {
        tracing::warn!(error = %e, "failed to close connection");
    }
}
