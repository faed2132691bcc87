//! A single Postgres session.
//!
//! One connection, one statement in flight at a time. The orchestrator
//! distinguishes two failure modes: [`PgSession::command`] and
//! [`PgSession::query`] treat any server error as fatal to the caller, while
//! the `try_` variants hand back the raw error so the caller can dispatch on
//! its SQLSTATE.

use std::num::NonZeroI32;

use tokio_postgres::error::SqlState;
use tokio_postgres::tls::NoTlsStream;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Connection, NoTls, Row, Socket};
use tracing::{Instrument, debug, error, info};

use crate::config::PgConnectionConfig;
use crate::error::RepackResult;
use crate::version::extract_server_version;

/// Spawns a background task to drive a Postgres connection until it
/// terminates.
fn spawn_postgres_connection(connection: Connection<Socket, NoTlsStream>) {
    let span = tracing::Span::current();
    let task = async move {
        match connection.await {
            Err(err) => error!(error = %err, "postgres connection error"),
            Ok(()) => debug!("postgres connection terminated"),
        }
    }
    .instrument(span);

    // The connection terminates on its own when the `Client` is dropped, so
    // the join handle does not need to be tracked.
    tokio::spawn(task);
}

/// A client session against one database.
pub struct PgSession {
    client: Client,
    dbname: String,
    server_version: Option<NonZeroI32>,
}

impl PgSession {
    /// Establishes a connection to the given database.
    pub async fn connect(config: &PgConnectionConfig, dbname: &str) -> RepackResult<Self> {
        let pg_config = config.with_db(dbname);
        let (client, connection) = pg_config.connect(NoTls).await?;

        let server_version = connection
            .parameter("server_version")
            .and_then(extract_server_version);

        spawn_postgres_connection(connection);

        info!(dbname, "connected to postgres");

        Ok(PgSession {
            client,
            dbname: dbname.to_owned(),
            server_version,
        })
    }

    /// The database this session is connected to.
    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    /// Numeric server version, if the server reported one.
    pub fn server_version(&self) -> Option<NonZeroI32> {
        self.server_version
    }

    /// Checks if the underlying connection is closed.
    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// Executes a statement with no parameters, failing on any server error.
    ///
    /// Uses the simple query protocol, so transaction control statements and
    /// server-generated DDL run unmodified.
    pub async fn command(&self, sql: &str) -> RepackResult<()> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    /// As [`PgSession::command`], but returns the raw error for SQLSTATE
    /// inspection instead of failing the caller.
    pub async fn try_command(&self, sql: &str) -> Result<(), tokio_postgres::Error> {
        self.client.batch_execute(sql).await
    }

    /// Executes a parameterized query and returns all result rows.
    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> RepackResult<Vec<Row>> {
        Ok(self.client.query(sql, params).await?)
    }

    /// Executes a parameterized query expected to return exactly one row.
    pub async fn query_one(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> RepackResult<Row> {
        Ok(self.client.query_one(sql, params).await?)
    }

    /// As [`PgSession::query`], but returns the raw error for SQLSTATE
    /// inspection instead of failing the caller.
    pub async fn try_query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, tokio_postgres::Error> {
        self.client.query(sql, params).await
    }
}

/// Returns [`true`] if the error carries the given SQLSTATE.
pub fn is_sqlstate(err: &tokio_postgres::Error, state: &SqlState) -> bool {
    err.code() == Some(state)
}
