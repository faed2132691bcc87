//! Error types for the repack client.

use thiserror::Error;

/// Result type for repack operations.
pub type RepackResult<T> = Result<T, RepackError>;

/// Errors raised while reorganizing a table.
///
/// Skip-vs-fatal policy for a whole database is not encoded here; it is
/// carried by [`crate::database::DatabaseOutcome`]. Every variant of this
/// enum aborts the current run.
#[derive(Debug, Error)]
pub enum RepackError {
    /// Error reported by the Postgres server or the connection.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// The target relation has no usable primary key.
    #[error("relation \"{0}\" must have a primary key or not-null unique keys")]
    MissingPrimaryKey(String),

    /// Cluster mode was requested for a relation without a cluster key.
    #[error("relation \"{0}\" has no cluster key")]
    MissingClusterKey(String),

    /// A BEFORE trigger on the target would fire after the change-capture
    /// trigger and could mutate tuples the log has already recorded.
    #[error("trigger {trigger} conflicted for {table}")]
    ConflictingTrigger { trigger: String, table: String },

    /// The relation lock attempt failed with something other than a
    /// statement-timeout cancel. The session is considered compromised.
    #[error("lock acquisition failed: {0}")]
    LockFailed(#[source] tokio_postgres::Error),
}
