//! Per-database orchestration and the all-databases driver.

use tokio_postgres::Row;
use tokio_postgres::error::SqlState;
use tracing::{debug, info};

use crate::cleanup::CleanupRegistry;
use crate::config::PgConnectionConfig;
use crate::error::RepackResult;
use crate::session::{PgSession, is_sqlstate};
use crate::table::{RepackSettings, repack_one_table};
use crate::target::{OrderBy, RepackTable};
use crate::version::{PROGRAM_NAME, program_banner};

const SQL_VERSION_HANDSHAKE: &str = "select repack.version(), repack.version_sql()";

const SQL_LIST_DATABASES: &str =
    "SELECT datname FROM pg_database WHERE datallowconn ORDER BY 1";

/// Whether a database was processed or left alone, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseOutcome {
    /// Every eligible table was repacked.
    Completed,
    /// The database was skipped before any table work started.
    Skipped(String),
}

/// Reorganizes one database.
///
/// Failures up to and including target enumeration produce
/// [`DatabaseOutcome::Skipped`]; anything after that is fatal for the run
/// and returns an error, after outstanding temporary objects have been
/// dropped.
pub async fn repack_database(
    config: &PgConnectionConfig,
    dbname: &str,
    target_table: Option<&str>,
    settings: &RepackSettings,
    cleanup: &CleanupRegistry,
) -> RepackResult<DatabaseOutcome> {
    let session = PgSession::connect(config, dbname).await?;

    // Both the C library and the SQL extension must be byte-compatible with
    // this client on the row-application templates, so both versions are
    // checked against the exact program banner.
    match session.try_query(SQL_VERSION_HANDSHAKE, &[]).await {
        Ok(rows) => {
            let Some(row) = rows.first() else {
                return Ok(DatabaseOutcome::Skipped(
                    "could not determine repack extension version".to_string(),
                ));
            };
            let library_version: String = row.try_get(0)?;
            let extension_version: String = row.try_get(1)?;
            if let Some(reason) = handshake_mismatch(&library_version, &extension_version) {
                return Ok(DatabaseOutcome::Skipped(reason));
            }
        }
        Err(err) if is_sqlstate(&err, &SqlState::INVALID_SCHEMA_NAME) => {
            return Ok(DatabaseOutcome::Skipped(not_installed_reason()));
        }
        Err(err) => return Ok(DatabaseOutcome::Skipped(err.to_string())),
    }

    // Session priming: no global statement timeout (lock attempts set their
    // own), a catalog-only search path, and no chatter from implicit DDL.
    session.command("SET statement_timeout = 0").await?;
    session
        .command("SET search_path = pg_catalog, pg_temp, public")
        .await?;
    session.command("SET client_min_messages = warning").await?;

    let rows = match enumerate_targets(&session, target_table, &settings.ordering).await {
        Ok(rows) => rows,
        Err(err) if is_sqlstate(&err, &SqlState::INVALID_SCHEMA_NAME) => {
            return Ok(DatabaseOutcome::Skipped(not_installed_reason()));
        }
        Err(err) => return Ok(DatabaseOutcome::Skipped(err.to_string())),
    };

    info!(dbname, tables = rows.len(), "repacking database");

    match repack_tables(&session, &rows, settings, cleanup).await {
        Ok(()) => Ok(DatabaseOutcome::Completed),
        Err(err) => {
            let mut slot = Some(session);
            cleanup.release_outstanding(&mut slot, config).await;
            Err(err)
        }
    }
}

/// Reorganizes every database that allows connections.
///
/// Skipped databases are logged and do not fail the run; a table-level
/// failure in any database still aborts everything, as it leaves the
/// session in an unknown state.
pub async fn repack_all_databases(
    config: &PgConnectionConfig,
    settings: &RepackSettings,
    cleanup: &CleanupRegistry,
) -> RepackResult<()> {
    let bootstrap = PgSession::connect(config, "postgres").await?;
    let rows = bootstrap.query(SQL_LIST_DATABASES, &[]).await?;
    drop(bootstrap);

    for row in rows {
        let dbname: String = row.try_get(0)?;
        info!(database = %dbname, "repack database");

        match repack_database(config, &dbname, None, settings, cleanup).await? {
            DatabaseOutcome::Completed => {}
            DatabaseOutcome::Skipped(reason) => {
                info!(database = %dbname, reason = %reason, "database skipped");
            }
        }
    }

    Ok(())
}

async fn enumerate_targets(
    session: &PgSession,
    target_table: Option<&str>,
    ordering: &OrderBy,
) -> Result<Vec<Row>, tokio_postgres::Error> {
    match target_table {
        Some(name) => {
            debug!(table = name, "looking up repack target");
            session
                .try_query(
                    "SELECT * FROM repack.tables WHERE relid = $1::text::regclass",
                    &[&name],
                )
                .await
        }
        None => {
            // Without a user ordering only cluster-keyed relations are
            // eligible; the unordered and user-ordered modes take every
            // relation with a primary key.
            let sql = match ordering {
                OrderBy::ClusterKey => {
                    "SELECT * FROM repack.tables WHERE pkid IS NOT NULL AND ckid IS NOT NULL"
                }
                _ => "SELECT * FROM repack.tables WHERE pkid IS NOT NULL",
            };
            session.try_query(sql, &[]).await
        }
    }
}

async fn repack_tables(
    session: &PgSession,
    rows: &[Row],
    settings: &RepackSettings,
    cleanup: &CleanupRegistry,
) -> RepackResult<()> {
    for row in rows {
        let table = RepackTable::from_row(row, &settings.ordering)?;
        info!(table = %table.target_name, "repacking table");
        repack_one_table(session, cleanup, &table, settings).await?;
    }

    Ok(())
}

fn not_installed_reason() -> String {
    format!("{PROGRAM_NAME} is not installed in the database")
}

/// Compares both server-reported versions against the program banner.
/// Returns the skip reason on the first mismatch.
fn handshake_mismatch(library_version: &str, extension_version: &str) -> Option<String> {
    let expected = program_banner();

    if library_version != expected {
        return Some(format!(
            "program '{expected}' does not match database library '{library_version}'"
        ));
    }
    if extension_version != expected {
        return Some(format!(
            "extension '{expected}' required, found extension '{extension_version}'"
        ));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_accepts_exact_match() {
        let banner = program_banner();
        assert_eq!(handshake_mismatch(&banner, &banner), None);
    }

    #[test]
    fn test_handshake_rejects_library_mismatch() {
        let banner = program_banner();
        let reason = handshake_mismatch("pg_repack 0.0.1", &banner).unwrap();
        assert!(reason.contains("does not match database library"));
        assert!(reason.contains("pg_repack 0.0.1"));
    }

    #[test]
    fn test_handshake_rejects_extension_mismatch() {
        let banner = program_banner();
        let reason = handshake_mismatch(&banner, "pg_repack 0.0.1").unwrap();
        assert!(reason.contains("found extension"));
        assert!(reason.contains("pg_repack 0.0.1"));
    }

    #[test]
    fn test_library_is_checked_before_extension() {
        let reason = handshake_mismatch("pg_repack a", "pg_repack b").unwrap();
        assert!(reason.contains("database library"));
    }

    #[test]
    fn test_not_installed_reason_names_program() {
        assert_eq!(
            not_installed_reason(),
            "pg_repack is not installed in the database"
        );
    }
}
