//! Change-log application and drain convergence.
//!
//! Writes that land on the target while the shadow table is being built are
//! captured by the change-capture trigger into the log table. The drainer
//! moves them into the shadow table in bounded batches until the log is
//! empty and every transaction that was already running when the copy
//! started has finished. The set of those transactions only ever shrinks,
//! so the drain terminates.

use std::error::Error;
use std::time::Duration;

use bytes::BytesMut;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tracing::info;

use crate::error::RepackResult;
use crate::session::PgSession;
use crate::target::RepackTable;

/// Log rows applied per `repack_apply` transaction. Larger batches would be
/// faster but leave more redo work behind a crashed apply transaction.
pub const APPLY_COUNT: i32 = 1000;

/// The `('1/1', '-1/0')` tuple is a spurious bgwriter lock entry seen on
/// newly promoted standbys and must not gate the drain.
const SQL_VXID_SNAPSHOT: &str = "SELECT repack.array_accum(virtualtransaction) FROM pg_locks \
     WHERE locktype = 'virtualxid' AND pid <> pg_backend_pid() \
     AND (virtualxid, virtualtransaction) <> ('1/1', '-1/0')";

const SQL_VXID_ALIVE: &str = "SELECT pid FROM pg_locks WHERE locktype = 'virtualxid' \
     AND pid <> pg_backend_pid() AND virtualtransaction = ANY($1)";

/// Captures the virtual transaction IDs alive right now, excluding this
/// session. Must be called inside the serializable copy transaction, before
/// the log table is cleared.
pub async fn capture_vxid_snapshot(session: &PgSession) -> RepackResult<Vec<String>> {
    let row = session.query_one(SQL_VXID_SNAPSHOT, &[]).await?;
    let vxids: Option<Vec<String>> = row.try_get(0)?;
    Ok(vxids.unwrap_or_default())
}

/// A server-generated SQL template passed back as a parameter.
///
/// The apply function declares these parameters as `cstring`, which the
/// stock string bindings refuse. The wire representation is the same raw
/// bytes as `text`, so this binds the string under whatever string-like
/// type the server resolved.
#[derive(Debug)]
struct SqlTemplate<'a>(&'a str);

impl ToSql for SqlTemplate<'_> {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        out.extend_from_slice(self.0.as_bytes());
        Ok(IsNull::No)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Applies at most `count` captured log rows to the shadow table in one
/// server-side transaction and returns the number applied. A `count` of
/// zero applies everything currently in the log.
pub async fn apply_log(
    session: &PgSession,
    table: &RepackTable,
    count: i32,
) -> RepackResult<i32> {
    let row = session
        .query_one(
            "SELECT repack.repack_apply($1, $2, $3, $4, $5, $6)",
            &[
                &SqlTemplate(&table.sql_peek),
                &SqlTemplate(&table.sql_insert),
                &SqlTemplate(&table.sql_delete),
                &SqlTemplate(&table.sql_update),
                &SqlTemplate(&table.sql_pop),
                &count,
            ],
        )
        .await?;

    Ok(row.try_get(0)?)
}

/// Drains the change log until it is empty and no member of the captured
/// snapshot is still running.
pub async fn drain_log(
    session: &PgSession,
    table: &RepackTable,
    vxids: &[String],
) -> RepackResult<()> {
    let mut num_waiting = 0usize;

    loop {
        let applied = apply_log(session, table, APPLY_COUNT).await?;
        if applied > 0 {
            // There may be more in the log; keep applying.
            continue;
        }

        let alive = session.query(SQL_VXID_ALIVE, &[&vxids]).await?;
        if alive.is_empty() {
            return Ok(());
        }

        // The count is expected to only go down; log when it changes so the
        // wait is visible without being noisy.
        if alive.len() != num_waiting {
            let first_pid: i32 = alive[0].try_get(0)?;
            info!(
                transactions = alive.len(),
                first_pid, "waiting for old transactions to finish"
            );
            num_waiting = alive.len();
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_template_accepts_any_string_like_type() {
        assert!(<SqlTemplate<'_> as ToSql>::accepts(&Type::TEXT));
        assert!(<SqlTemplate<'_> as ToSql>::accepts(&Type::UNKNOWN));
    }

    #[test]
    fn test_sql_template_binds_raw_bytes() {
        let mut out = BytesMut::new();
        let template = SqlTemplate("DELETE FROM repack.log_16385");

        let result = template.to_sql(&Type::TEXT, &mut out).unwrap();
        assert!(matches!(result, IsNull::No));
        assert_eq!(&out[..], b"DELETE FROM repack.log_16385");
    }
}
