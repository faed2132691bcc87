//! Per-table reorganization targets.
//!
//! A [`RepackTable`] freezes one row of the server's `repack.tables` view.
//! Every SQL string in it is generated server-side and treated as opaque
//! text; the only composition the client performs is appending an
//! `ORDER BY` clause to the shadow-table creation statement.

use tokio_postgres::Row;

use crate::error::{RepackError, RepackResult};

/// Physical row order requested for the rebuilt table.
///
/// The three values are deliberately distinct: cluster mode and the
/// unordered (VACUUM FULL style) mode differ both in how the creation
/// statement is derived and in which relations are eligible when a whole
/// database is processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderBy {
    /// Order by the relation's cluster key. Relations without one are
    /// rejected.
    ClusterKey,
    /// No ordering; plain storage compaction.
    Unordered,
    /// Order by a user-supplied column list.
    Columns(String),
}

impl OrderBy {
    /// Whether this is the no-ordering compaction mode.
    pub fn is_unordered(&self) -> bool {
        matches!(self, OrderBy::Unordered)
    }
}

/// One reorganization target, as enumerated by `repack.tables`.
#[derive(Debug, Clone)]
pub struct RepackTable {
    /// Qualified relation name.
    pub target_name: String,
    /// OID of the target relation.
    pub target_oid: u32,
    /// OID of the target's TOAST table, if any.
    pub toast_oid: Option<u32>,
    /// OID of the TOAST table's index, if any.
    pub toast_index_oid: Option<u32>,
    /// OID of the primary (or not-null unique) key index. Always present on
    /// a constructed value; rows without one are rejected.
    pub pk_oid: Option<u32>,
    /// OID of the cluster key index, if any.
    pub ck_oid: Option<u32>,
    /// `CREATE TYPE` for the primary key record type.
    pub create_pktype: String,
    /// `CREATE TABLE` for the change log.
    pub create_log: String,
    /// `CREATE TRIGGER` for the change-capture trigger.
    pub create_trigger: String,
    /// `ALTER TABLE .. ENABLE ALWAYS TRIGGER` for the capture trigger.
    pub enable_trigger: String,
    /// Shadow table creation statement with the ordering for this run
    /// already applied.
    pub create_table: String,
    /// `ALTER TABLE .. DROP COLUMN`s for columns absent from the new
    /// definition.
    pub drop_columns: Option<String>,
    /// `DELETE FROM` the change log.
    pub delete_log: String,
    /// `LOCK TABLE` statement for the target.
    pub lock_table: String,
    /// Row-application template: read pending log rows.
    pub sql_peek: String,
    /// Row-application template: insert into the shadow table.
    pub sql_insert: String,
    /// Row-application template: delete from the shadow table.
    pub sql_delete: String,
    /// Row-application template: update the shadow table.
    pub sql_update: String,
    /// Row-application template: remove applied log rows.
    pub sql_pop: String,
}

impl RepackTable {
    /// Builds a target from one `repack.tables` row, deriving the final
    /// shadow-table creation statement for the requested ordering.
    ///
    /// Fails before any DDL has run if the relation has no primary key, or
    /// if cluster mode was requested and the relation has no cluster key.
    pub fn from_row(row: &Row, ordering: &OrderBy) -> RepackResult<Self> {
        let target_name: String = row.try_get("relname")?;

        let pk_oid: Option<u32> = row.try_get("pkid")?;
        if pk_oid.unwrap_or(0) == 0 {
            return Err(RepackError::MissingPrimaryKey(target_name));
        }

        let base_create_table: String = row.try_get("create_table")?;
        let clustering_key: Option<String> = row.try_get("ckey")?;
        let create_table = build_create_table(
            &base_create_table,
            clustering_key.as_deref(),
            ordering,
            &target_name,
        )?;

        Ok(RepackTable {
            target_name,
            target_oid: row.try_get("relid")?,
            toast_oid: row.try_get("toast")?,
            toast_index_oid: row.try_get("toast_idx")?,
            pk_oid,
            ck_oid: row.try_get("ckid")?,
            create_pktype: row.try_get("create_pktype")?,
            create_log: row.try_get("create_log")?,
            create_trigger: row.try_get("create_trigger")?,
            enable_trigger: row.try_get("enable_trigger")?,
            create_table,
            drop_columns: row.try_get("drop_columns")?,
            delete_log: row.try_get("delete_log")?,
            lock_table: row.try_get("lock_table")?,
            sql_peek: row.try_get("sql_peek")?,
            sql_insert: row.try_get("sql_insert")?,
            sql_delete: row.try_get("sql_delete")?,
            sql_update: row.try_get("sql_update")?,
            sql_pop: row.try_get("sql_pop")?,
        })
    }
}

/// Derives the shadow-table creation statement for the requested ordering.
///
/// The base statement is a server-generated `CREATE TABLE .. AS SELECT ..`
/// without an `ORDER BY`; appending one is the only composition the client
/// performs on server SQL.
pub(crate) fn build_create_table(
    base: &str,
    clustering_key: Option<&str>,
    ordering: &OrderBy,
    target_name: &str,
) -> RepackResult<String> {
    match ordering {
        OrderBy::ClusterKey => clustering_key
            .map(|key| format!("{base} ORDER BY {key}"))
            .ok_or_else(|| RepackError::MissingClusterKey(target_name.to_owned())),
        OrderBy::Unordered => Ok(base.to_owned()),
        OrderBy::Columns(columns) => Ok(format!("{base} ORDER BY {columns}")),
    }
}

/// One index on the target relation, with its server-generated counterpart
/// statement for the shadow table.
#[derive(Debug, Clone)]
pub struct RepackIndex {
    /// OID of the original index.
    pub index_oid: u32,
    /// `CREATE INDEX` targeting the shadow table.
    pub create_index: String,
    /// `pg_index.indisvalid`; invalid indexes are skipped with a warning.
    pub valid: bool,
    /// Original index definition, for diagnostics.
    pub index_def: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "CREATE TABLE repack.table_16385 AS SELECT id, v FROM public.t WITH NO DATA";

    #[test]
    fn test_cluster_mode_appends_cluster_key() {
        let sql =
            build_create_table(BASE, Some("v"), &OrderBy::ClusterKey, "public.t").unwrap();
        assert_eq!(sql, format!("{BASE} ORDER BY v"));
    }

    #[test]
    fn test_cluster_mode_requires_cluster_key() {
        let err =
            build_create_table(BASE, None, &OrderBy::ClusterKey, "public.t").unwrap_err();
        assert!(matches!(err, RepackError::MissingClusterKey(name) if name == "public.t"));
    }

    #[test]
    fn test_unordered_mode_uses_base_statement() {
        let sql = build_create_table(BASE, Some("v"), &OrderBy::Unordered, "public.t").unwrap();
        assert_eq!(sql, BASE);
    }

    #[test]
    fn test_user_columns_override_cluster_key() {
        let ordering = OrderBy::Columns("id DESC, v".to_string());
        let sql = build_create_table(BASE, Some("v"), &ordering, "public.t").unwrap();
        assert_eq!(sql, format!("{BASE} ORDER BY id DESC, v"));
    }

    #[test]
    fn test_user_columns_do_not_require_cluster_key() {
        let ordering = OrderBy::Columns("id".to_string());
        let sql = build_create_table(BASE, None, &ordering, "public.t").unwrap();
        assert_eq!(sql, format!("{BASE} ORDER BY id"));
    }
}
