//! The seven-phase online rebuild of one table.
//!
//! Phases strictly serialize and each commits before the next begins:
//!
//! 1. Setup: lock, precondition checks, log table, capture trigger.
//! 2. Copy: serializable snapshot, VXID capture, shadow table creation.
//! 3. Indexes: rebuild each valid index against the shadow table.
//! 4. Drain: apply captured changes until the log converges.
//! 5. Swap: re-lock, apply the remainder, swap storage under the old name.
//! 6. Drop: remove temporary objects, release the cleanup entry.
//! 7. Analyze: refresh statistics; failures here are not fatal.
//!
//! The target is only locked during phases 1 and 5; everything else runs
//! under the capture trigger while concurrent traffic proceeds.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cleanup::{CleanupRegistry, PendingRepack};
use crate::drain::{apply_log, capture_vxid_snapshot, drain_log};
use crate::error::{RepackError, RepackResult};
use crate::lock::lock_exclusive;
use crate::session::PgSession;
use crate::target::{OrderBy, RepackIndex, RepackTable};

const SQL_CONFLICTED_TRIGGERS: &str = "SELECT repack.conflicted_triggers($1)";

const SQL_TARGET_INDEXES: &str = "SELECT indexrelid, \
     repack.repack_indexdef(indexrelid, indrelid), indisvalid, \
     pg_get_indexdef(indexrelid) \
     FROM pg_index WHERE indrelid = $1";

/// Settings shared by every table in a run.
#[derive(Debug, Clone)]
pub struct RepackSettings {
    /// Physical row order for the rebuilt tables.
    pub ordering: OrderBy,
    /// Deadline before competing lock holders are canceled, and twice of
    /// which before they are terminated.
    pub wait_timeout: Duration,
    /// Whether to run the final `ANALYZE`.
    pub analyze: bool,
}

/// Rebuilds one table online.
///
/// On error the caller is responsible for releasing the registered cleanup
/// entry via [`CleanupRegistry::release_outstanding`].
pub async fn repack_one_table(
    session: &PgSession,
    cleanup: &CleanupRegistry,
    table: &RepackTable,
    settings: &RepackSettings,
) -> RepackResult<()> {
    debug_dump(table);

    // Phase 1: workspaces and the change-capture trigger.
    lock_exclusive(
        session,
        table.target_oid,
        &table.lock_table,
        settings.wait_timeout,
    )
    .await?;

    // The capture trigger sorts last among BEFORE triggers; any trigger that
    // would fire after it could mutate tuples the log already recorded.
    let conflicted = session
        .query(SQL_CONFLICTED_TRIGGERS, &[&table.target_oid])
        .await?;
    if let Some(row) = conflicted.first() {
        let trigger: String = row.try_get(0)?;
        return Err(RepackError::ConflictingTrigger {
            trigger,
            table: table.target_name.clone(),
        });
    }

    session.command(&table.create_pktype).await?;
    session.command(&table.create_log).await?;
    session.command(&table.create_trigger).await?;
    session.command(&table.enable_trigger).await?;
    disable_autovacuum(session, &format!("repack.log_{}", table.target_oid)).await?;
    session.command("COMMIT").await?;

    // From here on the server holds objects that must not outlive the run.
    cleanup.register(PendingRepack {
        target_oid: table.target_oid,
        target_name: table.target_name.clone(),
        dbname: session.dbname().to_owned(),
    });

    // Phase 2: copy tuples into the shadow table. Serializable keeps the
    // copy's snapshot and the VXID capture consistent: a row visible to the
    // copy must not also arrive through the log, or it would be duplicated.
    session.command("BEGIN ISOLATION LEVEL SERIALIZABLE").await?;
    session
        .command("SELECT set_config('work_mem', current_setting('maintenance_work_mem'), true)")
        .await?;
    if settings.ordering.is_unordered() {
        // Shared seqscan cursors would make the copy start mid-table and
        // defeat the compaction.
        session.command("SET LOCAL synchronize_seqscans = off").await?;
    }

    let vxids = capture_vxid_snapshot(session).await?;
    debug!(table = %table.target_name, vxids = vxids.len(), "captured transaction snapshot");

    // Rows logged between trigger installation and this point are visible to
    // the copy itself; clear them or they would be applied twice.
    session.command(&table.delete_log).await?;
    session.command(&table.create_table).await?;
    if let Some(drop_columns) = &table.drop_columns {
        session.command(drop_columns).await?;
    }
    disable_autovacuum(session, &format!("repack.table_{}", table.target_oid)).await?;
    session.command("COMMIT").await?;

    // Phase 3: indexes, sequentially on this one connection.
    for index in fetch_indexes(session, table).await? {
        if !index.valid {
            warn!(index = %index.index_def, "skipping invalid index");
            continue;
        }
        debug!(index_oid = index.index_oid, sql = %index.create_index, "building index");
        session.command(&index.create_index).await?;
    }

    // Phase 4: drain the change log.
    drain_log(session, table, &vxids).await?;

    // Phase 5: swap the storage under the old name.
    lock_exclusive(
        session,
        table.target_oid,
        &table.lock_table,
        settings.wait_timeout,
    )
    .await?;
    apply_log(session, table, 0).await?;
    session
        .query("SELECT repack.repack_swap($1)", &[&table.target_oid])
        .await?;
    session.command("COMMIT").await?;

    // Phase 6: drop the temporary objects.
    session.command("BEGIN ISOLATION LEVEL READ COMMITTED").await?;
    session
        .query("SELECT repack.repack_drop($1)", &[&table.target_oid])
        .await?;
    session.command("COMMIT").await?;
    cleanup.complete(table.target_oid);

    // Phase 7: analyze. The cleanup entry is gone; a failure here must not
    // undo the completed rebuild.
    if settings.analyze {
        if let Err(err) = analyze_target(session, table).await {
            warn!(table = %table.target_name, error = %err, "analyze failed");
            let _ = session.try_command("ROLLBACK").await;
        }
    }

    info!(table = %table.target_name, "table repacked");

    Ok(())
}

async fn analyze_target(session: &PgSession, table: &RepackTable) -> RepackResult<()> {
    session.command("BEGIN ISOLATION LEVEL READ COMMITTED").await?;
    session
        .command(&format!("ANALYZE {}", table.target_name))
        .await?;
    session.command("COMMIT").await?;
    Ok(())
}

/// Autovacuum on the log and shadow tables would only churn against the
/// drain; the relation names are derived from the target OID.
async fn disable_autovacuum(session: &PgSession, relation: &str) -> RepackResult<()> {
    session
        .query(
            &format!("SELECT repack.disable_autovacuum('{relation}')"),
            &[],
        )
        .await?;
    Ok(())
}

async fn fetch_indexes(
    session: &PgSession,
    table: &RepackTable,
) -> RepackResult<Vec<RepackIndex>> {
    let rows = session
        .query(SQL_TARGET_INDEXES, &[&table.target_oid])
        .await?;

    rows.iter()
        .map(|row| {
            Ok(RepackIndex {
                index_oid: row.try_get(0)?,
                create_index: row.try_get(1)?,
                valid: row.try_get::<_, Option<bool>>(2)?.unwrap_or(true),
                index_def: row.try_get(3)?,
            })
        })
        .collect()
}

fn debug_dump(table: &RepackTable) {
    debug!(
        target_name = %table.target_name,
        target_oid = table.target_oid,
        toast_oid = ?table.toast_oid,
        toast_index_oid = ?table.toast_index_oid,
        pk_oid = ?table.pk_oid,
        ck_oid = ?table.ck_oid,
        "repack target"
    );
    debug!(
        create_pktype = %table.create_pktype,
        create_log = %table.create_log,
        create_trigger = %table.create_trigger,
        enable_trigger = %table.enable_trigger,
        "setup statements"
    );
    debug!(
        create_table = %table.create_table,
        drop_columns = ?table.drop_columns,
        delete_log = %table.delete_log,
        lock_table = %table.lock_table,
        "copy statements"
    );
    debug!(
        sql_peek = %table.sql_peek,
        sql_insert = %table.sql_insert,
        sql_delete = %table.sql_delete,
        sql_update = %table.sql_update,
        sql_pop = %table.sql_pop,
        "apply templates"
    );
}
