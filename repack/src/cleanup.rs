//! Teardown of server-side temporary objects.
//!
//! Once a table's first setup DDL has committed, the server holds a log
//! table, a helper type, a trigger and eventually a shadow table that must
//! not outlive the run. Each such table is registered here and released
//! either by the orchestrator on success or by
//! [`CleanupRegistry::release_outstanding`] on failure. After a fatal
//! signal the connection state is unknown, so that path prints a banner and
//! deliberately touches nothing.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::config::PgConnectionConfig;
use crate::session::PgSession;

/// One table whose temporary objects still exist server-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRepack {
    /// OID of the target relation, as passed to `repack.repack_drop`.
    pub target_oid: u32,
    /// Qualified relation name, for diagnostics.
    pub target_name: String,
    /// Database the objects live in.
    pub dbname: String,
}

/// Stack of tables with outstanding temporary objects.
///
/// Cheap to clone; clones share the same stack, so the signal handler and
/// the orchestrator observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CleanupRegistry {
    pending: Arc<Mutex<Vec<PendingRepack>>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table whose setup DDL has committed. Must be called only
    /// after the first DDL succeeds, so a failed setup leaves no entry.
    pub fn register(&self, entry: PendingRepack) {
        self.lock().push(entry);
    }

    /// Marks a table fully dropped. Idempotent; completing a table that was
    /// never registered (or already completed) is a no-op.
    pub fn complete(&self, target_oid: u32) {
        self.lock().retain(|entry| entry.target_oid != target_oid);
    }

    /// Outstanding entries, most recently registered first.
    pub fn outstanding(&self) -> Vec<PendingRepack> {
        let mut entries = self.lock().clone();
        entries.reverse();
        entries
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Fatal-signal path: report that temporary objects may remain, without
    /// touching the database. A later run's `repack.repack_drop` removes
    /// them.
    pub fn fatal_banner(&self) {
        if self.is_empty() {
            return;
        }
        eprintln!("!!!FATAL ERROR!!! Please refer to the manual.\n");
    }

    /// Error-exit path: drop every outstanding table's temporary objects.
    ///
    /// Rolls back whatever transaction the session was left in (ignoring the
    /// outcome), reconnects when the session is gone, unusable or pointed at
    /// the wrong database, and calls `repack.repack_drop` per entry. Drop
    /// failures are logged and skipped; the server-side function is
    /// idempotent, so a later run can finish the job.
    pub async fn release_outstanding(
        &self,
        session: &mut Option<PgSession>,
        config: &PgConnectionConfig,
    ) {
        let entries: Vec<PendingRepack> = {
            let mut pending = self.lock();
            let mut entries: Vec<_> = pending.drain(..).collect();
            entries.reverse();
            entries
        };

        for entry in entries {
            if let Some(current) = session.as_ref() {
                let _ = current.try_command("ROLLBACK").await;
            }

            let needs_reconnect = match session.as_ref() {
                Some(current) => current.is_closed() || current.dbname() != entry.dbname,
                None => true,
            };
            if needs_reconnect {
                match PgSession::connect(config, &entry.dbname).await {
                    Ok(fresh) => *session = Some(fresh),
                    Err(err) => {
                        warn!(
                            table = %entry.target_name,
                            dbname = %entry.dbname,
                            error = %err,
                            "could not reconnect for cleanup; temporary objects remain"
                        );
                        continue;
                    }
                }
            }

            let Some(current) = session.as_ref() else {
                continue;
            };
            match current
                .query("SELECT repack.repack_drop($1)", &[&entry.target_oid])
                .await
            {
                Ok(_) => info!(table = %entry.target_name, "dropped temporary objects"),
                Err(err) => warn!(
                    table = %entry.target_name,
                    error = %err,
                    "failed to drop temporary objects"
                ),
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PendingRepack>> {
        self.pending.lock().expect("cleanup registry lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(oid: u32, name: &str) -> PendingRepack {
        PendingRepack {
            target_oid: oid,
            target_name: name.to_string(),
            dbname: "appdb".to_string(),
        }
    }

    #[test]
    fn test_register_then_complete_leaves_nothing() {
        let registry = CleanupRegistry::new();
        assert!(registry.is_empty());

        registry.register(entry(16385, "public.t"));
        assert!(!registry.is_empty());

        registry.complete(16385);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_complete_is_idempotent() {
        let registry = CleanupRegistry::new();
        registry.register(entry(16385, "public.t"));

        registry.complete(16385);
        registry.complete(16385);
        registry.complete(99999);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_outstanding_is_newest_first() {
        let registry = CleanupRegistry::new();
        registry.register(entry(1, "public.a"));
        registry.register(entry(2, "public.b"));

        let outstanding = registry.outstanding();
        assert_eq!(outstanding.len(), 2);
        assert_eq!(outstanding[0].target_oid, 2);
        assert_eq!(outstanding[1].target_oid, 1);
    }

    #[test]
    fn test_clones_share_state() {
        let registry = CleanupRegistry::new();
        let shared = registry.clone();

        registry.register(entry(16385, "public.t"));
        assert!(!shared.is_empty());

        shared.complete(16385);
        assert!(registry.is_empty());
    }
}
