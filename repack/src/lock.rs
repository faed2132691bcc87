//! Exclusive relation locking with bounded waits and escalation.
//!
//! Competing sessions are given a fair chance: each attempt queues the lock
//! request behind a short statement timeout, so the request enters and
//! leaves the lock queue instead of parking there and starving other
//! waiters. Once the configured deadline has passed, competing backends are
//! asked to cancel their current statement; once twice the deadline has
//! passed they are terminated outright, provided the server is recent
//! enough to support it.

use std::num::NonZeroI32;
use std::time::{Duration, Instant};

use tokio_postgres::error::SqlState;
use tracing::{debug, warn};

use crate::error::{RepackError, RepackResult};
use crate::session::PgSession;
use crate::version::{POSTGRES_84, meets_version};

const SQL_CANCEL_COMPETING: &str = "SELECT pg_cancel_backend(pid) FROM pg_locks \
     WHERE locktype = 'relation' AND relation = $1 AND pid <> pg_backend_pid()";

const SQL_TERMINATE_COMPETING: &str = "SELECT pg_terminate_backend(pid) FROM pg_locks \
     WHERE locktype = 'relation' AND relation = $1 AND pid <> pg_backend_pid()";

/// What to do about competing lock holders on this attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationAction {
    /// Keep waiting politely.
    Wait,
    /// Ask competing backends to cancel their current statement.
    Cancel,
    /// Terminate competing backends.
    Terminate,
}

impl EscalationAction {
    /// Decides the escalation step as a pure function of elapsed wait time,
    /// the configured deadline and the server version.
    ///
    /// Termination needs `pg_terminate_backend`, available from Postgres 8.4
    /// onwards; older servers stay at cancellation however long the wait.
    pub fn decide(
        elapsed: Duration,
        wait_timeout: Duration,
        server_version: Option<NonZeroI32>,
    ) -> Self {
        if elapsed <= wait_timeout {
            return EscalationAction::Wait;
        }

        if meets_version(server_version, POSTGRES_84) && elapsed > wait_timeout * 2 {
            EscalationAction::Terminate
        } else {
            EscalationAction::Cancel
        }
    }
}

/// Statement timeout for the given 1-based lock attempt, in milliseconds.
///
/// Grows linearly and caps at one second, so early attempts return quickly
/// while later ones still leave the lock queue often enough for other
/// waiters to make progress.
pub(crate) fn attempt_timeout_ms(attempt: u32) -> u32 {
    (attempt * 100).min(1000)
}

/// Classification of a failed lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockErrorClass {
    /// The statement timeout fired; roll back and try again.
    RetryableCancel,
    /// Anything else; the session state is unknown and the run must stop.
    Fatal,
}

pub(crate) fn classify_lock_error(code: Option<&SqlState>) -> LockErrorClass {
    match code {
        Some(code) if *code == SqlState::QUERY_CANCELED => LockErrorClass::RetryableCancel,
        _ => LockErrorClass::Fatal,
    }
}

/// Acquires the exclusive relation lock encoded in `lock_query`, leaving the
/// session inside an open READ COMMITTED transaction that holds the lock.
///
/// Returns an error only for failures other than lock contention; contention
/// is retried indefinitely under the escalation policy.
pub async fn lock_exclusive(
    session: &PgSession,
    relation_oid: u32,
    lock_query: &str,
    wait_timeout: Duration,
) -> RepackResult<()> {
    let start = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        session.command("BEGIN ISOLATION LEVEL READ COMMITTED").await?;

        match EscalationAction::decide(start.elapsed(), wait_timeout, session.server_version()) {
            EscalationAction::Wait => {}
            EscalationAction::Cancel => {
                warn!(relation = relation_oid, "canceling conflicted backends");
                session.query(SQL_CANCEL_COMPETING, &[&relation_oid]).await?;
            }
            EscalationAction::Terminate => {
                warn!(relation = relation_oid, "terminating conflicted backends");
                session
                    .query(SQL_TERMINATE_COMPETING, &[&relation_oid])
                    .await?;
            }
        }

        let timeout_ms = attempt_timeout_ms(attempt);
        session
            .command(&format!("SET LOCAL statement_timeout = {timeout_ms}"))
            .await?;

        match session.try_command(lock_query).await {
            Ok(()) => break,
            Err(err) => match classify_lock_error(err.code()) {
                LockErrorClass::RetryableCancel => {
                    debug!(relation = relation_oid, attempt, "lock attempt timed out");
                    session.command("ROLLBACK").await?;
                }
                LockErrorClass::Fatal => return Err(RepackError::LockFailed(err)),
            },
        }
    }

    // The transaction stays open with the lock held; only the session-level
    // timeout override is undone.
    session.command("RESET statement_timeout").await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::extract_server_version;

    const WAIT: Duration = Duration::from_secs(60);

    fn modern() -> Option<NonZeroI32> {
        extract_server_version("16.2")
    }

    fn pre_84() -> Option<NonZeroI32> {
        extract_server_version("8.3.23")
    }

    #[test]
    fn test_waits_until_deadline() {
        assert_eq!(
            EscalationAction::decide(Duration::from_secs(0), WAIT, modern()),
            EscalationAction::Wait
        );
        assert_eq!(
            EscalationAction::decide(Duration::from_secs(60), WAIT, modern()),
            EscalationAction::Wait
        );
    }

    #[test]
    fn test_cancels_past_deadline() {
        assert_eq!(
            EscalationAction::decide(Duration::from_secs(61), WAIT, modern()),
            EscalationAction::Cancel
        );
        assert_eq!(
            EscalationAction::decide(Duration::from_secs(120), WAIT, modern()),
            EscalationAction::Cancel
        );
    }

    #[test]
    fn test_terminates_past_doubled_deadline() {
        assert_eq!(
            EscalationAction::decide(Duration::from_secs(121), WAIT, modern()),
            EscalationAction::Terminate
        );
    }

    #[test]
    fn test_old_servers_never_terminate() {
        assert_eq!(
            EscalationAction::decide(Duration::from_secs(300), WAIT, pre_84()),
            EscalationAction::Cancel
        );
        assert_eq!(
            EscalationAction::decide(Duration::from_secs(300), WAIT, None),
            EscalationAction::Cancel
        );
    }

    #[test]
    fn test_timeout_ladder_grows_then_caps() {
        assert_eq!(attempt_timeout_ms(1), 100);
        assert_eq!(attempt_timeout_ms(2), 200);
        assert_eq!(attempt_timeout_ms(9), 900);
        assert_eq!(attempt_timeout_ms(10), 1000);
        assert_eq!(attempt_timeout_ms(11), 1000);
        assert_eq!(attempt_timeout_ms(1000), 1000);
    }

    #[test]
    fn test_only_query_cancel_is_retryable() {
        assert_eq!(
            classify_lock_error(Some(&SqlState::QUERY_CANCELED)),
            LockErrorClass::RetryableCancel
        );
        assert_eq!(
            classify_lock_error(Some(&SqlState::ADMIN_SHUTDOWN)),
            LockErrorClass::Fatal
        );
        assert_eq!(classify_lock_error(None), LockErrorClass::Fatal);
    }
}
