//! pg_repack command line front end.
//!
//! Parses the target selection and ordering flags, initializes logging, and
//! hands off to the repack orchestrator on a single-threaded runtime. On
//! SIGINT/SIGTERM the run is abandoned without touching the database; a
//! later run's drop call removes anything left behind.

use std::process;
use std::time::Duration;

use clap::{ArgGroup, Parser};
use repack::{
    CleanupRegistry, DatabaseOutcome, OrderBy, PgConnectionConfig, RepackSettings,
    repack_all_databases, repack_database,
};
use secrecy::SecretString;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Reorganizes PostgreSQL tables online with minimal locking.
#[derive(Parser, Debug)]
#[command(name = "pg_repack", version)]
#[command(about = "Reorganizes PostgreSQL tables online with minimal locking")]
#[command(group(ArgGroup::new("scope").args(["all", "table"])))]
struct Args {
    /// Repack every database that allows connections
    #[arg(short = 'a', long)]
    all: bool,

    /// Repack the given table only (qualified name)
    #[arg(short = 't', long, value_name = "TABLE")]
    table: Option<String>,

    /// Do vacuum full instead of cluster (no ordering)
    #[arg(short = 'n', long)]
    no_order: bool,

    /// Order rows by the given columns instead of the cluster key
    #[arg(short = 'o', long, value_name = "COLUMNS")]
    order_by: Option<String>,

    /// Seconds to wait before canceling competing backends on conflict
    #[arg(short = 'T', long, value_name = "SECS", default_value_t = 60)]
    wait_timeout: u64,

    /// Skip the trailing ANALYZE
    #[arg(short = 'Z', long)]
    no_analyze: bool,

    /// Database server host
    #[arg(long, env = "PGHOST", default_value = "localhost")]
    host: String,

    /// Database server port
    #[arg(short = 'p', long, env = "PGPORT", default_value_t = 5432)]
    port: u16,

    /// Database user name
    #[arg(short = 'U', long, env = "PGUSER", default_value = "postgres")]
    username: String,

    /// Database to repack (ignored with --all)
    #[arg(value_name = "DBNAME", env = "PGDATABASE")]
    dbname: Option<String>,
}

/// Derives the row ordering from the `--no-order` and `--order-by` flags.
///
/// `--no-order` wins over `--order-by`, and an explicitly empty column list
/// also means no ordering; only the absence of both flags selects cluster
/// mode.
fn ordering_from_args(no_order: bool, order_by: Option<&str>) -> OrderBy {
    if no_order {
        return OrderBy::Unordered;
    }

    match order_by {
        Some(columns) if !columns.trim().is_empty() => OrderBy::Columns(columns.to_string()),
        Some(_) => OrderBy::Unordered,
        None => OrderBy::ClusterKey,
    }
}

fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let args = Args::parse();

    // The orchestration is strictly sequential; one thread is all it needs.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    if let Err(err) = runtime.block_on(run(args)) {
        error!("{err:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let settings = RepackSettings {
        ordering: ordering_from_args(args.no_order, args.order_by.as_deref()),
        wait_timeout: Duration::from_secs(args.wait_timeout),
        analyze: !args.no_analyze,
    };

    let config = PgConnectionConfig {
        host: args.host.clone(),
        port: args.port,
        username: args.username.clone(),
        password: std::env::var("PGPASSWORD").ok().map(SecretString::from),
    };

    let cleanup = CleanupRegistry::new();
    let registry = cleanup.clone();

    let repack = async {
        if args.all {
            repack_all_databases(&config, &settings, &cleanup).await?;
        } else {
            let dbname = args
                .dbname
                .clone()
                .unwrap_or_else(|| args.username.clone());
            let outcome =
                repack_database(&config, &dbname, args.table.as_deref(), &settings, &cleanup)
                    .await?;
            if let DatabaseOutcome::Skipped(reason) = outcome {
                anyhow::bail!("{reason}");
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        result = repack => result,
        _ = shutdown_signal() => {
            // The connection may be mid-statement; report and get out
            // without further database calls.
            registry.fatal_banner();
            anyhow::bail!("terminated by signal");
        }
    }
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("sigint (ctrl+c) received, aborting repack");
        }
        _ = sigterm.recv() => {
            info!("sigterm received, aborting repack");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_all_and_table_conflict() {
        let err = Args::try_parse_from(["pg_repack", "--all", "--table", "public.t", "mydb"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["pg_repack", "mydb"]).unwrap();
        assert!(!args.all);
        assert_eq!(args.table, None);
        assert!(!args.no_order);
        assert_eq!(args.order_by, None);
        assert_eq!(args.wait_timeout, 60);
        assert!(!args.no_analyze);
        assert_eq!(args.dbname.as_deref(), Some("mydb"));
    }

    #[test]
    fn test_short_flags() {
        let args =
            Args::try_parse_from(["pg_repack", "-n", "-T", "30", "-Z", "-t", "s.t", "mydb"])
                .unwrap();
        assert!(args.no_order);
        assert_eq!(args.wait_timeout, 30);
        assert!(args.no_analyze);
        assert_eq!(args.table.as_deref(), Some("s.t"));
    }

    #[test]
    fn test_ordering_cluster_mode_by_default() {
        assert_eq!(ordering_from_args(false, None), OrderBy::ClusterKey);
    }

    #[test]
    fn test_ordering_no_order_wins() {
        assert_eq!(ordering_from_args(true, None), OrderBy::Unordered);
        assert_eq!(ordering_from_args(true, Some("id")), OrderBy::Unordered);
    }

    #[test]
    fn test_ordering_user_columns() {
        assert_eq!(
            ordering_from_args(false, Some("id DESC, v")),
            OrderBy::Columns("id DESC, v".to_string())
        );
    }

    #[test]
    fn test_ordering_empty_columns_mean_unordered() {
        assert_eq!(ordering_from_args(false, Some("")), OrderBy::Unordered);
        assert_eq!(ordering_from_args(false, Some("  ")), OrderBy::Unordered);
    }
}
