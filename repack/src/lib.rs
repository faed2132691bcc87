//! Client-side orchestration for online PostgreSQL table reorganization.
//!
//! This crate drives the server-side `repack` extension through a
//! seven-phase rebuild per table: a shadow copy of the table is created and
//! populated while a trigger captures concurrent changes into a log table;
//! the log is drained into the shadow table until it converges; then the
//! storage is atomically swapped under the original name. The target is
//! exclusively locked only for the brief setup and swap phases.
//!
//! All server-generated DDL and DML is treated as opaque text. The client's
//! contribution is ordering and isolation of the phases, safe waiting for
//! concurrent writers, lock acquisition under an escalation policy, and
//! teardown of temporary objects on every failure path.

pub mod cleanup;
pub mod config;
pub mod database;
pub mod drain;
pub mod error;
pub mod lock;
pub mod session;
pub mod table;
pub mod target;
pub mod version;

pub use cleanup::{CleanupRegistry, PendingRepack};
pub use config::PgConnectionConfig;
pub use database::{DatabaseOutcome, repack_all_databases, repack_database};
pub use error::{RepackError, RepackResult};
pub use table::RepackSettings;
pub use target::OrderBy;
pub use version::{PROGRAM_NAME, PROGRAM_VERSION};
