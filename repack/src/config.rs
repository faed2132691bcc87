//! Connection configuration for the target Postgres cluster.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio_postgres::Config;

use crate::version::PROGRAM_NAME;

/// Connection parameters shared by every session the client opens.
///
/// The database name is deliberately not part of this struct: a single run
/// may open sessions against several databases (the all-databases driver and
/// the cleanup path both reconnect), so the database is chosen per session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PgConnectionConfig {
    /// Hostname or IP address of the Postgres server.
    pub host: String,
    /// Port number on which the Postgres server is listening.
    pub port: u16,
    /// Username for authenticating with the Postgres server.
    pub username: String,
    /// Password for the specified user. Redacted in debug output.
    #[serde(default)]
    pub password: Option<SecretString>,
}

impl PgConnectionConfig {
    /// Creates `tokio_postgres` connection options for the given database.
    pub fn with_db(&self, dbname: &str) -> Config {
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.username)
            .dbname(dbname)
            .application_name(PROGRAM_NAME);

        if let Some(password) = &self.password {
            config.password(password.expose_secret());
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_postgres::config::Host;

    fn test_config() -> PgConnectionConfig {
        PgConnectionConfig {
            host: "db.example.com".to_string(),
            port: 5433,
            username: "repacker".to_string(),
            password: Some(SecretString::from("hunter2".to_string())),
        }
    }

    #[test]
    fn test_with_db_carries_all_parameters() {
        let config = test_config().with_db("appdb");

        assert_eq!(
            config.get_hosts(),
            &[Host::Tcp("db.example.com".to_string())]
        );
        assert_eq!(config.get_ports(), &[5433]);
        assert_eq!(config.get_user(), Some("repacker"));
        assert_eq!(config.get_dbname(), Some("appdb"));
        assert_eq!(config.get_password(), Some("hunter2".as_bytes()));
        assert_eq!(config.get_application_name(), Some("pg_repack"));
    }

    #[test]
    fn test_with_db_without_password() {
        let mut source = test_config();
        source.password = None;

        let config = source.with_db("appdb");
        assert_eq!(config.get_password(), None);
    }

    #[test]
    fn test_database_is_per_session() {
        let source = test_config();
        assert_eq!(source.with_db("postgres").get_dbname(), Some("postgres"));
        assert_eq!(source.with_db("appdb").get_dbname(), Some("appdb"));
    }
}
