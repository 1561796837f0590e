//! Orchestrator configuration.
//!
//! Everything is read from the environment once at startup and then passed to
//! constructors explicitly; nothing below the binary reads env vars itself.

use std::path::PathBuf;
use std::time::Duration;

use sqlx::postgres::PgConnectOptions;

use crate::jobs::JobKind;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Connection settings for the platform database and the maintenance database
/// used for `CREATE/DROP DATABASE`.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub maintenance_database: String,
    pub pool_size: u32,
    /// Applied with `SET LOCAL statement_timeout` to every record-store transaction.
    pub statement_timeout: Duration,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("maintenance_database", &self.maintenance_database)
            .field("pool_size", &self.pool_size)
            .field("statement_timeout", &self.statement_timeout)
            .finish()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "postgres".to_string(),
            port: 5432,
            user: "odoo".to_string(),
            password: "odoo_password".to_string(),
            database: "odoo_saas".to_string(),
            maintenance_database: "postgres".to_string(),
            pool_size: 10,
            statement_timeout: Duration::from_millis(30_000),
        }
    }
}

impl DatabaseConfig {
    /// Options for the platform database (tenant records, jobs, audit).
    pub fn connect_options(&self) -> PgConnectOptions {
        self.options_for(&self.database)
    }

    /// Options for the maintenance database where DDL runs.
    pub fn maintenance_options(&self) -> PgConnectOptions {
        self.options_for(&self.maintenance_database)
    }

    fn options_for(&self, database: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(database)
    }
}

/// Top-level configuration for the lifecycle orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub database: DatabaseConfig,
    pub backup_dir: PathBuf,
    pub worker_concurrency: usize,
    pub worker_name: String,
    /// Lease for PROVISION and DELETE jobs.
    pub provision_lease: Duration,
    /// Lease for BACKUP and RESTORE jobs.
    pub backup_lease: Duration,
    pub dump_timeout: Duration,
    pub ddl_timeout: Duration,
    pub reaper_interval: Duration,
    pub dequeue_wait: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            backup_dir: PathBuf::from("/tmp/backups"),
            worker_concurrency: 4,
            worker_name: format!("worker-{}", std::process::id()),
            provision_lease: Duration::from_secs(1800),
            backup_lease: Duration::from_secs(3600),
            dump_timeout: Duration::from_secs(3600),
            ddl_timeout: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(30),
            dequeue_wait: Duration::from_secs(5),
        }
    }
}

impl OrchestratorConfig {
    /// Load from process environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup (tests pass a map here).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let db = defaults.database.clone();

        let password = lookup("PG_PASSWORD").unwrap_or_else(|| {
            tracing::warn!("PG_PASSWORD not set; using insecure dev default");
            db.password.clone()
        });

        let database = DatabaseConfig {
            host: lookup("PG_HOST").unwrap_or(db.host),
            port: parse(&lookup, "PG_PORT", db.port)?,
            user: lookup("PG_USER").unwrap_or(db.user),
            password,
            database: lookup("PG_DATABASE").unwrap_or(db.database),
            maintenance_database: lookup("PG_MAINTENANCE_DB").unwrap_or(db.maintenance_database),
            pool_size: parse(&lookup, "PG_POOL_SIZE", db.pool_size)?,
            statement_timeout: Duration::from_millis(parse(
                &lookup,
                "STATEMENT_TIMEOUT_MS",
                db.statement_timeout.as_millis() as u64,
            )?),
        };

        let worker_concurrency = parse(&lookup, "WORKER_CONCURRENCY", defaults.worker_concurrency)?;
        if worker_concurrency == 0 {
            return Err(ConfigError::Invalid {
                var: "WORKER_CONCURRENCY",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            database,
            backup_dir: lookup("BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.backup_dir),
            worker_concurrency,
            worker_name: lookup("WORKER_NAME").unwrap_or(defaults.worker_name),
            provision_lease: secs(&lookup, "LEASE_PROVISION_SECS", defaults.provision_lease)?,
            backup_lease: secs(&lookup, "LEASE_BACKUP_SECS", defaults.backup_lease)?,
            dump_timeout: secs(&lookup, "DUMP_TIMEOUT_SECS", defaults.dump_timeout)?,
            ddl_timeout: secs(&lookup, "DDL_TIMEOUT_SECS", defaults.ddl_timeout)?,
            reaper_interval: secs(&lookup, "REAPER_INTERVAL_SECS", defaults.reaper_interval)?,
            dequeue_wait: secs(&lookup, "DEQUEUE_WAIT_SECS", defaults.dequeue_wait)?,
        })
    }

    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    pub fn with_worker_concurrency(mut self, n: usize) -> Self {
        self.worker_concurrency = n;
        self
    }

    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn with_leases(mut self, provision: Duration, backup: Duration) -> Self {
        self.provision_lease = provision;
        self.backup_lease = backup;
        self
    }

    pub fn with_dump_timeout(mut self, timeout: Duration) -> Self {
        self.dump_timeout = timeout;
        self
    }

    pub fn with_ddl_timeout(mut self, timeout: Duration) -> Self {
        self.ddl_timeout = timeout;
        self
    }

    /// Lease duration for a job of the given kind.
    pub fn lease_for(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Provision | JobKind::Delete => self.provision_lease,
            JobKind::Backup | JobKind::Restore => self.backup_lease,
        }
    }
}

fn parse<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}

fn secs<F>(lookup: &F, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse(lookup, var, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.database.host, "postgres");
        assert_eq!(cfg.database.port, 5432);
        assert_eq!(cfg.database.database, "odoo_saas");
        assert_eq!(cfg.backup_dir, PathBuf::from("/tmp/backups"));
        assert_eq!(cfg.lease_for(JobKind::Provision), Duration::from_secs(1800));
        assert_eq!(cfg.lease_for(JobKind::Restore), Duration::from_secs(3600));
        assert_eq!(cfg.ddl_timeout, Duration::from_secs(300));
        assert_eq!(cfg.database.statement_timeout, Duration::from_secs(30));
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = OrchestratorConfig::from_lookup(lookup(&[
            ("PG_HOST", "db.internal"),
            ("PG_PORT", "6543"),
            ("WORKER_CONCURRENCY", "8"),
            ("LEASE_BACKUP_SECS", "60"),
            ("BACKUP_DIR", "/var/backups"),
        ]))
        .unwrap();

        assert_eq!(cfg.database.host, "db.internal");
        assert_eq!(cfg.database.port, 6543);
        assert_eq!(cfg.worker_concurrency, 8);
        assert_eq!(cfg.lease_for(JobKind::Backup), Duration::from_secs(60));
        assert_eq!(cfg.backup_dir, PathBuf::from("/var/backups"));
    }

    #[test]
    fn garbage_is_rejected() {
        let err = OrchestratorConfig::from_lookup(lookup(&[("PG_PORT", "abc")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "PG_PORT",
                value: "abc".to_string()
            }
        );

        assert!(OrchestratorConfig::from_lookup(lookup(&[("WORKER_CONCURRENCY", "0")])).is_err());
    }

    #[test]
    fn debug_redacts_password() {
        let cfg = OrchestratorConfig::default();
        let rendered = format!("{:?}", cfg.database);
        assert!(!rendered.contains("odoo_password"));
    }
}
