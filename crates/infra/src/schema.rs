//! Postgres schema for tenants, backups, audit logs and lifecycle jobs.

use sqlx::PgPool;
use tracing::info;

/// Ordered migrations; each script is idempotent.
pub const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_tenant_lifecycle",
    include_str!("../migrations/0001_tenant_lifecycle.sql"),
)];

/// Apply every migration in order.
pub async fn apply(pool: &PgPool) -> Result<(), sqlx::Error> {
    for (name, sql) in MIGRATIONS {
        sqlx::raw_sql(sql).execute(pool).await?;
        info!(migration = name, "schema migration applied");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_every_table() {
        let sql = MIGRATIONS[0].1;
        for table in ["tenants", "backups", "audit_logs", "lifecycle_jobs"] {
            assert!(
                sql.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "missing table {table}"
            );
        }
    }

    #[test]
    fn suspended_at_invariant_is_enforced_by_the_database() {
        assert!(MIGRATIONS[0].1.contains("tenants_suspended_at_iff_suspended"));
    }
}
