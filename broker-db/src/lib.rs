//! Database lifecycle for the broker: schema migrations, a readiness report
//! and administrator bootstrap.

mod init;

pub use init::init_admin_account;

use broker_domain::TaskStatus;
use sqlx::migrate::Migrator;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

/// Result type for DB operations.
pub type Result<T> = std::result::Result<T, anyhow::Error>;

/// Migrations embedded from the workspace `migrations` directory.
static MIGRATOR: Migrator = sqlx::migrate!("../migrations");

/// Postgres code for `undefined_table`.
const UNDEFINED_TABLE: &str = "42P01";

/// Apply pending migrations. Already-applied ones are skipped.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await?;
    info!(known = MIGRATOR.iter().count(), "Schema up to date");
    Ok(())
}

/// Snapshot of a broker database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbStatus {
    /// Highest applied migration
    pub schema_version: Option<i64>,
    /// Migrations embedded in this build but not applied
    pub pending_migrations: usize,
    pub accounts: i64,
    /// Tasks in `PendingAudit` or `PendingExecution`
    pub waiting_tasks: i64,
    /// Tasks in `Processing`; after a crash these are what recovery picks up
    pub processing_tasks: i64,
}

/// Check connectivity and report schema and backlog.
///
/// A database without the migration table reports every migration as
/// pending and zero counts.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let applied: Vec<i64> = match sqlx::query_scalar(
        "SELECT version FROM _sqlx_migrations WHERE success ORDER BY version",
    )
    .fetch_all(pool)
    .await
    {
        Ok(versions) => versions,
        Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(UNDEFINED_TABLE) => {
            warn!("Migration table not found (run migrations first)");
            Vec::new()
        },
        Err(e) => return Err(e.into()),
    };

    let mut report = DbStatus {
        schema_version: applied.last().copied(),
        pending_migrations: MIGRATOR
            .iter()
            .filter(|m| m.migration_type.is_up_migration() && !applied.contains(&m.version))
            .count(),
        ..DbStatus::default()
    };
    if applied.is_empty() {
        return Ok(report);
    }

    report.accounts = sqlx::query_scalar("SELECT COUNT(*) FROM accounts").fetch_one(pool).await?;
    let row = sqlx::query(
        "SELECT COUNT(*) FILTER (WHERE status IN ($1, $2)) AS waiting, \
                COUNT(*) FILTER (WHERE status = $3) AS processing \
         FROM tasks",
    )
    .bind(TaskStatus::PendingAudit.code())
    .bind(TaskStatus::PendingExecution.code())
    .bind(TaskStatus::Processing.code())
    .fetch_one(pool)
    .await?;
    report.waiting_tasks = row.try_get("waiting")?;
    report.processing_tasks = row.try_get("processing")?;

    if report.pending_migrations > 0 {
        warn!(pending = report.pending_migrations, "Database schema is behind this build");
    }
    info!(
        schema_version = report.schema_version,
        accounts = report.accounts,
        waiting_tasks = report.waiting_tasks,
        processing_tasks = report.processing_tasks,
        "Database ready"
    );
    Ok(report)
}
