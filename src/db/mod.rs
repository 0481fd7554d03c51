mod error;
pub mod repos;
pub mod sqlite;

#[cfg(test)]
pub mod tests;

use std::sync::Arc;

pub use error::{DbError, DbResult};
pub use repos::*;

use crate::config::DatabaseConfig;

/// Cached repository trait objects, created once at startup.
struct CachedRepos {
    plans: Arc<dyn PlanRepo>,
    assignments: Arc<dyn AssignmentRepo>,
    usage_counters: Arc<dyn UsageCounterRepo>,
    vouchers: Arc<dyn VoucherRepo>,
    request_logs: Arc<dyn RequestLogRepo>,
    request_aggregates: Arc<dyn RequestAggregateRepo>,
}

/// SQLite-backed database pool.
///
/// Repositories are cached at construction time to avoid allocation on each
/// access.
pub struct DbPool {
    pool: sqlx::SqlitePool,
    repos: CachedRepos,
}

impl DbPool {
    /// Create a DbPool from an existing SQLite pool.
    /// Primarily useful for testing.
    pub fn from_sqlite(pool: sqlx::SqlitePool) -> Self {
        let repos = CachedRepos {
            plans: Arc::new(sqlite::SqlitePlanRepo::new(pool.clone())),
            assignments: Arc::new(sqlite::SqliteAssignmentRepo::new(pool.clone())),
            usage_counters: Arc::new(sqlite::SqliteUsageCounterRepo::new(pool.clone())),
            vouchers: Arc::new(sqlite::SqliteVoucherRepo::new(pool.clone())),
            request_logs: Arc::new(sqlite::SqliteRequestLogRepo::new(pool.clone())),
            request_aggregates: Arc::new(sqlite::SqliteRequestAggregateRepo::new(pool.clone())),
        };
        DbPool { pool, repos }
    }

    /// Create a database pool from configuration.
    pub async fn from_config(config: &DatabaseConfig) -> DbResult<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(
                sqlx::sqlite::SqliteConnectOptions::new()
                    .filename(&config.path)
                    .create_if_missing(config.create_if_missing)
                    .journal_mode(if config.wal_mode {
                        sqlx::sqlite::SqliteJournalMode::Wal
                    } else {
                        sqlx::sqlite::SqliteJournalMode::Delete
                    })
                    .busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms)),
            )
            .await?;

        Ok(Self::from_sqlite(pool))
    }

    /// Run database migrations using sqlx's migration runner.
    /// This automatically creates and manages a _sqlx_migrations table.
    pub async fn run_migrations(&self) -> DbResult<()> {
        tracing::info!("Running SQLite migrations");
        sqlx::migrate!("./migrations_sqlx/sqlite")
            .run(&self.pool)
            .await?;
        tracing::info!("SQLite migrations completed successfully");
        Ok(())
    }

    pub fn plans(&self) -> Arc<dyn PlanRepo> {
        Arc::clone(&self.repos.plans)
    }

    pub fn assignments(&self) -> Arc<dyn AssignmentRepo> {
        Arc::clone(&self.repos.assignments)
    }

    pub fn usage_counters(&self) -> Arc<dyn UsageCounterRepo> {
        Arc::clone(&self.repos.usage_counters)
    }

    pub fn vouchers(&self) -> Arc<dyn VoucherRepo> {
        Arc::clone(&self.repos.vouchers)
    }

    pub fn request_logs(&self) -> Arc<dyn RequestLogRepo> {
        Arc::clone(&self.repos.request_logs)
    }

    pub fn request_aggregates(&self) -> Arc<dyn RequestAggregateRepo> {
        Arc::clone(&self.repos.request_aggregates)
    }

    /// Get a reference to the underlying pool for database-specific
    /// operations.
    pub fn pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }

    /// Health check for database connectivity.
    pub async fn health_check(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
