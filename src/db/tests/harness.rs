//! Test harness for database repository testing.
//!
//! In-memory SQLite databases with the real migrations, so tests exercise
//! the production schema.

use sqlx::SqlitePool;

use crate::db::DbPool;

/// Create an in-memory SQLite pool for testing.
///
/// A single connection serializes writers, which makes concurrency tests
/// deterministic while still exercising the atomic SQL paths.
pub async fn create_sqlite_pool() -> SqlitePool {
    sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool")
}

/// Run migrations on the pool.
pub async fn run_migrations(pool: &SqlitePool) {
    sqlx::migrate!("./migrations_sqlx/sqlite")
        .run(pool)
        .await
        .expect("Failed to run SQLite migrations");
}

/// Migrated pool wrapped in the repo facade.
pub async fn create_db() -> DbPool {
    let pool = create_sqlite_pool().await;
    run_migrations(&pool).await;
    DbPool::from_sqlite(pool)
}
