//! Schema management for the SQLite metadata store.
//!
//! The migration SQL lives in `migrations/0001_init.sql`; it is embedded at
//! compile time so `--migrate` and in-memory test databases apply the exact
//! same statements.

use sqlx::SqlitePool;

const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Apply the embedded migration statements one by one.
pub async fn apply_migrations(db: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    apply_migrations(&pool).await.expect("migrations apply");
    pool
}
