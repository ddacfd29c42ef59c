//! Postgres connection pool and schema migrations.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::DbError;

/// Shared Postgres pool.
pub type DbPool = PgPool;

/// Connect with at most `max_connections` pooled connections.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, DbError> {
    info!("connecting to database (max_connections={})", max_connections);
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply the migrations embedded from `<workspace>/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!("applying execution-state migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
