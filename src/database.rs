use sqlx::{postgres::PgPoolOptions, Pool, Postgres};

use crate::config::AppConfig;

pub type Database = Pool<Postgres>;

/// Bounded pool: once every connection is checked out, callers queue until
/// `acquire_timeout` instead of opening more connections.
pub async fn create_database_pool(config: &AppConfig) -> Result<Database, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(config.db_acquire_timeout())
        .connect(&config.database_url)
        .await?;

    // Test the connection
    sqlx::query("SELECT 1").fetch_one(&pool).await?;

    log::info!(
        "Connected to database (pool size {})",
        config.db_max_connections
    );
    Ok(pool)
}

pub async fn run_migrations(db: &Database) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(db).await
}
