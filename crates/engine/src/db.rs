use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use feedsync_core::config::PostgresConfig;

use crate::error::StoreError;

/// Connect to PostgreSQL and apply pending migrations.
pub async fn init_pg_pool(config: &PostgresConfig) -> Result<PgPool, StoreError> {
    if !config.is_configured() {
        warn!("PG_USERNAME not set, connecting as the default postgres user");
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .connect(&config.connection_string())
        .await?;
    info!(host = %config.host, database = %config.database, "PostgreSQL connected");

    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}
