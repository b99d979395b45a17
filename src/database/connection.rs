use crate::config::DatabaseSettings;
use crate::error::{EngineError, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

/// Build a connection pool from database settings.
pub async fn connect(settings: &DatabaseSettings) -> Result<PgPool> {
    if settings.url.is_empty() {
        return Err(EngineError::Configuration(
            crate::config::ConfigurationError::missing_field("database.url"),
        ));
    }

    let pool = PgPoolOptions::new()
        .max_connections(settings.pool)
        .acquire_timeout(Duration::from_secs(settings.checkout_timeout_seconds))
        .connect(&settings.url)
        .await
        .map_err(|e| EngineError::infrastructure(format!("database connect failed: {e}")))?;

    info!(pool_size = settings.pool, "database pool established");
    Ok(pool)
}
