use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::AccountConfig;

/// Connects to Postgres and applies the embedded migrations.
pub async fn connect(config: &AccountConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("run migrations")?;

    Ok(pool)
}
