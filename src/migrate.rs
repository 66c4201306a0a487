//! Schema creation for the case table and the index registry.
//!
//! Per-prefix output tables (`{PREFIX}_SUMMARIES`, `{PREFIX}_CASES`) and the
//! FTS5 indexes are created on demand by [`crate::store::sqlite::SqliteStore`].

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create every base table. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS support_cases (
            case_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT '',
            last_comment TEXT NOT NULL DEFAULT '',
            category TEXT NOT NULL,
            date_created TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_indexes (
            name TEXT PRIMARY KEY,
            source_table TEXT NOT NULL,
            column_name TEXT NOT NULL,
            target_lag TEXT NOT NULL,
            attributes_json TEXT NOT NULL DEFAULT '[]',
            backing_query TEXT NOT NULL,
            refreshed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_support_cases_date ON support_cases(date_created DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_support_cases_category ON support_cases(category)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// `digest init`: connect and create the schema.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}
