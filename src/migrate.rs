use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Jobs and their payment linkage
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            identifier_from_purchaser TEXT,
            input_data TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL,
            payment_ref TEXT,
            payment_status TEXT,
            fingerprint TEXT,
            result TEXT,
            error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Content cache keyed by document fingerprint
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_cache (
            fingerprint TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            chunks_json TEXT NOT NULL,
            embeddings_json TEXT NOT NULL,
            clauses_json TEXT NOT NULL,
            report TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_accessed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Statute reference corpus
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS statute_sections (
            section_number TEXT PRIMARY KEY,
            book TEXT,
            book_title TEXT,
            division TEXT,
            division_title TEXT,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            contextual_text TEXT NOT NULL,
            checksum TEXT NOT NULL,
            embedding BLOB NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_payment_ref ON jobs(payment_ref)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
        .execute(pool)
        .await?;

    Ok(())
}
