//! SQLite-backed [`Store`] implementation.
//!
//! Jobs and cache entries keep their list-valued fields as JSON text;
//! statute embeddings are stored as little-endian `f32` blobs. Timestamps
//! are Unix milliseconds.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{now_millis, CacheEntry, Job, JobStatus, PaymentStatus, StatuteSection};

use super::{nearest_by_cosine, Store};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const JOB_COLUMNS: &str = "id, identifier_from_purchaser, input_data, status, payment_ref, \
     payment_status, fingerprint, result, error, created_at, updated_at";

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let id: String = row.try_get("id")?;
    let input_data: String = row.try_get("input_data")?;
    let status: String = row.try_get("status")?;
    let payment_status: Option<String> = row.try_get("payment_status")?;

    Ok(Job {
        id: Uuid::parse_str(&id).with_context(|| format!("invalid job id '{}'", id))?,
        identifier_from_purchaser: row.try_get("identifier_from_purchaser")?,
        input_data: serde_json::from_str(&input_data).context("invalid input_data JSON")?,
        status: status.parse()?,
        payment_ref: row.try_get("payment_ref")?,
        payment_status: payment_status
            .map(|s| s.parse::<PaymentStatus>())
            .transpose()?,
        fingerprint: row.try_get("fingerprint")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn section_from_row(row: &SqliteRow) -> Result<(StatuteSection, Vec<f32>)> {
    let blob: Vec<u8> = row.try_get("embedding")?;
    let section = StatuteSection {
        section_number: row.try_get("section_number")?,
        book: row.try_get("book")?,
        book_title: row.try_get("book_title")?,
        division: row.try_get("division")?,
        division_title: row.try_get("division_title")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        contextual_text: row.try_get("contextual_text")?,
        checksum: row.try_get("checksum")?,
    };
    Ok((section, blob_to_vec(&blob)))
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO jobs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            JOB_COLUMNS
        ))
        .bind(job.id.to_string())
        .bind(&job.identifier_from_purchaser)
        .bind(serde_json::to_string(&job.input_data)?)
        .bind(job.status.as_str())
        .bind(&job.payment_ref)
        .bind(job.payment_status.map(|s| s.as_str()))
        .bind(&job.fingerprint)
        .bind(&job.result)
        .bind(&job.error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?,
                payment_ref = ?,
                payment_status = ?,
                fingerprint = ?,
                result = ?,
                error = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(&job.payment_ref)
        .bind(job.payment_status.map(|s| s.as_str()))
        .bind(&job.fingerprint)
        .bind(&job.result)
        .bind(&job.error)
        .bind(job.updated_at)
        .bind(job.id.to_string())
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            anyhow::bail!("job {} not found", job.id);
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn find_job_by_payment(&self, payment_ref: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE payment_ref = ? ORDER BY created_at DESC LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(payment_ref)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn transition_job(&self, id: Uuid, from: JobStatus, to: JobStatus) -> Result<bool> {
        let res = sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(now_millis())
            .bind(id.to_string())
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn get_cache_entry(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            r#"
            SELECT fingerprint, job_id, chunks_json, embeddings_json, clauses_json,
                   report, created_at, last_accessed_at
            FROM analysis_cache WHERE fingerprint = ?
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job_id: String = row.try_get("job_id")?;
        let chunks: String = row.try_get("chunks_json")?;
        let embeddings: String = row.try_get("embeddings_json")?;
        let clauses: String = row.try_get("clauses_json")?;

        Ok(Some(CacheEntry {
            fingerprint: row.try_get("fingerprint")?,
            job_id: Uuid::parse_str(&job_id)?,
            chunks: serde_json::from_str(&chunks)?,
            embeddings: serde_json::from_str(&embeddings)?,
            clauses: serde_json::from_str(&clauses)?,
            report: row.try_get("report")?,
            created_at: row.try_get("created_at")?,
            last_accessed_at: row.try_get("last_accessed_at")?,
        }))
    }

    async fn touch_cache_entry(&self, fingerprint: &str, at: i64) -> Result<()> {
        sqlx::query("UPDATE analysis_cache SET last_accessed_at = ? WHERE fingerprint = ?")
            .bind(at)
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_cache_entry_if_absent(&self, entry: &CacheEntry) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(
            r#"
            INSERT INTO analysis_cache (fingerprint, job_id, chunks_json, embeddings_json,
                                        clauses_json, report, created_at, last_accessed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO NOTHING
            "#,
        )
        .bind(&entry.fingerprint)
        .bind(entry.job_id.to_string())
        .bind(serde_json::to_string(&entry.chunks)?)
        .bind(serde_json::to_string(&entry.embeddings)?)
        .bind(serde_json::to_string(&entry.clauses)?)
        .bind(&entry.report)
        .bind(entry.created_at)
        .bind(entry.last_accessed_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(res.rows_affected() == 1)
    }

    async fn upsert_section(&self, section: &StatuteSection, embedding: &[f32]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO statute_sections (section_number, book, book_title, division,
                                          division_title, title, content, contextual_text,
                                          checksum, embedding, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(section_number) DO UPDATE SET
                book = excluded.book,
                book_title = excluded.book_title,
                division = excluded.division,
                division_title = excluded.division_title,
                title = excluded.title,
                content = excluded.content,
                contextual_text = excluded.contextual_text,
                checksum = excluded.checksum,
                embedding = excluded.embedding,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&section.section_number)
        .bind(&section.book)
        .bind(&section.book_title)
        .bind(&section.division)
        .bind(&section.division_title)
        .bind(&section.title)
        .bind(&section.content)
        .bind(&section.contextual_text)
        .bind(&section.checksum)
        .bind(vec_to_blob(embedding))
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn section_checksums(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT section_number, checksum FROM statute_sections")
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("section_number")?, row.try_get("checksum")?);
        }
        Ok(out)
    }

    async fn nearest_sections(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(StatuteSection, Vec<f32>)>> {
        let rows = sqlx::query(
            r#"
            SELECT section_number, book, book_title, division, division_title, title,
                   content, contextual_text, checksum, embedding
            FROM statute_sections
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let sections = rows
            .iter()
            .map(section_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(nearest_by_cosine(query, sections, limit))
    }
}
