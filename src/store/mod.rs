//! Storage abstraction for Clause Haus.
//!
//! The [`Store`] trait covers the three record families the service keeps:
//! jobs, content-cache entries and the statute corpus with its vectors.
//! [`SqliteStore`](sqlite::SqliteStore) is the durable backend;
//! [`InMemoryStore`](memory::InMemoryStore) backs tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::models::{CacheEntry, Job, JobStatus, StatuteSection};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_job`](Store::insert_job) | Persist a new job |
/// | [`update_job`](Store::update_job) | Overwrite a job's mutable fields |
/// | [`transition_job`](Store::transition_job) | Compare-and-set a job's status |
/// | [`insert_cache_entry_if_absent`](Store::insert_cache_entry_if_absent) | First-committer-wins cache insert |
/// | [`nearest_sections`](Store::nearest_sections) | Statute sections closest to a vector |
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<()>;

    /// Overwrite status, payment fields, fingerprint, result and error.
    async fn update_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    async fn find_job_by_payment(&self, payment_ref: &str) -> Result<Option<Job>>;

    /// Move a job from `from` to `to`.
    ///
    /// Returns `false` (and changes nothing) if the job is missing or no
    /// longer in `from`.
    async fn transition_job(&self, id: Uuid, from: JobStatus, to: JobStatus) -> Result<bool>;

    async fn get_cache_entry(&self, fingerprint: &str) -> Result<Option<CacheEntry>>;

    /// Record a read of a cache entry. Advisory only.
    async fn touch_cache_entry(&self, fingerprint: &str, at: i64) -> Result<()>;

    /// Insert unless an entry with the same fingerprint exists.
    ///
    /// Returns whether this call inserted. Atomic across concurrent callers.
    async fn insert_cache_entry_if_absent(&self, entry: &CacheEntry) -> Result<bool>;

    /// Insert or replace a statute section with its embedding.
    async fn upsert_section(&self, section: &StatuteSection, embedding: &[f32]) -> Result<()>;

    /// Stored checksum per section number.
    async fn section_checksums(&self) -> Result<HashMap<String, String>>;

    /// Up to `limit` sections ordered by decreasing cosine similarity to
    /// `query`, each with its stored vector.
    async fn nearest_sections(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(StatuteSection, Vec<f32>)>>;
}

/// Brute-force nearest-neighbour selection shared by both backends.
pub(crate) fn nearest_by_cosine(
    query: &[f32],
    rows: Vec<(StatuteSection, Vec<f32>)>,
    limit: usize,
) -> Vec<(StatuteSection, Vec<f32>)> {
    let mut scored: Vec<(f32, (StatuteSection, Vec<f32>))> = rows
        .into_iter()
        .map(|row| (cosine_similarity(query, &row.1), row))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored.into_iter().map(|(_, row)| row).collect()
}
