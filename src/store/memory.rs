//! In-memory [`Store`] implementation for tests.
//!
//! Uses `HashMap` behind `std::sync::RwLock`. Vector search is brute-force
//! cosine similarity over all stored sections.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{now_millis, CacheEntry, Job, JobStatus, StatuteSection};

use super::{nearest_by_cosine, Store};

/// In-memory store for tests and one-shot CLI runs.
#[derive(Default)]
pub struct InMemoryStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    sections: RwLock<HashMap<String, (StatuteSection, Vec<f32>)>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        let mut jobs = write(&self.jobs)?;
        if jobs.contains_key(&job.id) {
            return Err(anyhow!("job {} already exists", job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut jobs = write(&self.jobs)?;
        match jobs.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(anyhow!("job {} not found", job.id)),
        }
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(read(&self.jobs)?.get(&id).cloned())
    }

    async fn find_job_by_payment(&self, payment_ref: &str) -> Result<Option<Job>> {
        Ok(read(&self.jobs)?
            .values()
            .find(|j| j.payment_ref.as_deref() == Some(payment_ref))
            .cloned())
    }

    async fn transition_job(&self, id: Uuid, from: JobStatus, to: JobStatus) -> Result<bool> {
        let mut jobs = write(&self.jobs)?;
        match jobs.get_mut(&id) {
            Some(job) if job.status == from => {
                job.status = to;
                job.updated_at = now_millis();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_cache_entry(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        Ok(read(&self.cache)?.get(fingerprint).cloned())
    }

    async fn touch_cache_entry(&self, fingerprint: &str, at: i64) -> Result<()> {
        if let Some(entry) = write(&self.cache)?.get_mut(fingerprint) {
            entry.last_accessed_at = at;
        }
        Ok(())
    }

    async fn insert_cache_entry_if_absent(&self, entry: &CacheEntry) -> Result<bool> {
        let mut cache = write(&self.cache)?;
        if cache.contains_key(&entry.fingerprint) {
            return Ok(false);
        }
        cache.insert(entry.fingerprint.clone(), entry.clone());
        Ok(true)
    }

    async fn upsert_section(&self, section: &StatuteSection, embedding: &[f32]) -> Result<()> {
        write(&self.sections)?.insert(
            section.section_number.clone(),
            (section.clone(), embedding.to_vec()),
        );
        Ok(())
    }

    async fn section_checksums(&self) -> Result<HashMap<String, String>> {
        Ok(read(&self.sections)?
            .iter()
            .map(|(number, (section, _))| (number.clone(), section.checksum.clone()))
            .collect())
    }

    async fn nearest_sections(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(StatuteSection, Vec<f32>)>> {
        let rows: Vec<_> = read(&self.sections)?.values().cloned().collect();
        Ok(nearest_by_cosine(query, rows, limit))
    }
}
