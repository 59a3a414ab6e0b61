//! Chunk-to-statute similarity ranking.
//!
//! [`Ranker::rank`] asks the store for a pool of `max(2 * top_k, 20)`
//! nearest sections, rescores them by the dot product of unit-normalized
//! vectors, drops everything below the floor and keeps the best `top_k`.

use std::sync::Arc;

use anyhow::Result;

use crate::config::RetrievalConfig;
use crate::models::SimilarityCandidate;
use crate::store::Store;

const MIN_POOL: usize = 20;

/// Scale `v` to unit length. `None` for empty or zero vectors.
pub fn normalize(v: &[f32]) -> Option<Vec<f32>> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if v.is_empty() || !norm.is_finite() || norm < f32::EPSILON {
        return None;
    }
    Some(v.iter().map(|x| x / norm).collect())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Candidate pool size requested from storage for a given `top_k`.
pub fn pool_size(top_k: usize) -> usize {
    (2 * top_k).max(MIN_POOL)
}

#[derive(Clone)]
pub struct Ranker {
    store: Arc<dyn Store>,
    top_k: usize,
    min_score: f32,
}

impl Ranker {
    pub fn new(store: Arc<dyn Store>, top_k: usize, min_score: f32) -> Self {
        Self {
            store,
            top_k,
            min_score,
        }
    }

    pub fn from_config(store: Arc<dyn Store>, config: &RetrievalConfig) -> Self {
        Self::new(store, config.top_k, config.min_score)
    }

    /// Statute sections most similar to `query`, highest score first.
    pub async fn rank(&self, query: &[f32]) -> Result<Vec<SimilarityCandidate>> {
        self.rank_with(query, self.top_k, self.min_score).await
    }

    pub async fn rank_with(
        &self,
        query: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<SimilarityCandidate>> {
        let Some(query) = normalize(query) else {
            return Ok(Vec::new());
        };
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let pool = self.store.nearest_sections(&query, pool_size(top_k)).await?;
        Ok(select(&query, pool, top_k, min_score))
    }
}

/// Score, filter, order and truncate a candidate pool.
///
/// `query` must already be unit length.
pub fn select(
    query: &[f32],
    pool: Vec<(crate::models::StatuteSection, Vec<f32>)>,
    top_k: usize,
    min_score: f32,
) -> Vec<SimilarityCandidate> {
    let mut scored: Vec<SimilarityCandidate> = pool
        .into_iter()
        .filter(|(_, vector)| vector.len() == query.len())
        .filter_map(|(section, vector)| {
            let unit = normalize(&vector)?;
            Some(SimilarityCandidate {
                section,
                score: dot(query, &unit).clamp(-1.0, 1.0),
            })
        })
        .filter(|c| c.score >= min_score)
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(top_k);
    scored
}
