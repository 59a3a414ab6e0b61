//! Content-addressed cache of finished analyses.
//!
//! Entries are keyed by document [`Fingerprint`]. The first committer for a
//! fingerprint wins; later writers keep the stored entry and adopt it.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::fingerprint::Fingerprint;
use crate::models::{now_millis, CacheEntry};
use crate::store::Store;

/// Outcome of [`ContentCache::store_if_absent`].
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub inserted: bool,
    /// The entry now stored under the fingerprint: ours, or the winner's.
    pub entry: CacheEntry,
}

#[derive(Clone)]
pub struct ContentCache {
    store: Arc<dyn Store>,
}

impl ContentCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Look up a finished analysis. Degraded fingerprints always miss.
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        if !fingerprint.is_cacheable() {
            return Ok(None);
        }
        let entry = self.store.get_cache_entry(&fingerprint.hex).await?;
        if let Some(mut entry) = entry {
            let now = now_millis();
            self.store.touch_cache_entry(&fingerprint.hex, now).await?;
            entry.last_accessed_at = now;
            debug!(fingerprint = %fingerprint.hex, "cache hit");
            return Ok(Some(entry));
        }
        Ok(None)
    }

    /// Insert `entry` unless one exists for the same fingerprint.
    ///
    /// `entry.fingerprint` must equal `fingerprint.hex`. Degraded
    /// fingerprints are not stored and report `inserted: false` with the
    /// caller's own entry.
    pub async fn store_if_absent(
        &self,
        fingerprint: &Fingerprint,
        entry: CacheEntry,
    ) -> Result<StoreOutcome> {
        if !fingerprint.is_cacheable() {
            return Ok(StoreOutcome {
                inserted: false,
                entry,
            });
        }

        if self.store.insert_cache_entry_if_absent(&entry).await? {
            info!(fingerprint = %fingerprint.hex, job_id = %entry.job_id, "cached analysis");
            return Ok(StoreOutcome {
                inserted: true,
                entry,
            });
        }

        match self.store.get_cache_entry(&fingerprint.hex).await? {
            Some(winner) => {
                info!(
                    fingerprint = %fingerprint.hex,
                    winner_job_id = %winner.job_id,
                    "analysis already cached by another job, adopting it"
                );
                Ok(StoreOutcome {
                    inserted: false,
                    entry: winner,
                })
            }
            None => anyhow::bail!(
                "cache entry {} vanished after a conflicting insert",
                fingerprint.hex
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint_bytes;
    use crate::store::InMemoryStore;
    use uuid::Uuid;

    fn entry(fp: &Fingerprint, report: &str) -> CacheEntry {
        CacheEntry {
            fingerprint: fp.hex.clone(),
            job_id: Uuid::new_v4(),
            chunks: vec![],
            embeddings: vec![],
            clauses: vec![],
            report: report.to_string(),
            created_at: 0,
            last_accessed_at: 0,
        }
    }

    #[tokio::test]
    async fn test_first_committer_wins() {
        let cache = ContentCache::new(Arc::new(InMemoryStore::new()));
        let fp = fingerprint_bytes(b"pdf");

        let first = cache.store_if_absent(&fp, entry(&fp, "first")).await.unwrap();
        let second = cache.store_if_absent(&fp, entry(&fp, "second")).await.unwrap();

        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(second.entry.report, "first");
        assert_eq!(cache.lookup(&fp).await.unwrap().unwrap().report, "first");
    }

    #[tokio::test]
    async fn test_lookup_bumps_access_time() {
        let cache = ContentCache::new(Arc::new(InMemoryStore::new()));
        let fp = fingerprint_bytes(b"pdf");
        cache.store_if_absent(&fp, entry(&fp, "r")).await.unwrap();

        let hit = cache.lookup(&fp).await.unwrap().unwrap();
        assert!(hit.last_accessed_at > 0);
    }

    #[tokio::test]
    async fn test_degraded_fingerprints_bypass() {
        let cache = ContentCache::new(Arc::new(InMemoryStore::new()));
        let fp = Fingerprint {
            hex: "abc".into(),
            degraded: true,
        };
        let out = cache.store_if_absent(&fp, entry(&fp, "r")).await.unwrap();
        assert!(!out.inserted);
        assert!(cache.lookup(&fp).await.unwrap().is_none());
    }
}
