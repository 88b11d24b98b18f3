//! Where per-owner triggers get their owner list from.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use jobwarden_core::OwnerId;

use crate::error::JobResult;
use crate::store::JobStore;

#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    async fn owners(&self) -> JobResult<Vec<OwnerId>>;
}

/// Fixed list, usually from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticOwners(pub Vec<OwnerId>);

#[async_trait]
impl OwnerDirectory for StaticOwners {
    async fn owners(&self) -> JobResult<Vec<OwnerId>> {
        Ok(self.0.clone())
    }
}

/// Every owner that has at least one job record.
#[derive(Clone)]
pub struct StoreOwners(pub Arc<dyn JobStore>);

#[async_trait]
impl OwnerDirectory for StoreOwners {
    async fn owners(&self) -> JobResult<Vec<OwnerId>> {
        Ok(self.0.distinct_owner_ids().await?)
    }
}

/// Deduplicated union of several directories.
///
/// A source that fails is logged and skipped; the others still contribute.
#[derive(Clone, Default)]
pub struct CombinedOwners {
    sources: Vec<Arc<dyn OwnerDirectory>>,
}

impl CombinedOwners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: Arc<dyn OwnerDirectory>) -> Self {
        self.sources.push(source);
        self
    }
}

#[async_trait]
impl OwnerDirectory for CombinedOwners {
    async fn owners(&self) -> JobResult<Vec<OwnerId>> {
        let mut all = BTreeSet::new();
        for (index, source) in self.sources.iter().enumerate() {
            match source.owners().await {
                Ok(owners) => all.extend(owners),
                Err(e) => warn!(source = index, error = %e, "owner directory unavailable, skipping"),
            }
        }
        Ok(all.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::store::InMemoryJobStore;
    use chrono::Utc;
    use jobwarden_core::{Job, JobType, NewJob};
    use serde_json::json;

    struct Broken;

    #[async_trait]
    impl OwnerDirectory for Broken {
        async fn owners(&self) -> JobResult<Vec<OwnerId>> {
            Err(JobError::Persistence("down".to_string()))
        }
    }

    #[tokio::test]
    async fn store_owners_come_from_job_records() {
        let store = InMemoryJobStore::arc();
        let owner = OwnerId::new();
        store
            .put(Job::new(
                NewJob::new("1", "reports", JobType::ReportGeneration, json!({})).with_owner(owner),
                Utc::now(),
            ))
            .unwrap();
        store
            .put(Job::new(
                NewJob::new("2", "maintenance", JobType::CacheCleanup, json!({})),
                Utc::now(),
            ))
            .unwrap();

        assert_eq!(StoreOwners(store).owners().await.unwrap(), vec![owner]);
    }

    #[tokio::test]
    async fn combined_deduplicates_and_skips_failing_sources() {
        let a = OwnerId::new();
        let b = OwnerId::new();
        let combined = CombinedOwners::new()
            .with(Arc::new(StaticOwners(vec![a, b])))
            .with(Arc::new(Broken))
            .with(Arc::new(StaticOwners(vec![b])));

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(combined.owners().await.unwrap(), expected);
    }
}
