//! In-memory job store for tests/dev.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use jobwarden_core::{EngineJobId, Job, JobId, JobLogEntry, JobStatus, JobType, OwnerId};

use super::query::{
    JobFilter, Page, PageRequest, SortDirection, SortField, StatusCounts, TypeBreakdown,
};
use super::{JobStore, StoreError};

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    by_engine_id: HashMap<(String, EngineJobId), JobId>,
    logs: HashMap<JobId, Vec<JobLogEntry>>,
}

impl Tables {
    fn remove_job(&mut self, id: JobId) -> bool {
        match self.jobs.remove(&id) {
            Some(job) => {
                self.by_engine_id
                    .remove(&(job.queue_name, job.engine_job_id));
                self.logs.remove(&id);
                true
            }
            None => false,
        }
    }
}

/// In-memory job store.
///
/// Both tables live behind one lock so a job and its logs are always removed together.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert or overwrite a record without any guard. Test/dev seeding only.
    pub fn put(&self, job: Job) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables
            .by_engine_id
            .insert((job.queue_name.clone(), job.engine_job_id.clone()), job.id);
        tables.jobs.insert(job.id, job);
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Storage("job store lock poisoned".to_string()))
    }
}

fn compare_by(field: SortField, a: &Job, b: &Job) -> Ordering {
    // NULLs sort after values, like Postgres does for ascending order.
    fn nullable<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
        match (a, b) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }

    match field {
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::StartedAt => nullable(a.started_at, b.started_at),
        SortField::CompletedAt => nullable(a.completed_at, b.completed_at),
        SortField::Duration => nullable(a.duration_ms, b.duration_ms),
        SortField::Priority => a.priority.cmp(&b.priority),
        SortField::Status => a.status.as_str().cmp(b.status.as_str()),
        SortField::Type => a.job_type.as_str().cmp(b.job_type.as_str()),
    }
}

fn mean_duration<'a>(jobs: impl Iterator<Item = &'a Job>) -> f64 {
    let (sum, n) = jobs
        .filter(|j| j.status == JobStatus::Completed)
        .filter_map(|j| j.duration_ms)
        .filter(|d| *d > 0)
        .fold((0i64, 0u64), |(sum, n), d| (sum + d, n + 1));
    if n == 0 { 0.0 } else { sum as f64 / n as f64 }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<Job, StoreError> {
        let mut tables = self.write()?;
        let key = (job.queue_name.clone(), job.engine_job_id.clone());
        if let Some(existing) = tables.by_engine_id.get(&key).and_then(|id| tables.jobs.get(id)) {
            return Ok(existing.clone());
        }
        tables.by_engine_id.insert(key, job.id);
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn find_by_engine_id(
        &self,
        queue_name: &str,
        engine_job_id: &EngineJobId,
    ) -> Result<Option<Job>, StoreError> {
        let tables = self.read()?;
        let key = (queue_name.to_string(), engine_job_id.clone());
        Ok(tables
            .by_engine_id
            .get(&key)
            .and_then(|id| tables.jobs.get(id))
            .cloned())
    }

    async fn update(&self, job: &Job, expected_status: JobStatus) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        let Some(stored) = tables.jobs.get(&job.id) else {
            return Err(StoreError::NotFound(job.id));
        };
        if stored.status != expected_status {
            return Ok(false);
        }
        let old_key = (stored.queue_name.clone(), stored.engine_job_id.clone());
        let new_key = (job.queue_name.clone(), job.engine_job_id.clone());
        if old_key != new_key {
            tables.by_engine_id.remove(&old_key);
            tables.by_engine_id.insert(new_key, job.id);
        }
        tables.jobs.insert(job.id, job.clone());
        Ok(true)
    }

    async fn query(&self, filter: &JobFilter, page: &PageRequest) -> Result<Page<Job>, StoreError> {
        let tables = self.read()?;
        let mut matching: Vec<&Job> = tables.jobs.values().filter(|j| filter.matches(j)).collect();

        matching.sort_by(|a, b| {
            let ord = compare_by(page.sort_by, a, b);
            let ord = match page.sort_dir {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
            ord.then_with(|| b.id.cmp(&a.id))
        });

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
            .take(page.page_size as usize)
            .cloned()
            .collect();

        Ok(Page {
            items,
            total,
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.write()?.remove_job(id))
    }

    async fn bulk_delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        status: Option<JobStatus>,
        limit: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.write()?;
        let mut victims: Vec<(DateTime<Utc>, JobId)> = tables
            .jobs
            .values()
            .filter(|j| j.created_at < cutoff && status.is_none_or(|s| j.status == s))
            .map(|j| (j.created_at, j.id))
            .collect();
        victims.sort();
        if let Some(limit) = limit {
            victims.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }

        let mut deleted = 0;
        for (_, id) in victims {
            if tables.remove_job(id) {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn find_active_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let tables = self.read()?;
        let mut stale: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.is_stale(cutoff))
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.started_at);
        Ok(stale)
    }

    async fn aggregate_by_status(
        &self,
        owner_id: Option<OwnerId>,
    ) -> Result<StatusCounts, StoreError> {
        let tables = self.read()?;
        let filter = JobFilter::owned_by(owner_id);
        let mut counts = StatusCounts::default();
        for job in tables.jobs.values().filter(|j| filter.matches(j)) {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }

    async fn aggregate_by_type(
        &self,
        owner_id: Option<OwnerId>,
    ) -> Result<Vec<TypeBreakdown>, StoreError> {
        let tables = self.read()?;
        let filter = JobFilter::owned_by(owner_id);
        let mut groups: HashMap<JobType, Vec<&Job>> = HashMap::new();
        for job in tables.jobs.values().filter(|j| filter.matches(j)) {
            groups.entry(job.job_type).or_default().push(job);
        }

        let mut breakdown: Vec<TypeBreakdown> = groups
            .into_iter()
            .map(|(job_type, jobs)| TypeBreakdown {
                job_type,
                count: jobs.len() as u64,
                completed: jobs.iter().filter(|j| j.status == JobStatus::Completed).count() as u64,
                failed: jobs.iter().filter(|j| j.status == JobStatus::Failed).count() as u64,
                avg_duration_ms: mean_duration(jobs.iter().copied()),
            })
            .collect();
        breakdown.sort_by(|a, b| a.job_type.as_str().cmp(b.job_type.as_str()));
        Ok(breakdown)
    }

    async fn avg_duration(
        &self,
        status: JobStatus,
        owner_id: Option<OwnerId>,
    ) -> Result<f64, StoreError> {
        let tables = self.read()?;
        let filter = JobFilter {
            status: Some(status),
            owner_id,
            ..Default::default()
        };
        let (sum, n) = tables
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .filter_map(|j| j.duration_ms)
            .filter(|d| *d > 0)
            .fold((0i64, 0u64), |(sum, n), d| (sum + d, n + 1));
        Ok(if n == 0 { 0.0 } else { sum as f64 / n as f64 })
    }

    async fn distinct_owner_ids(&self) -> Result<Vec<OwnerId>, StoreError> {
        let tables = self.read()?;
        let owners: BTreeSet<OwnerId> = tables.jobs.values().filter_map(|j| j.owner_id).collect();
        Ok(owners.into_iter().collect())
    }

    async fn append_log(&self, mut entry: JobLogEntry) -> Result<JobLogEntry, StoreError> {
        let mut tables = self.write()?;
        if !tables.jobs.contains_key(&entry.job_id) {
            return Err(StoreError::NotFound(entry.job_id));
        }
        let lines = tables.logs.entry(entry.job_id).or_default();
        let now = Utc::now();
        entry.created_at = match lines.last() {
            Some(last) if last.created_at > now => last.created_at,
            _ => now,
        };
        lines.push(entry.clone());
        Ok(entry)
    }

    async fn recent_logs(&self, job_id: JobId, limit: u32) -> Result<Vec<JobLogEntry>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .logs
            .get(&job_id)
            .map(|lines| lines.iter().rev().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jobwarden_core::{LogLevel, NewJob};
    use serde_json::json;

    fn new_job(engine_id: &str, queue: &str, job_type: JobType) -> Job {
        Job::new(NewJob::new(engine_id, queue, job_type, json!({})), Utc::now())
    }

    #[tokio::test]
    async fn create_is_idempotent_per_queue_and_engine_id() {
        let store = InMemoryJobStore::new();

        let first = store
            .create(new_job("1", "reports", JobType::ReportGeneration))
            .await
            .unwrap();
        let again = store
            .create(new_job("1", "reports", JobType::ReportGeneration))
            .await
            .unwrap();
        assert_eq!(first.id, again.id);

        // Same engine id in a different queue is a different job.
        let other = store
            .create(new_job("1", "insights", JobType::InsightsGeneration))
            .await
            .unwrap();
        assert_ne!(first.id, other.id);

        let page = store
            .query(&JobFilter::default(), &PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn guarded_update_rejects_stale_status() {
        let store = InMemoryJobStore::new();
        let mut job = store
            .create(new_job("7", "reports", JobType::ReportGeneration))
            .await
            .unwrap();

        job.activate(Utc::now()).unwrap();
        assert!(store.update(&job, JobStatus::Waiting).await.unwrap());

        // A second writer still believing the job is waiting loses.
        let mut stale = job.clone();
        stale.status = JobStatus::Paused;
        assert!(!store.update(&stale, JobStatus::Waiting).await.unwrap());

        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Active);
    }

    #[tokio::test]
    async fn query_filters_sorts_and_pages() {
        let store = InMemoryJobStore::new();
        let owner = OwnerId::new();
        let base = Utc::now() - Duration::hours(1);

        for i in 0..5 {
            let mut job = new_job(&i.to_string(), "reports", JobType::ReportGeneration);
            job.created_at = base + Duration::minutes(i);
            job.owner_id = Some(owner);
            store.put(job).unwrap();
        }
        store.put(new_job("x", "sync", JobType::EmailSync)).unwrap();

        let filter = JobFilter {
            owner_id: Some(owner),
            ..Default::default()
        };
        let page = store
            .query(&filter, &PageRequest::new(Some(1), Some(2)))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].engine_job_id.as_str(), "4");
        assert_eq!(page.items[1].engine_job_id.as_str(), "3");

        let asc = PageRequest::new(Some(3), Some(2)).sorted(SortField::CreatedAt, SortDirection::Asc);
        let page = store.query(&filter, &asc).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].engine_job_id.as_str(), "4");
    }

    #[tokio::test]
    async fn delete_cascades_logs() {
        let store = InMemoryJobStore::new();
        let job = store
            .create(new_job("1", "reports", JobType::ReportGeneration))
            .await
            .unwrap();
        store
            .append_log(JobLogEntry::new(job.id, LogLevel::Info, "started", Utc::now()))
            .await
            .unwrap();

        assert!(store.delete(job.id).await.unwrap());
        assert!(store.recent_logs(job.id, 10).await.unwrap().is_empty());
        assert!(
            store
                .find_by_engine_id("reports", &EngineJobId::from("1"))
                .await
                .unwrap()
                .is_none()
        );
        assert!(!store.delete(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn recent_logs_are_newest_first_and_capped() {
        let store = InMemoryJobStore::new();
        let job = store
            .create(new_job("1", "reports", JobType::ReportGeneration))
            .await
            .unwrap();
        for i in 0..5 {
            store
                .append_log(JobLogEntry::new(job.id, LogLevel::Info, format!("line {i}"), Utc::now()))
                .await
                .unwrap();
        }

        let logs = store.recent_logs(job.id, 3).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].message, "line 4");
        assert_eq!(logs[2].message, "line 2");
        assert!(logs.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn bulk_delete_respects_cutoff_status_and_limit() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        for i in 0..4 {
            let mut job = new_job(&format!("old-{i}"), "reports", JobType::ReportGeneration);
            job.created_at = now - Duration::days(40 + i);
            if i % 2 == 0 {
                job.status = JobStatus::Failed;
            }
            store.put(job).unwrap();
        }
        store.put(new_job("young", "reports", JobType::ReportGeneration)).unwrap();

        let cutoff = now - Duration::days(30);
        let deleted = store
            .bulk_delete_older_than(cutoff, Some(JobStatus::Failed), Some(1))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let deleted = store.bulk_delete_older_than(cutoff, None, None).await.unwrap();
        assert_eq!(deleted, 3);

        let remaining = store
            .query(&JobFilter::default(), &PageRequest::default())
            .await
            .unwrap();
        assert_eq!(remaining.total, 1);
        assert_eq!(remaining.items[0].engine_job_id.as_str(), "young");
    }
}
