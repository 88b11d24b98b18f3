//! Postgres-backed job store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (foreign key violation) | `23503` | `Storage` (log line for a deleted job) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / network / other | N/A | `Storage` |
//!
//! Rows that fail to decode into domain types (unknown status string, malformed
//! progress JSON) surface as `Serialization`.
//!
//! ## Guarded writes
//!
//! `update` is a single `UPDATE ... WHERE id = $1 AND status = $2`. Zero affected
//! rows means either the record is gone (`NotFound`) or another writer moved it
//! first (`Ok(false)`).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use jobwarden_core::{
    EngineJobId, Job, JobId, JobLogEntry, JobPriority, JobStatus, JobType, LogEntryId, OwnerId,
};

use super::query::{JobFilter, Page, PageRequest, StatusCounts, TypeBreakdown};
use super::{JobStore, StoreError};

const SCHEMA: &str = include_str!("../../migrations/0001_jobs.sql");

const JOB_COLUMNS: &str = r#"
    id, engine_job_id, queue_name, job_type, status, priority, data, progress,
    result, error, stack_trace, attempts, max_attempts, owner_id, timeout_ms,
    created_at, started_at, completed_at, failed_at, duration_ms
"#;

// Shared by `query`'s count and page statements: $1 status, $2 type, $3 queue, $4 owner.
const FILTER_CLAUSE: &str = r#"
    ($1::text IS NULL OR status = $1)
    AND ($2::text IS NULL OR job_type = $2)
    AND ($3::text IS NULL OR queue_name = $3)
    AND ($4::uuid IS NULL OR owner_id = $4)
"#;

/// Postgres-backed job store. Cheap to clone; the pool is shared.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM job WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_id", e))?;
        row.map(decode_job).transpose()
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip(self, job),
        fields(queue = %job.queue_name, engine_job_id = %job.engine_job_id),
        err
    )]
    async fn create(&self, job: Job) -> Result<Job, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO job ({JOB_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (queue_name, engine_job_id) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        );
        let inserted = bind_job(sqlx::query(&sql), &job)?
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create", e))?;

        match inserted {
            Some(row) => decode_job(row),
            None => self
                .find_by_engine_id(&job.queue_name, &job.engine_job_id)
                .await?
                .ok_or_else(|| {
                    StoreError::Storage(format!(
                        "job {}/{} vanished after insert conflict",
                        job.queue_name, job.engine_job_id
                    ))
                }),
        }
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.fetch_job(id).await
    }

    async fn find_by_engine_id(
        &self,
        queue_name: &str,
        engine_job_id: &EngineJobId,
    ) -> Result<Option<Job>, StoreError> {
        let sql =
            format!("SELECT {JOB_COLUMNS} FROM job WHERE queue_name = $1 AND engine_job_id = $2");
        let row = sqlx::query(&sql)
            .bind(queue_name)
            .bind(engine_job_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_engine_id", e))?;
        row.map(decode_job).transpose()
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, from = %expected_status, to = %job.status),
        err
    )]
    async fn update(&self, job: &Job, expected_status: JobStatus) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job SET
                engine_job_id = $3,
                status = $4,
                progress = $5,
                result = $6,
                error = $7,
                stack_trace = $8,
                attempts = $9,
                started_at = $10,
                completed_at = $11,
                failed_at = $12,
                duration_ms = $13
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(expected_status.as_str())
        .bind(job.engine_job_id.as_str())
        .bind(job.status.as_str())
        .bind(to_json(&job.progress)?)
        .bind(to_json(&job.result)?)
        .bind(job.error.as_deref())
        .bind(job.stack_trace.as_deref())
        .bind(job.attempts as i32)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.failed_at)
        .bind(job.duration_ms)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.fetch_job(job.id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(job.id)),
        }
    }

    #[instrument(skip(self), fields(row_count = tracing::field::Empty), err)]
    async fn query(&self, filter: &JobFilter, page: &PageRequest) -> Result<Page<Job>, StoreError> {
        let span = Span::current();

        let count_sql = format!("SELECT COUNT(*) AS total FROM job WHERE {FILTER_CLAUSE}");
        let total: i64 = sqlx::query(&count_sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.job_type.map(|t| t.as_str()))
            .bind(filter.queue_name.as_deref())
            .bind(filter.owner_id.map(|o| *o.as_uuid()))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("query_count", e))?
            .try_get("total")
            .map_err(|e| map_sqlx_error("query_count", e))?;

        // Sort column and direction come from closed enums, never from caller text.
        let page_sql = format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE {FILTER_CLAUSE} \
             ORDER BY {} {}, id DESC LIMIT $5 OFFSET $6",
            page.sort_by.column(),
            page.sort_dir.keyword(),
        );
        let rows = sqlx::query(&page_sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.job_type.map(|t| t.as_str()))
            .bind(filter.queue_name.as_deref())
            .bind(filter.owner_id.map(|o| *o.as_uuid()))
            .bind(i64::from(page.page_size))
            .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("query", e))?;

        let items = rows.into_iter().map(decode_job).collect::<Result<Vec<_>, _>>()?;
        span.record("row_count", items.len());

        Ok(Page {
            items,
            total: total.max(0) as u64,
            page: page.page,
            page_size: page.page_size,
        })
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM job WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn bulk_delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        status: Option<JobStatus>,
        limit: Option<u64>,
    ) -> Result<u64, StoreError> {
        // LIMIT NULL is unbounded in Postgres.
        let result = sqlx::query(
            r#"
            DELETE FROM job
            WHERE id IN (
                SELECT id FROM job
                WHERE created_at < $1
                  AND ($2::text IS NULL OR status = $2)
                ORDER BY created_at ASC
                LIMIT $3
            )
            "#,
        )
        .bind(cutoff)
        .bind(status.map(|s| s.as_str()))
        .bind(limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("bulk_delete_older_than", e))?;
        Ok(result.rows_affected())
    }

    async fn find_active_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job \
             WHERE status = 'ACTIVE' AND started_at < $1 ORDER BY started_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_active_started_before", e))?;
        rows.into_iter().map(decode_job).collect()
    }

    async fn aggregate_by_status(
        &self,
        owner_id: Option<OwnerId>,
    ) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n
            FROM job
            WHERE ($1::uuid IS NULL OR owner_id = $1)
            GROUP BY status
            "#,
        )
        .bind(owner_id.map(|o| *o.as_uuid()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("aggregate_by_status", e))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("aggregate_by_status", e))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| map_sqlx_error("aggregate_by_status", e))?;
            counts.add(parse_column(&status)?, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn aggregate_by_type(
        &self,
        owner_id: Option<OwnerId>,
    ) -> Result<Vec<TypeBreakdown>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                job_type,
                COUNT(*) AS n,
                COUNT(*) FILTER (WHERE status = 'COMPLETED') AS completed,
                COUNT(*) FILTER (WHERE status = 'FAILED') AS failed,
                COALESCE(
                    AVG(duration_ms) FILTER (WHERE status = 'COMPLETED' AND duration_ms > 0),
                    0
                )::float8 AS avg_duration_ms
            FROM job
            WHERE ($1::uuid IS NULL OR owner_id = $1)
            GROUP BY job_type
            ORDER BY job_type
            "#,
        )
        .bind(owner_id.map(|o| *o.as_uuid()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("aggregate_by_type", e))?;

        rows.into_iter()
            .map(|row| {
                let get_count = |col: &str| -> Result<u64, StoreError> {
                    let n: i64 = row
                        .try_get(col)
                        .map_err(|e| map_sqlx_error("aggregate_by_type", e))?;
                    Ok(n.max(0) as u64)
                };
                let job_type: String = row
                    .try_get("job_type")
                    .map_err(|e| map_sqlx_error("aggregate_by_type", e))?;
                Ok(TypeBreakdown {
                    job_type: parse_column(&job_type)?,
                    count: get_count("n")?,
                    completed: get_count("completed")?,
                    failed: get_count("failed")?,
                    avg_duration_ms: row
                        .try_get("avg_duration_ms")
                        .map_err(|e| map_sqlx_error("aggregate_by_type", e))?,
                })
            })
            .collect()
    }

    async fn avg_duration(
        &self,
        status: JobStatus,
        owner_id: Option<OwnerId>,
    ) -> Result<f64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(AVG(duration_ms), 0)::float8 AS avg
            FROM job
            WHERE status = $1
              AND duration_ms > 0
              AND ($2::uuid IS NULL OR owner_id = $2)
            "#,
        )
        .bind(status.as_str())
        .bind(owner_id.map(|o| *o.as_uuid()))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("avg_duration", e))?;
        row.try_get("avg").map_err(|e| map_sqlx_error("avg_duration", e))
    }

    async fn distinct_owner_ids(&self) -> Result<Vec<OwnerId>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT owner_id FROM job WHERE owner_id IS NOT NULL ORDER BY owner_id",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("distinct_owner_ids", e))?;

        rows.into_iter()
            .map(|row| {
                let id: uuid::Uuid = row
                    .try_get("owner_id")
                    .map_err(|e| map_sqlx_error("distinct_owner_ids", e))?;
                Ok(OwnerId::from_uuid(id))
            })
            .collect()
    }

    #[instrument(skip(self, entry), fields(job_id = %entry.job_id, level = %entry.level), err)]
    async fn append_log(&self, entry: JobLogEntry) -> Result<JobLogEntry, StoreError> {
        // GREATEST ignores NULL, so the first line for a job just takes the clock.
        let row = sqlx::query(
            r#"
            INSERT INTO job_log_entry (id, job_id, level, message, context, stack_trace, created_at)
            VALUES (
                $1, $2, $3, $4, $5, $6,
                GREATEST(
                    clock_timestamp(),
                    (SELECT MAX(created_at) FROM job_log_entry WHERE job_id = $2)
                )
            )
            RETURNING id, job_id, level, message, context, stack_trace, created_at
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.job_id.as_uuid())
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&entry.context)
        .bind(entry.stack_trace.as_deref())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_log", e))?;

        decode_log(row)
    }

    async fn recent_logs(&self, job_id: JobId, limit: u32) -> Result<Vec<JobLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, level, message, context, stack_trace, created_at
            FROM job_log_entry
            WHERE job_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recent_logs", e))?;

        rows.into_iter().map(decode_log).collect()
    }
}

fn bind_job<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    job: &'q Job,
) -> Result<sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>, StoreError> {
    Ok(query
        .bind(job.id.as_uuid())
        .bind(job.engine_job_id.as_str())
        .bind(job.queue_name.as_str())
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(job.priority.as_i32())
        .bind(&job.data)
        .bind(to_json(&job.progress)?)
        .bind(to_json(&job.result)?)
        .bind(job.error.as_deref())
        .bind(job.stack_trace.as_deref())
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(job.owner_id.map(|o| *o.as_uuid()))
        .bind(job.timeout_ms.map(|t| i64::try_from(t).unwrap_or(i64::MAX)))
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.failed_at)
        .bind(job.duration_ms))
}

fn to_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<serde_json::Value>, StoreError> {
    value
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_column<T>(raw: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| StoreError::Serialization(e.to_string()))
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some("23503") => StoreError::Storage(format!(
                "foreign key violation in {operation}: {}",
                db_err.message()
            )),
            _ => StoreError::Storage(format!("database error in {operation}: {}", db_err.message())),
        },
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("row decode failed in {operation}: {err}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    engine_job_id: String,
    queue_name: String,
    job_type: String,
    status: String,
    priority: i32,
    data: serde_json::Value,
    progress: Option<serde_json::Value>,
    result: Option<serde_json::Value>,
    error: Option<String>,
    stack_trace: Option<String>,
    attempts: i32,
    max_attempts: i32,
    owner_id: Option<uuid::Uuid>,
    timeout_ms: Option<i64>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            engine_job_id: row.try_get("engine_job_id")?,
            queue_name: row.try_get("queue_name")?,
            job_type: row.try_get("job_type")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            data: row.try_get("data")?,
            progress: row.try_get("progress")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            stack_trace: row.try_get("stack_trace")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            owner_id: row.try_get("owner_id")?,
            timeout_ms: row.try_get("timeout_ms")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            failed_at: row.try_get("failed_at")?,
            duration_ms: row.try_get("duration_ms")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId::from_uuid(row.id),
            engine_job_id: EngineJobId::new(row.engine_job_id),
            queue_name: row.queue_name,
            job_type: parse_column::<JobType>(&row.job_type)?,
            status: parse_column::<JobStatus>(&row.status)?,
            priority: JobPriority::from_i32(row.priority)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            data: row.data,
            progress: from_json_column(row.progress)?,
            result: from_json_column(row.result)?,
            error: row.error,
            stack_trace: row.stack_trace,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            owner_id: row.owner_id.map(OwnerId::from_uuid),
            timeout_ms: row.timeout_ms.map(|t| t.max(0) as u64),
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
            duration_ms: row.duration_ms,
        })
    }
}

fn from_json_column<T: DeserializeOwned>(
    value: Option<serde_json::Value>,
) -> Result<Option<T>, StoreError> {
    value
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_job(row: PgRow) -> Result<Job, StoreError> {
    JobRow::from_row(&row)
        .map_err(|e| StoreError::Serialization(format!("failed to deserialize job row: {e}")))?
        .try_into()
}

#[derive(Debug)]
struct LogRow {
    id: uuid::Uuid,
    job_id: uuid::Uuid,
    level: String,
    message: String,
    context: Option<serde_json::Value>,
    stack_trace: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for LogRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(LogRow {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            level: row.try_get("level")?,
            message: row.try_get("message")?,
            context: row.try_get("context")?,
            stack_trace: row.try_get("stack_trace")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn decode_log(row: PgRow) -> Result<JobLogEntry, StoreError> {
    let row = LogRow::from_row(&row)
        .map_err(|e| StoreError::Serialization(format!("failed to deserialize log row: {e}")))?;
    Ok(JobLogEntry {
        id: LogEntryId::from_uuid(row.id),
        job_id: JobId::from_uuid(row.job_id),
        level: parse_column(&row.level)?,
        message: row.message,
        context: row.context,
        stack_trace: row.stack_trace,
        created_at: row.created_at,
    })
}
