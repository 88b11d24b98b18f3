//! Redis-backed queue engine (state shared between processes).
//!
//! Every state change is a Lua script, so one engine call is one atomic
//! round-trip. Delivery is pull-based through [`JobSource`]: workers in any
//! process pop from the same queue.
//!
//! ## Key layout
//!
//! All keys of one queue share the hash tag `jobwarden:{<queue>}`:
//!
//! - `:seq`: id counter
//! - `:job:<id>`: hash with `type`, `payload`, `priority`, `max_attempts`,
//!   `attempts_made`, `state`, `score` and `finished_at`
//! - `:waiting`, `:delayed`: sorted sets scored by priority rank then id
//! - `:active`: set
//! - `:completed`, `:failed`: sorted sets scored by finish time (ms)
//! - `:paused`: present while the queue is paused
//!
//! A failed attempt with attempts left goes to `:delayed` and is eligible
//! again on the next pop; backoff timing is not applied here.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use redis::Script;
use redis::aio::MultiplexedConnection;
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};

use jobwarden_core::{EngineJobId, JobPriority, JobType};

use super::{
    DequeuedJob, EngineError, EngineJobSnapshot, EngineJobState, EnqueueOptions, JobSource,
    QueueCounts, QueueEngine,
};

const ENQUEUE: &str = r#"
local id = redis.call('INCR', KEYS[1] .. ':seq')
local score = ARGV[5] .. string.format('%013d', id)
redis.call('HSET', KEYS[1] .. ':job:' .. id,
    'type', ARGV[1], 'payload', ARGV[2], 'priority', ARGV[3],
    'max_attempts', ARGV[4], 'attempts_made', 0, 'state', 'waiting', 'score', score)
redis.call('ZADD', KEYS[1] .. ':waiting', score, id)
return tostring(id)
"#;

const DEQUEUE: &str = r#"
if redis.call('EXISTS', KEYS[1] .. ':paused') == 1 then return false end
local w = redis.call('ZRANGE', KEYS[1] .. ':waiting', 0, 0, 'WITHSCORES')
local d = redis.call('ZRANGE', KEYS[1] .. ':delayed', 0, 0, 'WITHSCORES')
local from, id
if #w > 0 and (#d == 0 or tonumber(w[2]) <= tonumber(d[2])) then
    from, id = 'waiting', w[1]
elseif #d > 0 then
    from, id = 'delayed', d[1]
else
    return false
end
redis.call('ZREM', KEYS[1] .. ':' .. from, id)
redis.call('SADD', KEYS[1] .. ':active', id)
local job = KEYS[1] .. ':job:' .. id
redis.call('HSET', job, 'state', 'active')
redis.call('HINCRBY', job, 'attempts_made', 1)
return id
"#;

const FINISH: &str = r#"
local job = KEYS[1] .. ':job:' .. ARGV[1]
if redis.call('EXISTS', job) == 0 then return 'missing' end
if redis.call('SREM', KEYS[1] .. ':active', ARGV[1]) == 0 then
    return 'not_active:' .. redis.call('HGET', job, 'state')
end
local state
if ARGV[2] == '1' then
    state = 'completed'
elseif tonumber(redis.call('HGET', job, 'attempts_made')) < tonumber(redis.call('HGET', job, 'max_attempts')) then
    state = 'delayed'
else
    state = 'failed'
end
redis.call('HSET', job, 'state', state, 'finished_at', ARGV[3])
if state == 'delayed' then
    redis.call('ZADD', KEYS[1] .. ':delayed', redis.call('HGET', job, 'score'), ARGV[1])
else
    redis.call('ZADD', KEYS[1] .. ':' .. state, ARGV[3], ARGV[1])
end
return state
"#;

const RETRY: &str = r#"
local job = KEYS[1] .. ':job:' .. ARGV[1]
if redis.call('EXISTS', job) == 0 then return 'missing' end
local state = redis.call('HGET', job, 'state')
if state ~= 'failed' and state ~= 'active' then return state end
redis.call('ZREM', KEYS[1] .. ':failed', ARGV[1])
redis.call('SREM', KEYS[1] .. ':active', ARGV[1])
redis.call('HSET', job, 'state', 'waiting')
redis.call('HDEL', job, 'finished_at')
redis.call('ZADD', KEYS[1] .. ':waiting', redis.call('HGET', job, 'score'), ARGV[1])
return 'ok'
"#;

const REMOVE: &str = r#"
if redis.call('DEL', KEYS[1] .. ':job:' .. ARGV[1]) == 0 then return 0 end
for _, set in ipairs({'waiting', 'delayed', 'completed', 'failed'}) do
    redis.call('ZREM', KEYS[1] .. ':' .. set, ARGV[1])
end
redis.call('SREM', KEYS[1] .. ':active', ARGV[1])
return 1
"#;

const CLEAN: &str = r#"
local set = KEYS[1] .. ':' .. ARGV[1]
local ids = redis.call('ZRANGEBYSCORE', set, '-inf', ARGV[2])
for _, id in ipairs(ids) do
    redis.call('DEL', KEYS[1] .. ':job:' .. id)
    redis.call('ZREM', set, id)
end
return #ids
"#;

const DRAIN: &str = r#"
local sets = {'waiting'}
if ARGV[1] == '1' then table.insert(sets, 'delayed') end
for _, name in ipairs(sets) do
    local set = KEYS[1] .. ':' .. name
    for _, id in ipairs(redis.call('ZRANGE', set, 0, -1)) do
        redis.call('DEL', KEYS[1] .. ':job:' .. id)
    end
    redis.call('DEL', set)
end
return 1
"#;

#[derive(Clone)]
pub struct RedisQueueEngine {
    name: String,
    prefix: String,
    conn: MultiplexedConnection,
    scripts: Scripts,
}

#[derive(Clone)]
struct Scripts {
    enqueue: Script,
    dequeue: Script,
    finish: Script,
    retry: Script,
    remove: Script,
    clean: Script,
    drain: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            dequeue: Script::new(DEQUEUE),
            finish: Script::new(FINISH),
            retry: Script::new(RETRY),
            remove: Script::new(REMOVE),
            clean: Script::new(CLEAN),
            drain: Script::new(DRAIN),
        }
    }
}

impl std::fmt::Debug for RedisQueueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueEngine")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisQueueEngine {
    /// Connect to `redis_url` and bind the handle to queue `name`.
    pub async fn connect(redis_url: &str, name: impl Into<String>) -> Result<Self, EngineError> {
        let client = redis::Client::open(redis_url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self::with_connection(conn, name))
    }

    /// Bind another queue name to an existing connection.
    pub fn with_connection(conn: MultiplexedConnection, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            prefix: key_prefix(&name),
            name,
            conn,
            scripts: Scripts::load(),
        }
    }

    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    fn job_key(&self, id: &EngineJobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    async fn job_fields(&self, id: &EngineJobId) -> Result<HashMap<String, String>, EngineError> {
        let mut conn = self.conn.clone();
        redis::cmd("HGETALL")
            .arg(self.job_key(id))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }
}

#[async_trait::async_trait]
impl QueueEngine for RedisQueueEngine {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, payload), fields(queue = %self.name), err)]
    async fn enqueue(
        &self,
        job_type: JobType,
        payload: JsonValue,
        options: EnqueueOptions,
    ) -> Result<EngineJobId, EngineError> {
        let payload = serde_json::to_string(&payload)
            .map_err(|e| EngineError::Rejected(format!("payload is not serializable: {e}")))?;
        let mut conn = self.conn.clone();
        let id: String = self
            .scripts
            .enqueue
            .key(&self.prefix)
            .arg(job_type.as_str())
            .arg(payload)
            .arg(options.priority.as_i32())
            .arg(options.attempts)
            .arg(priority_rank(options.priority))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(EngineJobId::new(id))
    }

    async fn get_job(&self, id: &EngineJobId) -> Result<Option<EngineJobSnapshot>, EngineError> {
        let fields = self.job_fields(id).await?;
        snapshot_from_fields(id, &fields)
    }

    async fn retry_job(&self, id: &EngineJobId) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .retry
            .key(&self.prefix)
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        match outcome.as_str() {
            "ok" => Ok(()),
            "missing" => Err(EngineError::JobNotFound(id.clone())),
            state => Err(EngineError::Rejected(format!(
                "job {id} cannot be retried from {state}"
            ))),
        }
    }

    async fn remove_job(&self, id: &EngineJobId) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .scripts
            .remove
            .key(&self.prefix)
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        if removed == 0 {
            return Err(EngineError::JobNotFound(id.clone()));
        }
        Ok(())
    }

    async fn pause(&self, _grace: Option<Duration>) -> Result<(), EngineError> {
        // Pops stop immediately; attempts already handed out run to completion.
        let mut conn = self.conn.clone();
        let () = redis::cmd("SET")
            .arg(format!("{}:paused", self.prefix))
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(format!("{}:paused", self.prefix))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn clean(&self, grace: Duration, state: EngineJobState) -> Result<u64, EngineError> {
        let set = match state {
            EngineJobState::Completed => "completed",
            EngineJobState::Failed => "failed",
            other => {
                return Err(EngineError::Rejected(format!(
                    "clean supports completed and failed jobs, not {other:?}"
                )));
            }
        };
        let grace_ms = i64::try_from(grace.as_millis()).unwrap_or(i64::MAX);
        let finished_before = Utc::now().timestamp_millis().saturating_sub(grace_ms);

        let mut conn = self.conn.clone();
        let removed: u64 = self
            .scripts
            .clean
            .key(&self.prefix)
            .arg(set)
            .arg(finished_before)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(removed)
    }

    async fn drain(&self, remove_delayed: bool) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .scripts
            .drain
            .key(&self.prefix)
            .arg(if remove_delayed { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn counts(&self) -> Result<QueueCounts, EngineError> {
        let mut conn = self.conn.clone();
        let p = &self.prefix;
        let (waiting, active, completed, failed, delayed, paused): (u64, u64, u64, u64, u64, bool) =
            redis::pipe()
                .cmd("ZCARD").arg(format!("{p}:waiting"))
                .cmd("SCARD").arg(format!("{p}:active"))
                .cmd("ZCARD").arg(format!("{p}:completed"))
                .cmd("ZCARD").arg(format!("{p}:failed"))
                .cmd("ZCARD").arg(format!("{p}:delayed"))
                .cmd("EXISTS").arg(format!("{p}:paused"))
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
        Ok(counts_from(waiting, active, completed, failed, delayed, paused))
    }

    async fn is_paused(&self) -> Result<bool, EngineError> {
        let mut conn = self.conn.clone();
        redis::cmd("EXISTS")
            .arg(format!("{}:paused", self.prefix))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }
}

#[async_trait::async_trait]
impl JobSource for RedisQueueEngine {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn next_job(&self) -> Result<Option<DequeuedJob>, EngineError> {
        let mut conn = self.conn.clone();
        let popped: Option<String> = self
            .scripts
            .dequeue
            .key(&self.prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        let Some(id) = popped else {
            return Ok(None);
        };
        let id = EngineJobId::new(id);
        let fields = self.job_fields(&id).await?;
        if fields.is_empty() {
            // Removed between the pop and the read.
            debug!(queue = %self.name, engine_job_id = %id, "popped job vanished");
            return Ok(None);
        }
        dequeued_from_fields(&self.name, id, &fields).map(Some)
    }

    async fn report(&self, id: &EngineJobId, success: bool) -> Result<EngineJobState, EngineError> {
        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .finish
            .key(&self.prefix)
            .arg(id.as_str())
            .arg(if success { "1" } else { "0" })
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        if outcome == "missing" {
            return Err(EngineError::JobNotFound(id.clone()));
        }
        if let Some(state) = outcome.strip_prefix("not_active:") {
            return Err(EngineError::Rejected(format!("job {id} is not active ({state})")));
        }
        parse_state(&outcome)
    }
}

fn key_prefix(queue: &str) -> String {
    format!("jobwarden:{{{queue}}}")
}

/// Lower ranks pop first.
fn priority_rank(priority: JobPriority) -> u8 {
    match priority {
        JobPriority::Critical => 1,
        JobPriority::High => 2,
        JobPriority::Normal => 3,
        JobPriority::Low => 4,
    }
}

fn counts_from(
    waiting: u64,
    active: u64,
    completed: u64,
    failed: u64,
    delayed: u64,
    paused: bool,
) -> QueueCounts {
    // A paused queue reports its backlog as paused.
    let (waiting, paused) = if paused { (0, waiting) } else { (waiting, 0) };
    QueueCounts {
        waiting,
        active,
        completed,
        failed,
        delayed,
        paused,
    }
}

fn parse_state(raw: &str) -> Result<EngineJobState, EngineError> {
    match raw {
        "waiting" => Ok(EngineJobState::Waiting),
        "active" => Ok(EngineJobState::Active),
        "completed" => Ok(EngineJobState::Completed),
        "failed" => Ok(EngineJobState::Failed),
        "delayed" => Ok(EngineJobState::Delayed),
        "paused" => Ok(EngineJobState::Paused),
        other => Err(corrupt(format!("unknown job state {other:?}"))),
    }
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, EngineError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| corrupt(format!("job hash is missing {name}")))
}

fn number<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<T, EngineError> {
    field(fields, name)?
        .parse()
        .map_err(|_| corrupt(format!("job hash field {name} is not a number")))
}

fn job_type(fields: &HashMap<String, String>) -> Result<JobType, EngineError> {
    field(fields, "type")?
        .parse()
        .map_err(|e: jobwarden_core::DomainError| corrupt(e.to_string()))
}

fn payload(fields: &HashMap<String, String>) -> Result<JsonValue, EngineError> {
    serde_json::from_str(field(fields, "payload")?)
        .map_err(|e| corrupt(format!("job payload is not JSON: {e}")))
}

fn snapshot_from_fields(
    id: &EngineJobId,
    fields: &HashMap<String, String>,
) -> Result<Option<EngineJobSnapshot>, EngineError> {
    if fields.is_empty() {
        return Ok(None);
    }
    Ok(Some(EngineJobSnapshot {
        id: id.clone(),
        job_type: job_type(fields)?,
        payload: payload(fields)?,
        state: parse_state(field(fields, "state")?)?,
        attempts_made: number(fields, "attempts_made")?,
    }))
}

fn dequeued_from_fields(
    queue: &str,
    id: EngineJobId,
    fields: &HashMap<String, String>,
) -> Result<DequeuedJob, EngineError> {
    let priority = JobPriority::from_i32(number(fields, "priority")?)
        .map_err(|e| corrupt(e.to_string()))?;
    Ok(DequeuedJob {
        queue_name: queue.to_string(),
        engine_job_id: id,
        job_type: job_type(fields)?,
        payload: payload(fields)?,
        priority,
        attempts_made: number(fields, "attempts_made")?,
        max_attempts: number(fields, "max_attempts")?,
    })
}

fn corrupt(message: String) -> EngineError {
    EngineError::Rejected(format!("corrupt engine job: {message}"))
}

fn map_redis_error(err: redis::RedisError) -> EngineError {
    EngineError::Unavailable(format!("redis: {err}"))
}
