use crate::models::{Error, JobRow, NewJob};
use sqlx::PgExecutor;
use std::time::Duration;

const COLUMNS: &str = "id, priority, run_at, job_type, args, error_count, last_error, queue";

pub async fn insert<'e>(executor: impl PgExecutor<'e>, job: &NewJob) -> Result<i64, Error> {
    const SQL: &str = "INSERT INTO jobs(priority, run_at, job_type, args, queue)
    VALUES ($1, COALESCE($2, now()), $3, $4, $5) RETURNING id";
    let job_id = sqlx::query_scalar::<_, i64>(SQL)
        .bind(job.priority_or_default())
        .bind(job.run_at)
        .bind(&job.job_type)
        .bind(job.args_or_default())
        .bind(job.queue_or_default())
        .fetch_one(executor)
        .await?;
    Ok(job_id)
}

pub async fn get_by_id<'e>(
    executor: impl PgExecutor<'e>,
    job_id: i64,
) -> Result<Option<JobRow>, Error> {
    let sql = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
    let job = sqlx::query_as::<_, JobRow>(&sql)
        .bind(job_id)
        .fetch_optional(executor)
        .await?;
    Ok(job)
}

pub async fn get_by_queue<'e>(
    executor: impl PgExecutor<'e>,
    queue: &str,
) -> Result<Vec<JobRow>, Error> {
    let sql = format!("SELECT {COLUMNS} FROM jobs WHERE queue = $1 ORDER BY id");
    let jobs = sqlx::query_as::<_, JobRow>(&sql)
        .bind(queue)
        .fetch_all(executor)
        .await?;
    Ok(jobs)
}

/// Due rows of `queue` in claim order. Rows whose advisory lock is already
/// granted to some session are filtered out here, so they cost no lock attempt.
/// A bigint advisory key shows up in pg_locks split into classid (high 32 bits)
/// and objid (low 32 bits) with objsubid = 1.
pub async fn candidates<'e>(
    executor: impl PgExecutor<'e>,
    queue: &str,
    limit: i64,
) -> Result<Vec<i64>, Error> {
    const SQL: &str = "SELECT j.id FROM jobs j
    WHERE j.queue = $1 AND j.run_at <= now()
    AND NOT EXISTS (
        SELECT 1 FROM pg_locks l
        WHERE l.locktype = 'advisory'
        AND l.granted
        AND l.objsubid = 1
        AND l.database = (SELECT oid FROM pg_database WHERE datname = current_database())
        AND l.classid::bigint = (j.id >> 32)
        AND l.objid::bigint = (j.id & 4294967295)
    )
    ORDER BY j.priority, j.run_at, j.id
    LIMIT $2";
    let ids = sqlx::query_scalar::<_, i64>(SQL)
        .bind(queue)
        .bind(limit)
        .fetch_all(executor)
        .await?;
    Ok(ids)
}

pub async fn try_lock<'e>(executor: impl PgExecutor<'e>, job_id: i64) -> Result<bool, Error> {
    const SQL: &str = "SELECT pg_try_advisory_lock($1)";
    let locked = sqlx::query_scalar::<_, bool>(SQL)
        .bind(job_id)
        .fetch_one(executor)
        .await?;
    Ok(locked)
}

pub async fn unlock<'e>(executor: impl PgExecutor<'e>, job_id: i64) -> Result<bool, Error> {
    const SQL: &str = "SELECT pg_advisory_unlock($1)";
    let unlocked = sqlx::query_scalar::<_, bool>(SQL)
        .bind(job_id)
        .fetch_one(executor)
        .await?;
    Ok(unlocked)
}

pub async fn find_eligible<'e>(
    executor: impl PgExecutor<'e>,
    job_id: i64,
) -> Result<Option<JobRow>, Error> {
    let sql = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1 AND run_at <= now()");
    let job = sqlx::query_as::<_, JobRow>(&sql)
        .bind(job_id)
        .fetch_optional(executor)
        .await?;
    Ok(job)
}

pub async fn delete<'e>(executor: impl PgExecutor<'e>, job_id: i64) -> Result<u64, Error> {
    const SQL: &str = "DELETE FROM jobs WHERE id = $1";
    let res = sqlx::query(SQL).bind(job_id).execute(executor).await?;
    Ok(res.rows_affected())
}

pub async fn fail<'e>(
    executor: impl PgExecutor<'e>,
    job_id: i64,
    delay: Duration,
    message: &str,
) -> Result<u64, Error> {
    const SQL: &str = "UPDATE jobs
    SET error_count = error_count + 1, last_error = $2, run_at = now() + $3
    WHERE id = $1";
    let res = sqlx::query(SQL)
        .bind(job_id)
        .bind(message)
        .bind(delay)
        .execute(executor)
        .await?;
    Ok(res.rows_affected())
}
