use crate::models::{Error, JobRow, NewJob};
use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use std::time::Duration;

#[cfg(test)]
mod faulty;
pub mod jobqueue;
mod memory;
mod postgres;

pub use memory::{MemorySession, MemoryStore};
pub use postgres::{PgSession, PgStore};

#[cfg(test)]
pub(crate) use faulty::{Fault, FaultyStore};

/// Durable job table shared by every worker.
#[async_trait]
pub trait JobStore: Clone + Send + Sync + 'static {
    type Session: JobSession;

    /// Inserts one row and returns its id. `run_at: None` means the store's now.
    async fn insert(&self, job: &NewJob) -> Result<i64, Error>;

    async fn get_by_id(&self, job_id: i64) -> Result<Option<JobRow>, Error>;

    /// Opens a claiming session. Advisory locks live exactly as long as the session.
    async fn session(&self) -> Result<Self::Session, Error>;
}

/// One store session. Dropping a session that still holds locks releases them.
#[async_trait]
pub trait JobSession: Send + 'static {
    /// Ids of eligible rows in claim order, skipping rows locked elsewhere.
    async fn candidates(&mut self, queue: &str, limit: i64) -> Result<Vec<i64>, Error>;

    /// Non-blocking advisory lock attempt.
    async fn try_lock(&mut self, job_id: i64) -> Result<bool, Error>;

    async fn unlock(&mut self, job_id: i64) -> Result<bool, Error>;

    /// Re-fetches the row, only while it is still due.
    async fn find_eligible(&mut self, job_id: i64) -> Result<Option<JobRow>, Error>;

    async fn delete(&mut self, job_id: i64) -> Result<u64, Error>;

    /// Records a failure and pushes `run_at` to the store's now plus `delay`.
    async fn fail(&mut self, job_id: i64, delay: Duration, message: &str) -> Result<u64, Error>;
}

pub async fn select_one(pool: &Pool<Postgres>) -> Result<(), Error> {
    _ = sqlx::query("SELECT 1").fetch_one(pool).await?;
    Ok(())
}
