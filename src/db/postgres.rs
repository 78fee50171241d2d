use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use sqlx::{pool::PoolConnection, PgConnection, Pool, Postgres, Transaction};
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

use super::{jobqueue, JobSession, JobStore};
use crate::models::{Error, JobRow, NewJob};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Inserts within the caller's transaction; the row only becomes visible on commit.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: &NewJob,
    ) -> Result<i64, Error> {
        jobqueue::insert(&mut **tx, job).await
    }
}

#[async_trait]
impl JobStore for PgStore {
    type Session = PgSession;

    async fn insert(&self, job: &NewJob) -> Result<i64, Error> {
        jobqueue::insert(&self.pool, job).await
    }

    async fn get_by_id(&self, job_id: i64) -> Result<Option<JobRow>, Error> {
        jobqueue::get_by_id(&self.pool, job_id).await
    }

    async fn session(&self) -> Result<PgSession, Error> {
        let conn = self.pool.acquire().await?;
        Ok(PgSession {
            conn: Some(conn),
            held: HashSet::new(),
        })
    }
}

/// A pooled connection pinned for the lifetime of the advisory locks it takes.
///
/// Postgres keeps session-level advisory locks across pool checkouts, so a
/// session dropped while still holding locks is detached from the pool and
/// closed; the server then releases the locks when the backend exits.
#[derive(Debug)]
pub struct PgSession {
    conn: Option<PoolConnection<Postgres>>,
    held: HashSet<i64>,
}

impl PgSession {
    fn conn(&mut self) -> Result<&mut PgConnection, Error> {
        self.conn
            .as_deref_mut()
            .ok_or(Error::DbError(sqlx::Error::PoolClosed))
    }
}

#[async_trait]
impl JobSession for PgSession {
    async fn candidates(&mut self, queue: &str, limit: i64) -> Result<Vec<i64>, Error> {
        jobqueue::candidates(self.conn()?, queue, limit).await
    }

    async fn try_lock(&mut self, job_id: i64) -> Result<bool, Error> {
        let locked = jobqueue::try_lock(self.conn()?, job_id).await?;
        if locked {
            self.held.insert(job_id);
        }
        Ok(locked)
    }

    async fn unlock(&mut self, job_id: i64) -> Result<bool, Error> {
        let unlocked = jobqueue::unlock(self.conn()?, job_id).await?;
        self.held.remove(&job_id);
        Ok(unlocked)
    }

    async fn find_eligible(&mut self, job_id: i64) -> Result<Option<JobRow>, Error> {
        jobqueue::find_eligible(self.conn()?, job_id).await
    }

    async fn delete(&mut self, job_id: i64) -> Result<u64, Error> {
        jobqueue::delete(self.conn()?, job_id).await
    }

    async fn fail(&mut self, job_id: i64, delay: Duration, message: &str) -> Result<u64, Error> {
        jobqueue::fail(self.conn()?, job_id, delay, message).await
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        if let Some(conn) = self.conn.take() {
            warn!({ held = ?self.held }, "closing session with held advisory locks");
            drop(conn.detach());
        }
    }
}
