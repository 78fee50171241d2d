use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;

use super::{JobSession, JobStore};
use crate::models::{Error, JobRow, NewJob};

/// In-process job table with session-scoped locks, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    last_id: i64,
    last_session: u64,
    jobs: BTreeMap<i64, JobRow>,
    /// job id -> owning session
    locks: HashMap<i64, u64>,
}

fn lock_inner(inner: &Mutex<MemoryInner>) -> MutexGuard<'_, MemoryInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows ordered by id.
    pub fn jobs(&self) -> Vec<JobRow> {
        lock_inner(&self.inner).jobs.values().cloned().collect()
    }

    pub fn is_locked(&self, job_id: i64) -> bool {
        lock_inner(&self.inner).locks.contains_key(&job_id)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    type Session = MemorySession;

    async fn insert(&self, job: &NewJob) -> Result<i64, Error> {
        let mut inner = lock_inner(&self.inner);
        inner.last_id += 1;
        let id = inner.last_id;
        inner.jobs.insert(
            id,
            JobRow {
                id,
                priority: job.priority_or_default(),
                run_at: job.run_at.unwrap_or_else(Utc::now),
                job_type: job.job_type.clone(),
                args: job.args_or_default().to_owned(),
                error_count: 0,
                last_error: None,
                queue: job.queue_or_default().to_owned(),
            },
        );
        Ok(id)
    }

    async fn get_by_id(&self, job_id: i64) -> Result<Option<JobRow>, Error> {
        Ok(lock_inner(&self.inner).jobs.get(&job_id).cloned())
    }

    async fn session(&self) -> Result<MemorySession, Error> {
        let mut inner = lock_inner(&self.inner);
        inner.last_session += 1;
        Ok(MemorySession {
            id: inner.last_session,
            inner: Arc::clone(&self.inner),
        })
    }
}

#[derive(Debug)]
pub struct MemorySession {
    id: u64,
    inner: Arc<Mutex<MemoryInner>>,
}

#[async_trait]
impl JobSession for MemorySession {
    async fn candidates(&mut self, queue: &str, limit: i64) -> Result<Vec<i64>, Error> {
        let inner = lock_inner(&self.inner);
        let now = Utc::now();
        let mut due: Vec<&JobRow> = inner
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.run_at <= now && !inner.locks.contains_key(&j.id))
            .collect();
        due.sort_by_key(|j| (j.priority, j.run_at, j.id));
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(due.into_iter().take(limit).map(|j| j.id).collect())
    }

    async fn try_lock(&mut self, job_id: i64) -> Result<bool, Error> {
        let mut inner = lock_inner(&self.inner);
        let owner = *inner.locks.entry(job_id).or_insert(self.id);
        Ok(owner == self.id)
    }

    async fn unlock(&mut self, job_id: i64) -> Result<bool, Error> {
        let mut inner = lock_inner(&self.inner);
        match inner.locks.get(&job_id) {
            Some(owner) if *owner == self.id => {
                inner.locks.remove(&job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_eligible(&mut self, job_id: i64) -> Result<Option<JobRow>, Error> {
        let inner = lock_inner(&self.inner);
        let now = Utc::now();
        Ok(inner.jobs.get(&job_id).filter(|j| j.run_at <= now).cloned())
    }

    async fn delete(&mut self, job_id: i64) -> Result<u64, Error> {
        let mut inner = lock_inner(&self.inner);
        Ok(inner.jobs.remove(&job_id).map_or(0, |_| 1))
    }

    async fn fail(&mut self, job_id: i64, delay: Duration, message: &str) -> Result<u64, Error> {
        let delay = chrono::Duration::from_std(delay).map_err(|_| Error::InvalidParams("delay"))?;
        let mut inner = lock_inner(&self.inner);
        match inner.jobs.get_mut(&job_id) {
            Some(job) => {
                job.error_count += 1;
                job.last_error = Some(message.to_owned());
                job.run_at = Utc::now() + delay;
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let id = self.id;
        lock_inner(&self.inner).locks.retain(|_, owner| *owner != id);
    }
}
