use std::time::Duration;

use async_trait::async_trait;

use super::{JobSession, JobStore, MemorySession, MemoryStore};
use crate::models::{Error, JobRow, NewJob};

/// Store failure injected into a [`FaultyStore`] session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    FindEligible,
    Delete,
    Fail,
    /// `try_lock` of this job loses to another session.
    LockTaken(i64),
}

/// [`MemoryStore`] whose sessions fail on one operation.
#[derive(Debug, Clone)]
pub(crate) struct FaultyStore {
    store: MemoryStore,
    fault: Fault,
}

impl FaultyStore {
    pub(crate) fn new(store: MemoryStore, fault: Fault) -> Self {
        Self { store, fault }
    }
}

fn injected() -> Error {
    Error::DbError(sqlx::Error::PoolTimedOut)
}

#[async_trait]
impl JobStore for FaultyStore {
    type Session = FaultySession;

    async fn insert(&self, job: &NewJob) -> Result<i64, Error> {
        self.store.insert(job).await
    }

    async fn get_by_id(&self, job_id: i64) -> Result<Option<JobRow>, Error> {
        self.store.get_by_id(job_id).await
    }

    async fn session(&self) -> Result<FaultySession, Error> {
        Ok(FaultySession {
            session: self.store.session().await?,
            fault: self.fault,
        })
    }
}

#[derive(Debug)]
pub(crate) struct FaultySession {
    session: MemorySession,
    fault: Fault,
}

#[async_trait]
impl JobSession for FaultySession {
    async fn candidates(&mut self, queue: &str, limit: i64) -> Result<Vec<i64>, Error> {
        self.session.candidates(queue, limit).await
    }

    async fn try_lock(&mut self, job_id: i64) -> Result<bool, Error> {
        if self.fault == Fault::LockTaken(job_id) {
            return Ok(false);
        }
        self.session.try_lock(job_id).await
    }

    async fn unlock(&mut self, job_id: i64) -> Result<bool, Error> {
        self.session.unlock(job_id).await
    }

    async fn find_eligible(&mut self, job_id: i64) -> Result<Option<JobRow>, Error> {
        if self.fault == Fault::FindEligible {
            return Err(injected());
        }
        self.session.find_eligible(job_id).await
    }

    async fn delete(&mut self, job_id: i64) -> Result<u64, Error> {
        if self.fault == Fault::Delete {
            return Err(injected());
        }
        self.session.delete(job_id).await
    }

    async fn fail(&mut self, job_id: i64, delay: Duration, message: &str) -> Result<u64, Error> {
        if self.fault == Fault::Fail {
            return Err(injected());
        }
        self.session.fail(job_id, delay, message).await
    }
}
