use chrono::{DateTime, Utc};
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

use crate::{
    db::JobSession,
    models::{Backoff, Error, JobRow},
};

/// An exclusively locked job.
///
/// The handle owns the session that holds the job's advisory lock. `done` and
/// `error` consume it and release the lock on every path, including store
/// errors. A handle dropped without either leaves the row untouched and the
/// lock goes away with its session, so the job is claimable again right away.
#[derive(Debug)]
pub struct JobHandle<S: JobSession> {
    session: S,
    row: JobRow,
    backoff: Backoff,
    resolved: bool,
}

impl<S: JobSession> JobHandle<S> {
    pub(crate) fn new(session: S, row: JobRow, backoff: Backoff) -> Self {
        Self {
            session,
            row,
            backoff,
            resolved: false,
        }
    }

    pub fn id(&self) -> i64 {
        self.row.id
    }

    pub fn job_type(&self) -> &str {
        &self.row.job_type
    }

    pub fn args(&self) -> &str {
        &self.row.args
    }

    pub fn queue(&self) -> &str {
        &self.row.queue
    }

    pub fn priority(&self) -> i16 {
        self.row.priority
    }

    pub fn run_at(&self) -> DateTime<Utc> {
        self.row.run_at
    }

    pub fn error_count(&self) -> i32 {
        self.row.error_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.row.last_error.as_deref()
    }

    pub fn row(&self) -> &JobRow {
        &self.row
    }

    /// Deletes the job, then releases its lock.
    pub async fn done(mut self) -> Result<(), Error> {
        let job_id = self.row.id;
        let deleted = self.session.delete(job_id).await;
        let unlocked = self.session.unlock(job_id).await;
        self.resolved = true;
        if let Ok(0) = deleted {
            warn!({ job_id }, "done: row already gone");
        }
        deleted?;
        unlocked?;
        Ok(())
    }

    /// Records the failure, reschedules the job by the backoff policy, then
    /// releases its lock.
    pub async fn error(mut self, message: &str) -> Result<(), Error> {
        let job_id = self.row.id;
        let error_count = u32::try_from(self.row.error_count)
            .unwrap_or(0)
            .saturating_add(1);
        let delay = self.backoff.delay(error_count);
        let failed = self.session.fail(job_id, delay, message).await;
        let unlocked = self.session.unlock(job_id).await;
        self.resolved = true;
        failed?;
        debug!({ job_id, error_count, delay_secs = delay.as_secs() }, "==> retry");
        unlocked?;
        Ok(())
    }
}

impl<S: JobSession> Drop for JobHandle<S> {
    fn drop(&mut self) {
        if !self.resolved {
            warn!({ job_id = self.row.id, job_type = self.row.job_type.as_str() }, "job handle dropped unresolved");
        }
    }
}

#[cfg(test)]
async fn claim_with_fault(
    fault: crate::db::Fault,
) -> anyhow::Result<(crate::db::MemoryStore, JobHandle<<crate::db::FaultyStore as crate::db::JobStore>::Session>)> {
    let store = crate::db::MemoryStore::new();
    let queue = crate::services::JobQueue::new(crate::db::FaultyStore::new(store.clone(), fault));
    queue.enqueue(crate::models::NewJob::new("t")).await?;
    let handle = queue.claim("").await?.expect("job");
    Ok((store, handle))
}

#[tokio::test]
async fn done_releases_lock_when_delete_fails() -> anyhow::Result<()> {
    // arrange
    let (store, handle) = claim_with_fault(crate::db::Fault::Delete).await?;
    let job_id = handle.id();
    assert!(store.is_locked(job_id));

    // act
    let res = handle.done().await;

    // assert
    assert!(matches!(res, Err(Error::DbError(_))));
    assert!(!store.is_locked(job_id));
    assert_eq!(1, store.jobs().len());
    Ok(())
}

#[tokio::test]
async fn error_releases_lock_when_fail_fails() -> anyhow::Result<()> {
    // arrange
    let (store, handle) = claim_with_fault(crate::db::Fault::Fail).await?;
    let job_id = handle.id();
    assert!(store.is_locked(job_id));

    // act
    let res = handle.error("boom").await;

    // assert
    assert!(matches!(res, Err(Error::DbError(_))));
    assert!(!store.is_locked(job_id));
    let job = &store.jobs()[0];
    assert_eq!(0, job.error_count);
    assert_eq!(None, job.last_error);
    Ok(())
}
