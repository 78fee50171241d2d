use sqlx::{Postgres, Transaction};
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

use crate::{
    db::{JobSession, JobStore, PgStore},
    models::{Backoff, Error, JobRow, NewJob},
    services::JobHandle,
};

/// Enqueue and claim entry point over a [`JobStore`].
#[derive(Debug, Clone)]
pub struct JobQueue<S: JobStore> {
    store: S,
    backoff: Backoff,
    claim_limit: i64,
}

impl<S: JobStore> JobQueue<S> {
    /// Candidate rows examined per claim.
    pub const CLAIM_LIMIT: i64 = 25;

    pub fn new(store: S) -> Self {
        Self {
            store,
            backoff: Backoff::default(),
            claim_limit: Self::CLAIM_LIMIT,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_claim_limit(mut self, claim_limit: i64) -> Self {
        self.claim_limit = claim_limit.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub async fn enqueue(&self, job: NewJob) -> Result<i64, Error> {
        job.validate()?;
        let job_id = self.store.insert(&job).await?;
        debug!({ job_id, job_type = job.job_type.as_str() }, "enqueue");
        Ok(job_id)
    }

    pub async fn get(&self, job_id: i64) -> Result<Option<JobRow>, Error> {
        self.store.get_by_id(job_id).await
    }

    /// Deletes a job that no worker is holding. Returns `false` when the job
    /// is in progress or gone.
    pub async fn cancel(&self, job_id: i64) -> Result<bool, Error> {
        let mut session = self.store.session().await?;
        if !session.try_lock(job_id).await? {
            return Ok(false);
        }
        let deleted = session.delete(job_id).await;
        session.unlock(job_id).await?;
        Ok(deleted? > 0)
    }

    /// Locks the best due job of `queue`.
    ///
    /// Candidates are tried in `priority, run_at, id` order. A candidate whose
    /// lock is taken is skipped rather than waited on, and a locked candidate
    /// that is no longer due (or no longer exists) after the re-fetch is
    /// unlocked and skipped. A store error aborts the scan; locks taken by the
    /// aborted scan go away with the session.
    pub async fn claim(&self, queue: &str) -> Result<Option<JobHandle<S::Session>>, Error> {
        let mut session = self.store.session().await?;
        let candidates = session.candidates(queue, self.claim_limit).await?;
        for job_id in candidates {
            if !session.try_lock(job_id).await? {
                trace!({ job_id }, "locked elsewhere");
                continue;
            }
            match session.find_eligible(job_id).await? {
                Some(row) => {
                    debug!({ job_id, error_count = row.error_count }, "claim");
                    return Ok(Some(JobHandle::new(session, row, self.backoff)));
                }
                None => {
                    trace!({ job_id }, "stale candidate");
                    session.unlock(job_id).await?;
                }
            }
        }
        Ok(None)
    }
}

impl JobQueue<PgStore> {
    /// Enqueues as part of the caller's transaction.
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: NewJob,
    ) -> Result<i64, Error> {
        job.validate()?;
        let job_id = self.store.insert_in_tx(tx, &job).await?;
        debug!({ job_id, job_type = job.job_type.as_str() }, "enqueue_in_tx");
        Ok(job_id)
    }
}

#[cfg(test)]
fn memory_queue() -> JobQueue<crate::db::MemoryStore> {
    JobQueue::new(crate::db::MemoryStore::new())
}

#[tokio::test]
async fn enqueue_applies_defaults() -> anyhow::Result<()> {
    // arrange
    let queue = memory_queue();
    let before = chrono::Utc::now();

    // act
    let job_id = queue.enqueue(NewJob::new("MyJob")).await?;

    // assert
    let jobs = queue.store().jobs();
    assert_eq!(1, jobs.len());
    let job = &jobs[0];
    assert_eq!(job_id, job.id);
    assert_ne!(0, job.id);
    assert_eq!(100, job.priority);
    assert!(job.run_at >= before);
    assert_eq!("MyJob", job.job_type);
    assert_eq!("[]", job.args);
    assert_eq!(0, job.error_count);
    assert_eq!(None, job.last_error);
    assert_eq!("", job.queue);
    Ok(())
}

#[tokio::test]
async fn enqueue_keeps_supplied_values() -> anyhow::Result<()> {
    // arrange
    let queue = memory_queue();
    let run_at = chrono::Utc::now() + chrono::Duration::minutes(2);
    let args = r#"{"arg1":0, "arg2":"a string"}"#;

    // act
    queue
        .enqueue(
            NewJob::new("MyJob")
                .priority(99)
                .run_at(run_at)
                .args(args)
                .queue("special-work-queue"),
        )
        .await?;

    // assert
    let job = &queue.store().jobs()[0];
    assert_eq!(99, job.priority);
    assert_eq!(run_at, job.run_at);
    assert_eq!(args, job.args);
    assert_eq!("special-work-queue", job.queue);
    Ok(())
}

#[tokio::test]
async fn enqueue_with_empty_type() -> anyhow::Result<()> {
    // arrange
    let queue = memory_queue();

    // act
    let res = queue.enqueue(NewJob::new("")).await;

    // assert
    assert!(matches!(res, Err(Error::MissingType)));
    assert!(queue.store().jobs().is_empty());
    Ok(())
}

#[tokio::test]
async fn claim_empty_queue() -> anyhow::Result<()> {
    // arrange
    let queue = memory_queue();

    // act
    let handle = queue.claim("").await?;

    // assert
    assert!(handle.is_none());
    Ok(())
}

#[tokio::test]
async fn claim_orders_by_priority_run_at_id() -> anyhow::Result<()> {
    // arrange
    let queue = memory_queue();
    let earlier = chrono::Utc::now() - chrono::Duration::minutes(5);
    let low = queue.enqueue(NewJob::new("t").priority(10)).await?;
    let late = queue.enqueue(NewJob::new("t").priority(5)).await?;
    let early = queue
        .enqueue(NewJob::new("t").priority(5).run_at(earlier))
        .await?;
    let late_twin = queue.enqueue(NewJob::new("t").priority(5)).await?;

    // act
    let mut claimed = Vec::new();
    let mut handles = Vec::new();
    while let Some(handle) = queue.claim("").await? {
        claimed.push(handle.id());
        handles.push(handle);
    }

    // assert
    assert_eq!(vec![early, late, late_twin, low], claimed);
    for handle in handles {
        handle.done().await?;
    }
    Ok(())
}

#[tokio::test]
async fn claim_skips_future_jobs_and_other_queues() -> anyhow::Result<()> {
    // arrange
    let queue = memory_queue();
    let later = chrono::Utc::now() + chrono::Duration::minutes(5);
    queue.enqueue(NewJob::new("t").run_at(later)).await?;
    queue.enqueue(NewJob::new("t").queue("other")).await?;

    // act
    let default_queue = queue.claim("").await?;
    let other_queue = queue.claim("other").await?;

    // assert
    assert!(default_queue.is_none());
    let handle = other_queue.expect("job in other queue");
    assert_eq!("other", handle.queue());
    handle.done().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn claim_is_exclusive() -> anyhow::Result<()> {
    // arrange
    let queue = memory_queue();
    let job_id = queue.enqueue(NewJob::new("t")).await?;
    let barrier = std::sync::Arc::new(tokio::sync::Barrier::new(8));

    // act
    let claims: Vec<_> = (0..8)
        .map(|_| {
            let queue = queue.clone();
            let barrier = std::sync::Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                queue.claim("").await
            })
        })
        .collect();
    let mut handles = Vec::new();
    for claim in futures::future::join_all(claims).await {
        handles.extend(claim??);
    }

    // assert
    assert_eq!(1, handles.len());
    assert_eq!(job_id, handles[0].id());
    assert!(queue.store().is_locked(job_id));
    Ok(())
}

#[tokio::test]
async fn claim_store_error_releases_lock() -> anyhow::Result<()> {
    // arrange
    let store = crate::db::MemoryStore::new();
    let faulty = crate::db::FaultyStore::new(store.clone(), crate::db::Fault::FindEligible);
    let queue = JobQueue::new(faulty);
    let job_id = queue.enqueue(NewJob::new("t")).await?;

    // act
    let res = queue.claim("").await;

    // assert
    assert!(matches!(res, Err(Error::DbError(_))));
    assert!(!store.is_locked(job_id));
    let handle = JobQueue::new(store).claim("").await?.expect("job still claimable");
    assert_eq!(job_id, handle.id());
    assert_eq!(0, handle.error_count());
    Ok(())
}

#[tokio::test]
async fn claim_moves_to_next_candidate_when_locked() -> anyhow::Result<()> {
    // arrange
    let queue = memory_queue();
    let first_id = queue.enqueue(NewJob::new("t").priority(1)).await?;
    let second_id = queue.enqueue(NewJob::new("t").priority(2)).await?;

    // act
    let first = queue.claim("").await?.expect("first job");
    let second = queue.claim("").await?.expect("second job");
    let third = queue.claim("").await?;

    // assert
    assert_eq!(first_id, first.id());
    assert_eq!(second_id, second.id());
    assert!(third.is_none());
    Ok(())
}

#[tokio::test]
async fn claim_skips_stale_candidate() -> anyhow::Result<()> {
    // arrange
    let queue = memory_queue();
    let stale_id = queue.enqueue(NewJob::new("t").priority(1)).await?;
    let next_id = queue.enqueue(NewJob::new("t").priority(2)).await?;
    let mut session = queue.store().session().await?;
    let candidates = session.candidates("", 10).await?;
    assert_eq!(vec![stale_id, next_id], candidates);

    // act: another worker finishes the first candidate between selection and lock
    queue.claim("").await?.expect("stale job").done().await?;
    assert!(session.try_lock(stale_id).await?);
    let refetched = session.find_eligible(stale_id).await?;
    session.unlock(stale_id).await?;
    let handle = queue.claim("").await?.expect("next job");

    // assert
    assert!(refetched.is_none());
    assert_eq!(next_id, handle.id());
    assert!(!queue.store().is_locked(stale_id));
    Ok(())
}

#[tokio::test]
async fn done_deletes_job_and_unlocks() -> anyhow::Result<()> {
    // arrange
    let queue = memory_queue();
    let job_id = queue.enqueue(NewJob::new("t")).await?;
    let handle = queue.claim("").await?.expect("job");

    // act
    handle.done().await?;

    // assert
    assert!(queue.store().jobs().is_empty());
    assert!(!queue.store().is_locked(job_id));
    assert!(queue.claim("").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn error_reschedules_with_backoff() -> anyhow::Result<()> {
    // arrange
    let backoff = Backoff::Fixed { delay: 60 };
    let queue = memory_queue().with_backoff(backoff);
    let job_id = queue.enqueue(NewJob::new("t")).await?;
    let handle = queue.claim("").await?.expect("job");
    let called_at = chrono::Utc::now();

    // act
    handle.error("boom").await?;

    // assert
    let job = queue.get(job_id).await?.expect("job still present");
    assert_eq!(1, job.error_count);
    assert_eq!(Some("boom".to_owned()), job.last_error);
    let min_delay = chrono::Duration::from_std(backoff.delay(1))?;
    assert!(job.run_at >= called_at + min_delay);
    assert!(!queue.store().is_locked(job_id));
    assert!(queue.claim("").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn error_keeps_only_latest_message() -> anyhow::Result<()> {
    // arrange
    let queue = memory_queue();
    let job_id = queue.enqueue(NewJob::new("t")).await?;
    let mut session = queue.store().session().await?;
    assert!(session.try_lock(job_id).await?);
    session
        .fail(job_id, std::time::Duration::from_secs(1), "first")
        .await?;
    let row = queue.get(job_id).await?.expect("job");
    let handle = JobHandle::new(session, row, queue.backoff());

    // act
    handle.error("second").await?;

    // assert
    let job = queue.get(job_id).await?.expect("job");
    assert_eq!(2, job.error_count);
    assert_eq!(Some("second".to_owned()), job.last_error);
    Ok(())
}

#[tokio::test]
async fn abandoned_handle_is_claimable_again() -> anyhow::Result<()> {
    // arrange
    let queue = memory_queue();
    let job_id = queue.enqueue(NewJob::new("t")).await?;
    let handle = queue.claim("").await?.expect("job");
    let run_at = handle.run_at();

    // act: the worker dies without resolving the job
    drop(handle);
    let reclaimed = queue.claim("").await?.expect("job is claimable again");

    // assert
    assert_eq!(job_id, reclaimed.id());
    assert_eq!(run_at, reclaimed.run_at());
    assert_eq!(0, reclaimed.error_count());
    reclaimed.done().await?;
    Ok(())
}

#[tokio::test]
async fn cancel_skips_jobs_in_progress() -> anyhow::Result<()> {
    // arrange
    let queue = memory_queue();
    let busy_id = queue.enqueue(NewJob::new("t").priority(1)).await?;
    let idle_id = queue.enqueue(NewJob::new("t").priority(2)).await?;
    let handle = queue.claim("").await?.expect("job");
    assert_eq!(busy_id, handle.id());

    // act
    let busy = queue.cancel(busy_id).await?;
    let idle = queue.cancel(idle_id).await?;
    let missing = queue.cancel(idle_id).await?;

    // assert
    assert!(!busy);
    assert!(idle);
    assert!(!missing);
    assert_eq!(vec![busy_id], queue.store().jobs().iter().map(|j| j.id).collect::<Vec<_>>());
    handle.done().await?;
    Ok(())
}

#[tokio::test]
async fn claim_limit_bounds_candidate_scan() -> anyhow::Result<()> {
    // arrange
    let store = crate::db::MemoryStore::new();
    let plain = JobQueue::new(store.clone());
    let first_id = plain.enqueue(NewJob::new("t").priority(1)).await?;
    let second_id = plain.enqueue(NewJob::new("t").priority(2)).await?;
    // the first candidate is lost to another worker at lock time
    let faulty = crate::db::FaultyStore::new(store, crate::db::Fault::LockTaken(first_id));
    let limited = JobQueue::new(faulty.clone()).with_claim_limit(1);
    let unlimited = JobQueue::new(faulty);

    // act
    let limited_claim = limited.claim("").await?;
    let unlimited_claim = unlimited.claim("").await?;

    // assert
    assert!(limited_claim.is_none());
    let handle = unlimited_claim.expect("second job");
    assert_eq!(second_id, handle.id());
    handle.done().await?;
    Ok(())
}
