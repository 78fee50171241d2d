//! Runs against the database in `DATABASE_URL`; skipped when it is not set.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::SubsecRound;

use pgque::{
    db::{jobqueue, JobSession, JobStore},
    Backoff, BoxError, Error, JobQueue, NewJob, PgStore, WorkMap, WorkerOptions, WorkerPool,
};
use sqlx::{postgres::PgPoolOptions, Executor, Pool, Postgres};

async fn test_pool(queue: &str) -> anyhow::Result<Option<Pool<Postgres>>> {
    dotenv::dotenv().ok();
    let Ok(db_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return Ok(None);
    };
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&db_url)
        .await?;

    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock(0, 1)")
        .execute(&mut *tx)
        .await?;
    (&mut *tx).execute(include_str!("../schema.sql")).await?;
    tx.commit().await?;

    sqlx::query("DELETE FROM jobs WHERE queue = $1")
        .bind(queue)
        .execute(&pool)
        .await?;
    Ok(Some(pool))
}

fn queue_name(test: &str) -> String {
    format!("{test}-{}", std::process::id())
}

async fn db_now(pool: &Pool<Postgres>) -> anyhow::Result<chrono::DateTime<chrono::Utc>> {
    Ok(sqlx::query_scalar("SELECT now()").fetch_one(pool).await?)
}

#[tokio::test]
async fn enqueue_empty() -> anyhow::Result<()> {
    // arrange
    let queue = queue_name("enqueue_empty");
    let Some(pool) = test_pool(&queue).await? else {
        return Ok(());
    };
    let client = JobQueue::new(PgStore::new(pool.clone()));

    // act
    let job_id = client.enqueue(NewJob::new("MyJob").queue(&queue)).await?;

    // assert
    let jobs = jobqueue::get_by_queue(&pool, &queue).await?;
    assert_eq!(1, jobs.len());
    let job = &jobs[0];
    assert_eq!(job_id, job.id);
    assert_ne!(0, job.id);
    assert_eq!(100, job.priority);
    assert!(job.run_at.timestamp() > 0);
    assert_eq!("MyJob", job.job_type);
    assert_eq!("[]", job.args);
    assert_eq!(0, job.error_count);
    assert_eq!(None, job.last_error);
    Ok(())
}

#[tokio::test]
async fn enqueue_with_values() -> anyhow::Result<()> {
    // arrange
    let queue = queue_name("enqueue_with_values");
    let Some(pool) = test_pool(&queue).await? else {
        return Ok(());
    };
    let client = JobQueue::new(PgStore::new(pool.clone()));
    // postgres keeps microseconds
    let run_at = (chrono::Utc::now() + chrono::Duration::minutes(2)).trunc_subsecs(6);
    let args = r#"{"arg1":0, "arg2":"a string"}"#;

    // act
    client
        .enqueue(
            NewJob::new("MyJob")
                .priority(99)
                .run_at(run_at)
                .args(args)
                .queue(&queue),
        )
        .await?;

    // assert
    let job = &jobqueue::get_by_queue(&pool, &queue).await?[0];
    assert_eq!(99, job.priority);
    assert_eq!(run_at, job.run_at);
    assert_eq!(args, job.args);
    assert_eq!(queue, job.queue);
    Ok(())
}

#[tokio::test]
async fn enqueue_with_empty_type() -> anyhow::Result<()> {
    // arrange
    let queue = queue_name("enqueue_with_empty_type");
    let Some(pool) = test_pool(&queue).await? else {
        return Ok(());
    };
    let client = JobQueue::new(PgStore::new(pool.clone()));

    // act
    let res = client.enqueue(NewJob::new("").queue(&queue)).await;

    // assert
    assert!(matches!(res, Err(Error::MissingType)));
    assert!(jobqueue::get_by_queue(&pool, &queue).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn enqueue_in_tx_follows_transaction() -> anyhow::Result<()> {
    // arrange
    let queue = queue_name("enqueue_in_tx");
    let Some(pool) = test_pool(&queue).await? else {
        return Ok(());
    };
    let client = JobQueue::new(PgStore::new(pool.clone()));

    // act
    let mut tx = pool.begin().await?;
    client
        .enqueue_in_tx(&mut tx, NewJob::new("rolled_back").queue(&queue))
        .await?;
    tx.rollback().await?;
    let mut tx = pool.begin().await?;
    let job_id = client
        .enqueue_in_tx(&mut tx, NewJob::new("committed").queue(&queue))
        .await?;
    tx.commit().await?;

    // assert
    let jobs = jobqueue::get_by_queue(&pool, &queue).await?;
    assert_eq!(1, jobs.len());
    assert_eq!(job_id, jobs[0].id);
    assert_eq!("committed", jobs[0].job_type);
    Ok(())
}

#[tokio::test]
async fn claim_is_exclusive() -> anyhow::Result<()> {
    // arrange
    let queue = queue_name("claim_is_exclusive");
    let Some(pool) = test_pool(&queue).await? else {
        return Ok(());
    };
    let client = JobQueue::new(PgStore::new(pool.clone()));
    let job_id = client.enqueue(NewJob::new("t").queue(&queue)).await?;

    // act
    let first = client.claim(&queue).await?;
    let second = client.claim(&queue).await?;
    let mut session = client.store().session().await?;
    let visible = session.candidates(&queue, 10).await?;
    let relock = session.try_lock(job_id).await?;

    // assert
    let handle = first.expect("first claim gets the job");
    assert_eq!(job_id, handle.id());
    assert!(second.is_none());
    assert!(visible.is_empty());
    assert!(!relock);
    handle.done().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_claims_have_one_winner() -> anyhow::Result<()> {
    // arrange
    let queue = queue_name("parallel_claims");
    let Some(pool) = test_pool(&queue).await? else {
        return Ok(());
    };
    let client = JobQueue::new(PgStore::new(pool.clone()));
    let job_id = client.enqueue(NewJob::new("t").queue(&queue)).await?;
    let barrier = Arc::new(tokio::sync::Barrier::new(4));

    // act
    let claims: Vec<_> = (0..4)
        .map(|_| {
            let client = client.clone();
            let queue = queue.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                client.claim(&queue).await
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
    for handle in handles {
        handle.done().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_run_each_job_once() -> anyhow::Result<()> {
    // arrange
    let queue = queue_name("concurrent_workers");
    let Some(pool) = test_pool(&queue).await? else {
        return Ok(());
    };
    let runs = Arc::new(Mutex::new(HashMap::<String, usize>::new()));
    let work_map = WorkMap::new().with("t", {
        let runs = Arc::clone(&runs);
        move |args: String| {
            let runs = Arc::clone(&runs);
            async move {
                tokio::task::yield_now().await;
                *runs.lock().expect("runs").entry(args).or_default() += 1;
                Ok::<(), BoxError>(())
            }
        }
    });
    let options = WorkerOptions {
        workers_count: 4,
        queue: queue.clone(),
        idle_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let workers = Arc::new(WorkerPool::new(PgStore::new(pool.clone()), work_map, options));
    for n in 0..50 {
        workers
            .job_queue()
            .enqueue(NewJob::new("t").args(n.to_string()).queue(&queue))
            .await?;
    }

    // act
    let running = tokio::spawn({
        let workers = Arc::clone(&workers);
        async move { workers.run().await }
    });
    for _ in 0..500 {
        if jobqueue::get_by_queue(&pool, &queue).await?.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    workers.shutdown();
    tokio::time::timeout(Duration::from_secs(10), running).await???;

    // assert
    assert!(jobqueue::get_by_queue(&pool, &queue).await?.is_empty());
    let runs = runs.lock().expect("runs");
    assert_eq!(50, runs.len());
    assert!(runs.values().all(|count| *count == 1));
    Ok(())
}

#[tokio::test]
async fn done_deletes_job() -> anyhow::Result<()> {
    // arrange
    let queue = queue_name("done_deletes_job");
    let Some(pool) = test_pool(&queue).await? else {
        return Ok(());
    };
    let client = JobQueue::new(PgStore::new(pool.clone()));
    let job_id = client.enqueue(NewJob::new("t").queue(&queue)).await?;
    let handle = client.claim(&queue).await?.expect("job");

    // act
    handle.done().await?;

    // assert
    assert!(client.get(job_id).await?.is_none());
    assert!(jobqueue::get_by_queue(&pool, &queue).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn error_reschedules_job() -> anyhow::Result<()> {
    // arrange
    let queue = queue_name("error_reschedules_job");
    let Some(pool) = test_pool(&queue).await? else {
        return Ok(());
    };
    let backoff = Backoff::Fixed { delay: 120 };
    let client = JobQueue::new(PgStore::new(pool.clone())).with_backoff(backoff);
    let job_id = client.enqueue(NewJob::new("t").queue(&queue)).await?;
    let handle = client.claim(&queue).await?.expect("job");
    let called_at = db_now(&pool).await?;

    // act
    handle.error("boom").await?;

    // assert
    let job = client.get(job_id).await?.expect("job kept for retry");
    assert_eq!(1, job.error_count);
    assert_eq!(Some("boom".to_owned()), job.last_error);
    assert!(job.run_at >= called_at + chrono::Duration::from_std(backoff.delay(1))?);
    assert!(client.claim(&queue).await?.is_none());
    // the lock is gone: another session can take it
    let mut session = client.store().session().await?;
    assert!(session.try_lock(job_id).await?);
    session.unlock(job_id).await?;
    Ok(())
}

#[tokio::test]
async fn abandoned_handle_is_claimable_again() -> anyhow::Result<()> {
    // arrange
    let queue = queue_name("abandoned_handle");
    let Some(pool) = test_pool(&queue).await? else {
        return Ok(());
    };
    let client = JobQueue::new(PgStore::new(pool.clone()));
    let job_id = client.enqueue(NewJob::new("t").queue(&queue)).await?;
    let handle = client.claim(&queue).await?.expect("job");
    let run_at = handle.run_at();

    // act: the session ends without done/error
    drop(handle);
    let mut reclaimed = None;
    for _ in 0..100 {
        reclaimed = client.claim(&queue).await?;
        if reclaimed.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // assert
    let reclaimed = reclaimed.expect("job claimable after session end");
    assert_eq!(job_id, reclaimed.id());
    assert_eq!(run_at, reclaimed.run_at());
    assert_eq!(0, reclaimed.error_count());
    reclaimed.done().await?;
    Ok(())
}

#[tokio::test]
async fn worker_runs_higher_priority_first() -> anyhow::Result<()> {
    // arrange
    let queue = queue_name("worker_priority");
    let Some(pool) = test_pool(&queue).await? else {
        return Ok(());
    };
    let store = PgStore::new(pool.clone());
    let work_map = WorkMap::new().with("t", |_args| async { Ok::<(), BoxError>(()) });
    let options = WorkerOptions {
        queue: queue.clone(),
        idle_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let workers = WorkerPool::new(store, work_map, options);
    let high = workers
        .job_queue()
        .enqueue(NewJob::new("t").priority(5).queue(&queue))
        .await?;
    let low = workers
        .job_queue()
        .enqueue(NewJob::new("t").priority(10).queue(&queue))
        .await?;

    // act
    assert!(workers.work_one().await?);
    let after_first = jobqueue::get_by_queue(&pool, &queue).await?;
    assert!(workers.work_one().await?);

    // assert
    assert_eq!(vec![low], after_first.iter().map(|j| j.id).collect::<Vec<_>>());
    assert!(workers.job_queue().get(high).await?.is_none());
    assert!(jobqueue::get_by_queue(&pool, &queue).await?.is_empty());
    assert!(!workers.work_one().await?);
    Ok(())
}
