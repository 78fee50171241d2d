use futures::future::join_all;
use tokio::{select, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

use crate::{
    db::JobStore,
    models::{self, Error, WorkerOptions},
    services::{jobrunner, JobQueue, WorkMap},
};
use std::sync::Arc;

/// Fixed set of workers, each looping claim, run, resolve against the store.
#[derive(Debug)]
pub struct WorkerPool<S: JobStore> {
    context: Arc<WorkerContext<S>>,
}

#[derive(Debug)]
struct WorkerContext<S: JobStore> {
    instance_id: String,
    job_queue: JobQueue<S>,
    work_map: WorkMap,
    options: WorkerOptions,
    shutdown_token: CancellationToken,
}

impl<S: JobStore> WorkerPool<S> {
    pub fn new(store: S, work_map: WorkMap, options: WorkerOptions) -> Self {
        Self::with_shutdown_token(store, work_map, options, CancellationToken::new())
    }

    pub fn with_shutdown_token(
        store: S,
        work_map: WorkMap,
        options: WorkerOptions,
        shutdown_token: CancellationToken,
    ) -> Self {
        let job_queue = JobQueue::new(store).with_backoff(options.backoff);
        let context = WorkerContext {
            instance_id: models::instance_id(),
            job_queue,
            work_map,
            options,
            shutdown_token,
        };
        Self {
            context: Arc::new(context),
        }
    }

    pub fn job_queue(&self) -> &JobQueue<S> {
        &self.context.job_queue
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.context.shutdown_token.clone()
    }

    /// Stops new claims. Jobs already claimed run to completion.
    pub fn shutdown(&self) {
        self.context.shutdown_token.cancel();
    }

    /// Claims and runs at most one job. Returns `false` when nothing was due.
    pub async fn work_one(&self) -> Result<bool, Error> {
        self.context.work_one().await
    }

    /// Runs the workers until shutdown and waits for their in-flight jobs.
    ///
    /// The shutdown token is cancelled once every worker has stopped, so
    /// whoever waits on it learns that the pool is done.
    pub async fn run(&self) -> Result<(), Error> {
        let res = self.run_workers().await;
        self.context.shutdown_token.cancel();
        res
    }

    async fn run_workers(&self) -> Result<(), Error> {
        let instance_id = &self.context.instance_id;
        let workers_count = self.context.options.workers_count;
        info!({ instance_id, workers_count, queue = self.context.options.queue.as_str() }, "start");
        if workers_count == 0 {
            debug!({ instance_id, workers_count }, "worker_options.workers_count equals to 0");
            return Ok(());
        }

        // spread the first polls over one idle interval
        let stagger = self.context.options.idle_interval / u32::try_from(workers_count).unwrap_or(u32::MAX);
        let mut running_workers: Vec<JoinHandle<()>> = Vec::with_capacity(workers_count);
        for idx in 0..workers_count {
            if self.context.shutdown_token.is_cancelled() {
                break;
            }
            let join_handle = tokio::spawn({
                let context = Arc::clone(&self.context);
                async move { run_worker(context, idx).await }
            });
            running_workers.push(join_handle);
            wait_or_shutdown(stagger, &self.context.shutdown_token).await;
        }

        for res in join_all(running_workers).await {
            if let Err(err) = res {
                error!({ instance_id }, "worker task failed {}", err);
            }
        }
        info!({ instance_id }, "stop");
        Ok(())
    }
}

impl<S: JobStore> WorkerContext<S> {
    async fn work_one(&self) -> Result<bool, Error> {
        let Some(handle) = self.job_queue.claim(&self.options.queue).await? else {
            return Ok(false);
        };
        jobrunner::job_run(&self.instance_id, &self.work_map, handle).await?;
        Ok(true)
    }
}

async fn wait_or_shutdown(period: std::time::Duration, shutdown_token: &CancellationToken) {
    select!(
        biased;
        _ = shutdown_token.cancelled() => {},
        _ = time::sleep(period) => {},
    );
}

async fn run_worker<S: JobStore>(context: Arc<WorkerContext<S>>, idx: usize) {
    let instance_id = &context.instance_id;
    info!({ instance_id, idx }, "run_worker");
    while !context.shutdown_token.is_cancelled() {
        match context.work_one().await {
            Ok(true) => (),
            Ok(false) => {
                wait_or_shutdown(context.options.idle_interval, &context.shutdown_token).await;
            }
            Err(err) => {
                error!({ instance_id, idx }, "error {}", err);
                wait_or_shutdown(context.options.idle_interval, &context.shutdown_token).await;
            }
        }
    }
    info!({ instance_id, idx }, "stop_worker");
}

#[cfg(test)]
fn test_options(workers_count: usize) -> WorkerOptions {
    WorkerOptions {
        workers_count,
        idle_interval: std::time::Duration::from_millis(10),
        ..Default::default()
    }
}

#[cfg(test)]
async fn wait_until(mut done: impl FnMut() -> bool) -> anyhow::Result<()> {
    time::timeout(std::time::Duration::from_secs(5), async {
        while !done() {
            time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn work_one_runs_higher_priority_first() -> anyhow::Result<()> {
    // arrange
    let store = crate::db::MemoryStore::new();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let work_map = WorkMap::new().with("t", {
        let seen = Arc::clone(&seen);
        move |args: String| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().expect("seen").push(args);
                Ok::<(), models::BoxError>(())
            }
        }
    });
    let pool = WorkerPool::new(store.clone(), work_map, test_options(1));
    let queue = pool.job_queue();
    let low = queue
        .enqueue(models::NewJob::new("t").priority(10).args("low"))
        .await?;
    queue
        .enqueue(models::NewJob::new("t").priority(5).args("high"))
        .await?;

    // act
    let first = pool.work_one().await?;
    let remaining: Vec<i64> = store.jobs().iter().map(|j| j.id).collect();
    let second = pool.work_one().await?;
    let third = pool.work_one().await?;

    // assert
    assert!(first && second && !third);
    assert_eq!(vec![low], remaining);
    assert_eq!(vec!["high".to_owned(), "low".to_owned()], *seen.lock().expect("seen"));
    assert!(store.jobs().is_empty());
    Ok(())
}

#[tokio::test]
async fn run_drains_queue_and_stops_on_shutdown() -> anyhow::Result<()> {
    // arrange
    let store = crate::db::MemoryStore::new();
    let work_map = WorkMap::new()
        .with("ok", |_args| async { Ok::<(), models::BoxError>(()) })
        .with("fail", |_args| async {
            Err::<(), models::BoxError>("nope".into())
        });
    let pool = Arc::new(WorkerPool::new(store.clone(), work_map, test_options(3)));
    for _ in 0..20 {
        pool.job_queue().enqueue(models::NewJob::new("ok")).await?;
    }
    let failing = pool.job_queue().enqueue(models::NewJob::new("fail")).await?;

    // act
    let running = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });
    wait_until(|| store.jobs().iter().all(|j| j.error_count > 0)).await?;
    pool.shutdown();
    time::timeout(std::time::Duration::from_secs(5), running).await???;

    // assert
    let jobs = store.jobs();
    assert_eq!(1, jobs.len());
    assert_eq!(failing, jobs[0].id);
    assert_eq!(1, jobs[0].error_count);
    assert!(!store.is_locked(failing));
    Ok(())
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_job() -> anyhow::Result<()> {
    // arrange
    let store = crate::db::MemoryStore::new();
    let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let work_map = WorkMap::new().with("slow", {
        let finished = Arc::clone(&finished);
        move |_args| {
            let finished = Arc::clone(&finished);
            async move {
                time::sleep(std::time::Duration::from_millis(200)).await;
                finished.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<(), models::BoxError>(())
            }
        }
    });
    let pool = Arc::new(WorkerPool::new(store.clone(), work_map, test_options(1)));
    let job_id = pool.job_queue().enqueue(models::NewJob::new("slow")).await?;
    let running = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });
    wait_until(|| store.is_locked(job_id)).await?;

    // act
    pool.shutdown();
    time::timeout(std::time::Duration::from_secs(5), running).await???;

    // assert
    assert!(finished.load(std::sync::atomic::Ordering::SeqCst));
    assert!(store.jobs().is_empty());
    assert!(!store.is_locked(job_id));
    Ok(())
}

#[tokio::test]
async fn run_with_zero_workers_returns() -> anyhow::Result<()> {
    // arrange
    let pool = WorkerPool::new(crate::db::MemoryStore::new(), WorkMap::new(), test_options(0));

    // act
    let res = time::timeout(std::time::Duration::from_secs(1), pool.run()).await?;

    // assert
    assert!(res.is_ok());
    assert!(pool.shutdown_token().is_cancelled());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_run_each_job_once() -> anyhow::Result<()> {
    // arrange
    let store = crate::db::MemoryStore::new();
    let runs = Arc::new(std::sync::Mutex::new(std::collections::HashMap::<String, usize>::new()));
    let work_map = WorkMap::new().with("t", {
        let runs = Arc::clone(&runs);
        move |args: String| {
            let runs = Arc::clone(&runs);
            async move {
                tokio::task::yield_now().await;
                *runs.lock().expect("runs").entry(args).or_default() += 1;
                Ok::<(), models::BoxError>(())
            }
        }
    });
    let pool = Arc::new(WorkerPool::new(store.clone(), work_map, test_options(8)));
    for n in 0..300 {
        pool.job_queue()
            .enqueue(models::NewJob::new("t").args(n.to_string()))
            .await?;
    }

    // act
    let running = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });
    wait_until(|| store.jobs().is_empty()).await?;
    pool.shutdown();
    time::timeout(std::time::Duration::from_secs(5), running).await???;

    // assert
    let runs = runs.lock().expect("runs");
    assert_eq!(300, runs.len());
    assert!(runs.values().all(|count| *count == 1));
    Ok(())
}
