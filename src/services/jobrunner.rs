use std::{any::Any, panic::AssertUnwindSafe};

use futures::FutureExt;
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

use crate::{
    db::JobSession,
    models::Error,
    services::{JobHandle, WorkMap},
};

/// Runs one claimed job and resolves its handle.
///
/// Work failures, panics and unknown job types are recorded on the job and are
/// not errors here; only store errors from resolving the handle come back.
#[tracing::instrument(name = "job_run", skip_all, fields(job_id = handle.id(), job_type = handle.job_type()))]
pub async fn job_run<S: JobSession>(
    instance_id: &str,
    work_map: &WorkMap,
    handle: JobHandle<S>,
) -> Result<(), Error> {
    let job_id = handle.id();
    let error_count = handle.error_count();
    debug!({ instance_id, job_id, error_count, job_type = handle.job_type() }, "==> run");

    let Some(work) = work_map.get(handle.job_type()) else {
        let err = Error::UnknownJobType(handle.job_type().to_owned());
        warn!({ instance_id, job_id }, "====> error {}", err);
        return handle.error(&err.to_string()).await;
    };

    let res = AssertUnwindSafe(work(handle.args().to_owned()))
        .catch_unwind()
        .await;
    match res {
        Ok(Ok(())) => {
            handle.done().await?;
            debug!({ instance_id, job_id }, "==> done");
        }
        Ok(Err(err)) => {
            info!({ instance_id, job_id, error_count }, "====> error {}", err);
            handle.error(&err.to_string()).await?;
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!({ instance_id, job_id, error_count }, "====> panic {}", message);
            handle.error(&message).await?;
        }
    }
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return format!("panic: {s}");
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return format!("panic: {s}");
    }
    "panic".to_owned()
}

#[cfg(test)]
async fn run_next(
    queue: &crate::services::JobQueue<crate::db::MemoryStore>,
    work_map: &WorkMap,
) -> anyhow::Result<()> {
    let handle = queue.claim("").await?.expect("job to run");
    job_run("test:1", work_map, handle).await?;
    Ok(())
}

#[tokio::test]
async fn job_run_success_deletes_job() -> anyhow::Result<()> {
    // arrange
    let queue = crate::services::JobQueue::new(crate::db::MemoryStore::new());
    let work_map = WorkMap::new().with("t", |args: String| async move {
        assert_eq!(r#"{"n":1}"#, args);
        Ok::<(), crate::models::BoxError>(())
    });
    queue
        .enqueue(crate::models::NewJob::new("t").args(r#"{"n":1}"#))
        .await?;

    // act
    run_next(&queue, &work_map).await?;

    // assert
    assert!(queue.store().jobs().is_empty());
    Ok(())
}

#[tokio::test]
async fn job_run_failure_records_error() -> anyhow::Result<()> {
    // arrange
    let queue = crate::services::JobQueue::new(crate::db::MemoryStore::new());
    let work_map = WorkMap::new().with("t", |_args| async {
        Err::<(), crate::models::BoxError>("disk full".into())
    });
    let job_id = queue.enqueue(crate::models::NewJob::new("t")).await?;

    // act
    run_next(&queue, &work_map).await?;

    // assert
    let job = queue.get(job_id).await?.expect("job kept for retry");
    assert_eq!(1, job.error_count);
    assert_eq!(Some("disk full".to_owned()), job.last_error);
    assert!(!queue.store().is_locked(job_id));
    Ok(())
}

#[tokio::test]
async fn job_run_unknown_type_records_error() -> anyhow::Result<()> {
    // arrange
    let queue = crate::services::JobQueue::new(crate::db::MemoryStore::new());
    let work_map = WorkMap::new();
    let job_id = queue.enqueue(crate::models::NewJob::new("Missing")).await?;

    // act
    run_next(&queue, &work_map).await?;

    // assert
    let job = queue.get(job_id).await?.expect("job kept for retry");
    assert_eq!(1, job.error_count);
    assert_eq!(
        Some("Unknown Job Type - Missing".to_owned()),
        job.last_error
    );
    Ok(())
}

#[tokio::test]
async fn job_run_panic_records_error_and_unlocks() -> anyhow::Result<()> {
    // arrange
    let queue = crate::services::JobQueue::new(crate::db::MemoryStore::new());
    let work_map = WorkMap::new().with("t", |_args| async {
        if true {
            panic!("bad payload");
        }
        Ok::<(), crate::models::BoxError>(())
    });
    let job_id = queue.enqueue(crate::models::NewJob::new("t")).await?;

    // act
    run_next(&queue, &work_map).await?;

    // assert
    let job = queue.get(job_id).await?.expect("job kept for retry");
    assert_eq!(1, job.error_count);
    assert_eq!(Some("panic: bad payload".to_owned()), job.last_error);
    assert!(!queue.store().is_locked(job_id));
    Ok(())
}
