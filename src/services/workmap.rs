use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use futures::{future::BoxFuture, FutureExt, TryFutureExt};

use crate::models::BoxError;

/// Work function: receives the job's args, reports failure through `Err`.
pub type WorkFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Job type to work function registry handed to a worker pool.
#[derive(Clone, Default)]
pub struct WorkMap {
    handlers: HashMap<String, WorkFn>,
}

impl WorkMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut, E>(&mut self, job_type: impl Into<String>, work: F) -> &mut Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let work_fn: WorkFn =
            Arc::new(move |args| work(args).map_err(Into::<BoxError>::into).boxed());
        self.handlers.insert(job_type.into(), work_fn);
        self
    }

    pub fn with<F, Fut, E>(mut self, job_type: impl Into<String>, work: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.register(job_type, work);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<&WorkFn> {
        self.handlers.get(job_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for WorkMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

#[tokio::test]
async fn work_map_dispatches_by_type() -> anyhow::Result<()> {
    // arrange
    let work_map = WorkMap::new()
        .with("ok", |_args| async { Ok::<(), BoxError>(()) })
        .with("echo", |args: String| async move {
            Err::<(), BoxError>(format!("got {args}").into())
        });

    // act
    let ok = work_map.get("ok").expect("ok handler")("[]".into()).await;
    let echo = work_map.get("echo").expect("echo handler")("[1]".into()).await;

    // assert
    assert_eq!(2, work_map.len());
    assert!(ok.is_ok());
    assert_eq!("got [1]", echo.err().map(|e| e.to_string()).unwrap_or_default());
    assert!(work_map.get("missing").is_none());
    Ok(())
}

#[tokio::test]
async fn work_map_accepts_anyhow_errors() -> anyhow::Result<()> {
    // arrange
    let mut work_map = WorkMap::new();
    work_map.register("fails", |_args| async { Err::<(), _>(anyhow::anyhow!("nope")) });

    // act
    let res = work_map.get("fails").expect("handler")("[]".into()).await;

    // assert
    assert_eq!("nope", res.err().map(|e| e.to_string()).unwrap_or_default());
    Ok(())
}
