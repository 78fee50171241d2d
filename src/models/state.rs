use dotenv::dotenv;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    Pool, Postgres,
};
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use super::{Backoff, Error, DEFAULT_QUEUE};

#[derive(Debug)]
pub struct AppState {
    pub instance_id: String,
    pub pool: Pool<Postgres>,
    pub worker_options: WorkerOptions,
    pub shutdown_token: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    pub workers_count: usize,
    /// Logical queue the pool claims from.
    pub queue: String,
    /// Sleep between claim attempts while the queue is empty.
    pub idle_interval: Duration,
    pub backoff: Backoff,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            workers_count: 1,
            queue: DEFAULT_QUEUE.to_owned(),
            idle_interval: Duration::from_secs(5),
            backoff: Backoff::default(),
        }
    }
}

impl WorkerOptions {
    /// Reads `PGQUE_WORKERS`, `PGQUE_QUEUE`, `PGQUE_IDLE_MS` and `PGQUE_BACKOFF`.
    pub fn from_env() -> Result<Self, Error> {
        let mut options = WorkerOptions::default();
        if let Ok(val) = std::env::var("PGQUE_WORKERS") {
            options.workers_count = val
                .parse()
                .map_err(|_| Error::InvalidParams("PGQUE_WORKERS"))?;
        }
        if let Ok(val) = std::env::var("PGQUE_QUEUE") {
            options.queue = val;
        }
        if let Ok(val) = std::env::var("PGQUE_IDLE_MS") {
            let ms: u64 = val
                .parse()
                .map_err(|_| Error::InvalidParams("PGQUE_IDLE_MS"))?;
            options.idle_interval = Duration::from_millis(ms);
        }
        if let Ok(val) = std::env::var("PGQUE_BACKOFF") {
            options.backoff = val.parse()?;
        }
        Ok(options)
    }
}

/// `<hostname>:<pid>`, used as the Postgres application name and in logs.
pub fn instance_id() -> String {
    format!("{}:{}", whoami::hostname(), std::process::id())
}

impl AppState {
    pub async fn new(worker_options: WorkerOptions) -> Result<Arc<AppState>, Error> {
        dotenv().ok();
        let instance_id = instance_id();
        let db_url =
            std::env::var("DATABASE_URL").map_err(|_| Error::InvalidParams("DATABASE_URL"))?;
        let conn = PgConnectOptions::from_str(&db_url)?.application_name(&instance_id);

        // one connection per worker is pinned while it holds a job
        let max_connections = u32::try_from(worker_options.workers_count)
            .unwrap_or(u32::MAX)
            .saturating_add(4);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(conn)
            .await?;

        let state = AppState {
            instance_id,
            pool,
            worker_options,
            shutdown_token: CancellationToken::new(),
        };
        Ok(Arc::new(state))
    }
}

#[tokio::test]
async fn worker_options_default() -> anyhow::Result<()> {
    // arrange
    let options = WorkerOptions::default();

    // assert
    assert_eq!(1, options.workers_count);
    assert_eq!("", options.queue);
    assert_eq!(Duration::from_secs(5), options.idle_interval);
    assert_eq!(Backoff::default(), options.backoff);
    Ok(())
}
