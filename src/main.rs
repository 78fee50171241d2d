use std::{sync::Arc, time::Duration};

use opentelemetry::trace::TracerProvider as _;
use pgque::{
    models::{AppState, Error, WorkerOptions},
    BoxError, NewJob, PgStore, WorkMap, WorkerPool,
};
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let flags = xflags::parse_or_exit! {
        /// Number of concurrent workers.
        optional -w,--workers count: usize
        /// Logical queue to claim from (or enqueue into).
        optional -q,--queue name: String
        /// Sleep between claims while the queue is empty, in milliseconds.
        optional --idle-ms ms: u64
        /// Backoff policy, e.g. `polynomial|4|3`, `fibonacci|15|3600`, `fixed|30`.
        optional --backoff policy: String
        /// Work off every due job, then exit.
        optional --drain
        /// Export spans to stdout through OpenTelemetry.
        optional --trace-stdout
        /// Enqueue one job of this type and exit.
        optional --enqueue job_type: String
        /// Args of the enqueued job.
        optional --args args: String
        /// Priority of the enqueued job, lower runs first.
        optional --priority priority: i16
        /// Delay before the enqueued job becomes due, in seconds.
        optional --delay-secs secs: i64
    };

    // Create a new OpenTelemetry trace pipeline that prints to stdout
    let provider = flags.trace_stdout.then(|| {
        opentelemetry_sdk::trace::TracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build()
    });
    let otel_layer = provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer("pgque")));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pgque=debug".into()),
        )
        .with(otel_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut options = WorkerOptions::from_env()?;
    if let Some(workers) = flags.workers {
        options.workers_count = workers;
    }
    if let Some(queue) = flags.queue {
        options.queue = queue;
    }
    if let Some(ms) = flags.idle_ms {
        options.idle_interval = Duration::from_millis(ms);
    }
    if let Some(backoff) = flags.backoff {
        options.backoff = backoff.parse()?;
    }

    let state = AppState::new(options).await?;
    pgque::db::select_one(&state.pool).await?;

    if let Some(job_type) = flags.enqueue {
        let mut job = NewJob::new(job_type).queue(state.worker_options.queue.clone());
        if let Some(args) = flags.args {
            job = job.args(args);
        }
        if let Some(priority) = flags.priority {
            job = job.priority(priority);
        }
        if let Some(secs) = flags.delay_secs {
            job = job.run_at(chrono::Utc::now() + chrono::Duration::seconds(secs));
        }
        let job_id = pgque::JobQueue::new(PgStore::new(state.pool.clone()))
            .enqueue(job)
            .await?;
        tracing::info!({ instance_id = state.instance_id.as_str(), job_id }, "enqueued");
        return Ok(());
    }

    let pool = WorkerPool::with_shutdown_token(
        PgStore::new(state.pool.clone()),
        work_map(),
        state.worker_options.clone(),
        state.shutdown_token.clone(),
    );
    if flags.drain {
        let mut processed = 0u64;
        while pool.work_one().await? {
            processed += 1;
        }
        tracing::info!({ instance_id = state.instance_id.as_str(), processed }, "drained");
        return Ok(());
    }

    tokio::join!(shutdown_signal(Arc::clone(&state)), pool.run()).1?;

    println!("->> SHUTDOWN");
    Ok(())
}

/// Built-in job types of the daemon.
fn work_map() -> WorkMap {
    WorkMap::new()
        .with("echo", |args: String| async move {
            tracing::info!({ args = args.as_str() }, "echo");
            Ok::<(), BoxError>(())
        })
        .with("sleep", |args: String| async move {
            let ms: u64 = args.trim().parse()?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<(), BoxError>(())
        })
}

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install signal handler {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        // the worker pool stopped on its own
        _ = state.shutdown_token.cancelled() => return,
    }
    state.shutdown_token.cancel();
    tracing::warn!("signal received, starting graceful shutdown");
}
