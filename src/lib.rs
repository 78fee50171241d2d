//! Postgres-backed job queue.
//!
//! Jobs live in one `jobs` table. A worker owns a job while its store session
//! holds the advisory lock keyed by the job id; there is no status column, so a
//! job whose worker dies is claimable again as soon as that session ends.

pub mod db;
pub mod models;
pub mod services;

pub use db::{JobSession, JobStore, MemoryStore, PgStore};
pub use models::{Backoff, BoxError, Error, JobRow, NewJob, WorkerOptions};
pub use services::{JobHandle, JobQueue, WorkMap, WorkerPool};
